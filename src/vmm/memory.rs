use crate::error::{Error, Result};
use super::paging;
use vm_memory::{Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};


const PAGE: u64 = 0x1000;


/// Guest RAM plus the page-table root used to resolve guest pointers.
pub struct GuestMem {
    pub mem: GuestMemoryMmap,
    size: u64,
    cr3: Option<u64>,
}


impl GuestMem {
    /// Zero-filled RAM at guest physical 0.
    pub fn create(size: u64) -> Result<Self> {
        let len: usize = size
            .try_into()
            .map_err(|_| Error::GuestMemory(format!("size {:#x} too big", size)))?;
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), len)])
            .map_err(|e| Error::GuestMemory(e.to_string()))?;
        Ok(Self { mem, size, cr3: None })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Resolve guest pointers through the tables rooted at `cr3` from now on.
    pub fn set_page_table_root(&mut self, cr3: u64) {
        self.cr3 = Some(cr3);
    }

    pub fn host_address(&self) -> Result<u64> {
        self.mem
            .get_host_address(GuestAddress(0))
            .map(|p| p as u64)
            .map_err(|e| Error::GuestMemory(e.to_string()))
    }

    fn to_physical(&self, gva: u64) -> Result<u64> {
        match self.cr3 {
            Some(cr3) => paging::translate(&self.mem, cr3, gva)
                .ok_or_else(|| Error::GuestMemory(format!("unmapped guest address {:#x}", gva))),
            None => Ok(gva),
        }
    }

    /// Split `[gva, gva + len)` at page boundaries and hand each piece's
    /// physical address to `f`.
    fn for_each_chunk(
        &self,
        gva: u64,
        len: usize,
        mut f: impl FnMut(GuestAddress, std::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        gva.checked_add(len as u64)
            .ok_or_else(|| Error::GuestMemory(format!("range at {:#x} overflows", gva)))?;
        let mut done = 0usize;
        while done < len {
            let va = gva + done as u64;
            let in_page = (PAGE - (va & (PAGE - 1))) as usize;
            let n = in_page.min(len - done);
            let pa = self.to_physical(va)?;
            f(GuestAddress(pa), done..done + n)?;
            done += n;
        }
        Ok(())
    }

    /// Copy guest memory at virtual address `gva` into `buf`.
    pub fn read_guest(&self, gva: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.for_each_chunk(gva, len, |pa, range| {
            self.mem
                .read_slice(&mut buf[range], pa)
                .map_err(|e| Error::GuestMemory(e.to_string()))
        })
    }

    /// Copy `data` into guest memory at virtual address `gva`.
    pub fn write_guest(&self, gva: u64, data: &[u8]) -> Result<()> {
        self.for_each_chunk(gva, data.len(), |pa, range| {
            self.mem
                .write_slice(&data[range], pa)
                .map_err(|e| Error::GuestMemory(e.to_string()))
        })
    }

    /// Whether `[gva, gva + len)` is backed by guest RAM.
    pub fn check_range(&self, gva: u64, len: usize) -> bool {
        self.for_each_chunk(gva, len, |pa, range| {
            if self.mem.check_range(pa, range.len()) {
                Ok(())
            } else {
                Err(Error::GuestMemory(String::new()))
            }
        })
        .is_ok()
    }
}
