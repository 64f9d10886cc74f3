//! Identity-mapped long-mode page tables for flat guests.
//!
//! Layout in guest physical memory:
//!
//! ```text
//! 0x1000  PML4      one entry -> PDPT
//! 0x2000  PDPT      one entry -> PD
//! 0x3000  PD        2 MiB leaves, or one entry per 2 MiB chunk -> PT
//! 0x4000  PT[0..n]  4 KiB leaves (4 KiB mode only), one table per 2 MiB
//! ```

use crate::config::PageSize;
use crate::error::{Error, Result};
use kvm_bindings::kvm_segment;
use log::warn;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

pub const PML4_START: u64 = 0x1000;
pub const PDPT_START: u64 = 0x2000;
pub const PD_START: u64 = 0x3000;
pub const PT_START: u64 = 0x4000;

const PDE64_PRESENT: u64 = 1;
const PDE64_RW: u64 = 1 << 1;
const PDE64_USER: u64 = 1 << 2;
const PDE64_PS: u64 = 1 << 7;
const PDE64_FLAGS: u64 = PDE64_PRESENT | PDE64_RW | PDE64_USER;

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;
const LARGE_ADDR_MASK: u64 = 0x000f_ffff_ffe0_0000;

const TABLE_SIZE: u64 = 0x1000;
const ENTRIES_PER_TABLE: u64 = 512;
const LARGE_PAGE: u64 = 2 << 20;
const SMALL_PAGE: u64 = 0x1000;

/// The page directory only ever receives this many 2 MiB leaves, so large
/// page mode maps at most 8 MiB.
pub const MAX_LARGE_PAGES: u64 = 4;

pub const X86_CR0_PE: u64 = 0x1;
pub const X86_CR0_PG: u64 = 0x8000_0000;
pub const X86_CR4_PAE: u64 = 0x20;
pub const EFER_LME: u64 = 0x100;
pub const EFER_LMA: u64 = 0x400;

const CODE_SELECTOR: u16 = 1 << 3;
const DATA_SELECTOR: u16 = 2 << 3;

/// Register state that turns the loaded tables on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongModeRegs {
    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
}

/// Result of writing the hierarchy into guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTables {
    pub regs: LongModeRegs,
    /// Bytes of guest physical memory reachable through the tables.
    pub mapped: u64,
    /// First guest physical byte past the last paging structure.
    pub end: u64,
}

fn write_entry(mem: &GuestMemoryMmap, table: u64, index: u64, entry: u64) -> Result<()> {
    mem.write_obj(entry, GuestAddress(table + index * 8)).map_err(|e| {
        Error::GuestMemory(format!("page table entry at {:#x}[{}]: {}", table, index, e))
    })
}

/// Write the paging hierarchy covering `mem_size` bytes of guest memory.
pub fn setup_page_tables(
    mem: &GuestMemoryMmap,
    mem_size: u64,
    page_size: PageSize,
) -> Result<PageTables> {
    write_entry(mem, PML4_START, 0, PDPT_START | PDE64_FLAGS)?;
    write_entry(mem, PDPT_START, 0, PD_START | PDE64_FLAGS)?;

    let chunks = mem_size / LARGE_PAGE;
    let (mapped, end) = match page_size {
        PageSize::Large2M => {
            let leaves = chunks.min(MAX_LARGE_PAGES);
            if chunks > MAX_LARGE_PAGES {
                warn!(
                    "2 MiB paging maps only the first {} MiB of {} MiB",
                    (MAX_LARGE_PAGES * LARGE_PAGE) >> 20,
                    mem_size >> 20
                );
            }
            for i in 0..leaves {
                write_entry(mem, PD_START, i, (i * LARGE_PAGE) | PDE64_FLAGS | PDE64_PS)?;
            }
            (leaves * LARGE_PAGE, PD_START + TABLE_SIZE)
        }
        PageSize::Small4K => {
            let mut page = 0u64;
            for i in 0..chunks {
                let pt = PT_START + i * TABLE_SIZE;
                write_entry(mem, PD_START, i, pt | PDE64_FLAGS)?;
                for j in 0..ENTRIES_PER_TABLE {
                    write_entry(mem, pt, j, page | PDE64_FLAGS)?;
                    page += SMALL_PAGE;
                }
            }
            (page, PT_START + chunks * TABLE_SIZE)
        }
    };

    Ok(PageTables {
        regs: LongModeRegs {
            cr0: X86_CR0_PE | X86_CR0_PG,
            cr3: PML4_START,
            cr4: X86_CR4_PAE,
            efer: EFER_LME | EFER_LMA,
        },
        mapped,
        end,
    })
}

/// Flat 64-bit code segment: base 0, page granular, ring 0.
pub fn code_segment() -> kvm_segment {
    kvm_segment {
        base: 0,
        limit: 0xffff_ffff,
        selector: CODE_SELECTOR,
        type_: 11, // execute/read, accessed
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 1,
        g: 1,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// Data segment matching [`code_segment`], used for DS/ES/FS/GS/SS.
pub fn data_segment() -> kvm_segment {
    kvm_segment {
        selector: DATA_SELECTOR,
        type_: 3, // read/write, accessed
        ..code_segment()
    }
}

/// Walk the guest's tables rooted at `cr3` and return the physical address
/// backing `gva`, or `None` if any level is not present.
pub fn translate(mem: &GuestMemoryMmap, cr3: u64, gva: u64) -> Option<u64> {
    let read = |table: u64, index: u64| -> Option<u64> {
        let entry: u64 = mem.read_obj(GuestAddress(table + index * 8)).ok()?;
        (entry & PDE64_PRESENT != 0).then_some(entry)
    };

    let pml4e = read(cr3 & ADDR_MASK, (gva >> 39) & 0x1ff)?;
    let pdpte = read(pml4e & ADDR_MASK, (gva >> 30) & 0x1ff)?;
    let pde = read(pdpte & ADDR_MASK, (gva >> 21) & 0x1ff)?;
    if pde & PDE64_PS != 0 {
        return Some((pde & LARGE_ADDR_MASK) | (gva & (LARGE_PAGE - 1)));
    }
    let pte = read(pde & ADDR_MASK, (gva >> 12) & 0x1ff)?;
    Some((pte & ADDR_MASK) | (gva & (SMALL_PAGE - 1)))
}
