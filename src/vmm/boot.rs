use crate::error::{Error, Result};
use log::debug;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};


/// Images are copied into guest memory this many bytes at a time.
pub const LOAD_CHUNK: usize = 1024;


#[derive(Debug)]
pub struct BootInfo { pub entry: GuestAddress, pub image_len: u64 }


/// Copy a flat binary to guest physical 0. `limit` is the first byte the
/// image must not reach (the paging structures live there).
pub fn load_image(gm: &GuestMemoryMmap, image_path: &Path, limit: u64) -> Result<BootInfo> {
    let mut image = File::open(image_path).map_err(|e| Error::image_load(image_path, e))?;
    let image_len = load_from(gm, &mut image, limit).map_err(|e| match e {
        Error::FileIo(io) => Error::image_load(image_path, io),
        Error::GuestMemory(msg) => Error::image_load(image_path, msg),
        other => other,
    })?;
    debug!("loaded {} bytes from {}", image_len, image_path.display());
    Ok(BootInfo { entry: GuestAddress(0), image_len })
}


fn load_from<R: Read>(gm: &GuestMemoryMmap, src: &mut R, limit: u64) -> Result<u64> {
    let mut chunk = [0u8; LOAD_CHUNK];
    let mut addr = 0u64;
    loop {
        let n = match src.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if addr + n as u64 > limit {
            return Err(Error::GuestMemory(format!(
                "image does not fit below {:#x}",
                limit
            )));
        }
        gm.write_slice(&chunk[..n], GuestAddress(addr))
            .map_err(|e| Error::GuestMemory(e.to_string()))?;
        addr += n as u64;
    }
    Ok(addr)
}
