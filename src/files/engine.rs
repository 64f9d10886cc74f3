//! Per-guest file state behind the file port.
//!
//! Shared names open the real host file and track a cursor per handle. The
//! first write through such a handle forks a private copy of the bytes the
//! handle has read so far, and the guest gets a new handle for the copy.
//! Every other name maps to a guest-private path from the start.

use super::mode::OpenMode;
use super::shared::SharedFiles;
use crate::error::{Error, Result};
use crate::protocol::codec::CLOSE_FAILED;
use crate::protocol::{FileHandle, Operation, Reply};
use crate::vmm::memory::GuestMem;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

struct FileRecord {
    file: File,
    /// Name as the guest asked for it.
    name: String,
    path: PathBuf,
    mode: OpenMode,
    /// Position of this handle in the shared file. Unused once private.
    cursor: u64,
    /// Set when the handle refers to a private file (created private, or
    /// promoted by a first write).
    private: bool,
}

pub struct FileEngine {
    shared: Arc<SharedFiles>,
    private_root: PathBuf,
    records: HashMap<FileHandle, FileRecord>,
    next_handle: u64,
}

impl FileEngine {
    pub fn new(shared: Arc<SharedFiles>, private_root: impl Into<PathBuf>) -> Self {
        Self {
            shared,
            private_root: private_root.into(),
            records: HashMap::new(),
            next_handle: 1,
        }
    }

    pub fn open_handles(&self) -> usize {
        self.records.len()
    }

    /// `Some(true)` if `handle` refers to a private file.
    pub fn is_private(&self, handle: FileHandle) -> Option<bool> {
        self.records.get(&handle).map(|r| r.private)
    }

    /// Carry out one request against the host filesystem and guest memory.
    /// Failures are folded into the reply.
    pub fn execute(&mut self, op: &Operation, gm: &GuestMem) -> Reply {
        match op {
            Operation::Open { name, mode, tag } => Reply::Handle(self.open(name, mode, tag)),
            Operation::Close { handle, .. } => Reply::Status(self.close(*handle)),
            Operation::Read { addr, elem_size, count, handle, .. } => {
                let count = self.read(*handle, *addr, *elem_size, *count, gm);
                Reply::Transfer { count, handle: *handle }
            }
            Operation::Write { addr, elem_size, count, handle, tag } => {
                let (count, handle) = self.write(*handle, *addr, *elem_size, *count, tag, gm);
                Reply::Transfer { count, handle }
            }
        }
    }

    fn insert(&mut self, record: FileRecord) -> FileHandle {
        let handle = FileHandle::new(self.next_handle);
        self.next_handle += 1;
        self.records.insert(handle, record);
        handle
    }

    fn open(&mut self, name: &str, mode_str: &str, tag: &str) -> FileHandle {
        let Some(mode) = OpenMode::parse(mode_str) else {
            warn!("open {:?}: unsupported mode {:?}", name, mode_str);
            return FileHandle::NULL;
        };

        if self.shared.contains(name) {
            let path = self.shared.path(name);
            let opened = {
                let _gate = self.shared.lock(name);
                // The original is only ever read through a shared handle.
                File::open(&path)
            };
            match opened {
                Ok(file) => {
                    let handle = self.insert(FileRecord {
                        file,
                        name: name.to_owned(),
                        path,
                        mode,
                        cursor: 0,
                        private: false,
                    });
                    debug!("open shared {} ({}) -> {}", name, mode_str, handle);
                    return handle;
                }
                // Nothing to share yet: a creating mode starts a private file.
                Err(e) if e.kind() == ErrorKind::NotFound && mode.creates() => {
                    info!("shared {} does not exist, creating it privately for {}", path.display(), tag);
                }
                Err(e) => {
                    warn!("open shared {}: {}", path.display(), e);
                    return FileHandle::NULL;
                }
            }
        }

        match self.open_private(tag, name, &mode.options()) {
            Ok((file, path)) => {
                let handle = self.insert(FileRecord {
                    file,
                    name: name.to_owned(),
                    path,
                    mode,
                    cursor: 0,
                    private: true,
                });
                debug!("open private {} ({}) -> {}", name, mode_str, handle);
                handle
            }
            Err(e) => {
                warn!("open {}{}: {}", tag, name, e);
                FileHandle::NULL
            }
        }
    }

    fn open_private(&self, tag: &str, name: &str, opts: &OpenOptions) -> Result<(File, PathBuf)> {
        let path = private_path(&self.private_root, tag, name)?;
        refuse_shared(&self.shared, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = opts.open(&path)?;
        Ok((file, path))
    }

    fn close(&mut self, handle: FileHandle) -> i32 {
        match self.records.remove(&handle) {
            Some(record) => {
                debug!("close {} ({})", handle, record.name);
                0
            }
            None => {
                warn!("close: unknown handle {}", handle);
                CLOSE_FAILED
            }
        }
    }

    fn read(&mut self, handle: FileHandle, addr: u64, elem_size: u32, count: u32, gm: &GuestMem) -> u32 {
        let Some(len) = transfer_len(elem_size, count, gm, addr) else {
            return 0;
        };
        let shared = Arc::clone(&self.shared);
        let Some(record) = self.records.get_mut(&handle) else {
            warn!("read: unknown handle {}", handle);
            return 0;
        };
        if !record.mode.readable() {
            return 0;
        }

        let mut buf = vec![0u8; len];
        let got = if record.private {
            read_full(&mut record.file, &mut buf)
        } else {
            let _gate = shared.lock(&record.name);
            let got = record
                .file
                .seek(SeekFrom::Start(record.cursor))
                .and_then(|_| read_full(&mut record.file, &mut buf));
            if let Ok(n) = got {
                record.cursor += n as u64;
            }
            got
        };

        let n = match got {
            Ok(n) => n,
            Err(e) => {
                warn!("read {} ({}): {}", handle, record.name, e);
                return 0;
            }
        };
        if let Err(e) = gm.write_guest(addr, &buf[..n]) {
            warn!("read {}: {}", handle, e);
            return 0;
        }
        (n / elem_size as usize) as u32
    }

    fn write(
        &mut self,
        handle: FileHandle,
        addr: u64,
        elem_size: u32,
        count: u32,
        tag: &str,
        gm: &GuestMem,
    ) -> (u32, FileHandle) {
        let Some(len) = transfer_len(elem_size, count, gm, addr) else {
            return (0, handle);
        };
        let Some(record) = self.records.get(&handle) else {
            warn!("write: unknown handle {}", handle);
            return (0, handle);
        };
        if !record.mode.writable() {
            return (0, handle);
        }
        let mut data = vec![0u8; len];
        if let Err(e) = gm.read_guest(addr, &mut data) {
            warn!("write {}: {}", handle, e);
            return (0, handle);
        }

        let handle = if record.private {
            handle
        } else {
            match self.promote(handle, tag) {
                Ok(new_handle) => new_handle,
                Err(e) => {
                    warn!("copy-on-write of {} failed: {}", handle, e);
                    return (0, handle);
                }
            }
        };

        let Some(record) = self.records.get_mut(&handle) else {
            return (0, handle);
        };
        match write_full(&mut record.file, &data) {
            Ok(n) => ((n / elem_size as usize) as u32, handle),
            Err((n, e)) => {
                warn!("write {} ({}): {}", handle, record.name, e);
                ((n / elem_size as usize) as u32, handle)
            }
        }
    }

    /// Fork the shared file behind `handle` into the guest's private path,
    /// keeping the bytes before this handle's cursor. The shared handle is
    /// closed and replaced by a new one.
    fn promote(&mut self, handle: FileHandle, tag: &str) -> Result<FileHandle> {
        let shared = Arc::clone(&self.shared);
        let record = self
            .records
            .get_mut(&handle)
            .ok_or_else(|| Error::Protocol(format!("unknown handle {}", handle)))?;
        let _gate = shared.lock(&record.name);

        let path = private_path(&self.private_root, tag, &record.name)?;
        refuse_shared(&shared, &path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut copy = record.mode.copy_options().open(&path)?;
        copy.set_len(0)?;
        record.file.seek(SeekFrom::Start(0))?;
        let copied = io::copy(&mut (&record.file).take(record.cursor), &mut copy)?;
        copy.flush()?;

        info!(
            "copy-on-write: {} -> {} ({} bytes kept)",
            record.path.display(),
            path.display(),
            copied
        );
        let old = self
            .records
            .remove(&handle)
            .ok_or_else(|| Error::Protocol(format!("unknown handle {}", handle)))?;
        Ok(self.insert(FileRecord {
            file: copy,
            name: old.name,
            path,
            mode: old.mode,
            cursor: 0,
            private: true,
        }))
    }
}

/// Bytes moved by a transfer of `count` elements of `elem_size`, or `None`
/// if nothing should move.
fn transfer_len(elem_size: u32, count: u32, gm: &GuestMem, addr: u64) -> Option<usize> {
    let len = u64::from(elem_size) * u64::from(count);
    if len == 0 {
        return None;
    }
    let len = usize::try_from(len).ok()?;
    if !gm.check_range(addr, len) {
        warn!("transfer of {} bytes at {:#x} leaves guest memory", len, addr);
        return None;
    }
    Some(len)
}

/// `<root>/<tag><name>`; the tag carries its own separator (e.g. `guest1/`).
/// The tag must name at least one directory level and neither part may
/// climb, restart at the root, or be made only of `.`.
pub fn private_path(root: &Path, tag: &str, name: &str) -> Result<PathBuf> {
    let rel = PathBuf::from(format!("{}{}", tag, name));
    let tag_named = Path::new(tag).components().any(|c| matches!(c, Component::Normal(_)));
    let confined = tag_named
        && !name.is_empty()
        && rel.components().all(|c| matches!(c, Component::Normal(_)));
    if !confined {
        return Err(Error::Protocol(format!("private path {:?} escapes its directory", rel)));
    }
    Ok(root.join(rel))
}

/// A private path must never land on a shared original.
fn refuse_shared(shared: &SharedFiles, path: &Path) -> Result<()> {
    if shared.covers(path) {
        return Err(Error::Protocol(format!("private path {} is a shared original", path.display())));
    }
    Ok(())
}

fn read_full<R: Read>(src: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match src.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn write_full<W: Write>(dst: &mut W, data: &[u8]) -> std::result::Result<usize, (usize, io::Error)> {
    let mut done = 0;
    while done < data.len() {
        match dst.write(&data[done..]) {
            Ok(0) => return Err((done, ErrorKind::WriteZero.into())),
            Ok(n) => done += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err((done, e)),
        }
    }
    Ok(done)
}
