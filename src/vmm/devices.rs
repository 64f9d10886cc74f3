use crate::config::MachineConfig;
use crate::error::Error;
use crate::files::FileEngine;
use crate::protocol::{FrameAssembler, Operation, RawFrame, Reply, ReplyQueue};
use super::memory::GuestMem;
use log::{debug, warn};
use std::io::{self, Read, Write};


/// Byte-wide console: `out` goes to the host writer, `in` reads one byte
/// from the host reader (blocking the guest's thread).
pub struct Console {
    input: Box<dyn Read + Send>,
    output: Box<dyn Write + Send>,
}


impl Console {
    pub fn new(input: Box<dyn Read + Send>, output: Box<dyn Write + Send>) -> Self {
        Self { input, output }
    }

    pub fn stdio() -> Self {
        Self::new(Box::new(io::stdin()), Box::new(io::stdout()))
    }

    pub fn io_out(&mut self, data: &[u8]) {
        let Some(&byte) = data.first() else { return };
        if let Err(e) = self.output.write_all(&[byte]).and_then(|_| self.output.flush()) {
            warn!("console write failed: {}", e);
        }
    }

    /// End of input reads as 0.
    pub fn io_in(&mut self, data: &mut [u8]) {
        let mut byte = [0u8; 1];
        match self.input.read(&mut byte) {
            Ok(1) => {}
            Ok(_) => debug!("console input exhausted"),
            Err(e) => warn!("console read failed: {}", e),
        }
        data.fill(0);
        if let Some(first) = data.first_mut() {
            *first = byte[0];
        }
    }
}


/// The file-control port: frames requests from `out` bytes, runs them
/// against the guest's [`FileEngine`] and serves the reply words to `in`.
pub struct FilePort {
    assembler: FrameAssembler,
    engine: FileEngine,
    replies: ReplyQueue,
    ops: u64,
}


impl FilePort {
    pub fn new(engine: FileEngine) -> Self {
        Self { assembler: FrameAssembler::new(), engine, replies: ReplyQueue::new(), ops: 0 }
    }

    pub fn engine(&self) -> &FileEngine {
        &self.engine
    }

    /// Operations executed so far.
    pub fn ops(&self) -> u64 {
        self.ops
    }

    pub fn pending_words(&self) -> usize {
        self.replies.len()
    }

    pub fn io_out(&mut self, data: &[u8], gm: &GuestMem) {
        for &byte in data {
            if let Some(frame) = self.assembler.push(byte) {
                self.dispatch(frame, gm);
            }
        }
    }

    pub fn io_in(&mut self, data: &mut [u8]) {
        if !self.replies.fill(data) {
            debug!("file port read with no reply pending");
        }
    }

    fn dispatch(&mut self, frame: Result<RawFrame, Error>, gm: &GuestMem) {
        let stale = self.replies.clear();
        if stale > 0 {
            warn!("discarding {} undelivered reply words", stale);
        }

        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping file port frame: {}", e);
                return;
            }
        };
        let reply = match Operation::decode(&frame) {
            Ok(op) => {
                self.ops += 1;
                self.engine.execute(&op, gm)
            }
            Err(bad) => {
                warn!("{}", Error::from(bad.clone()));
                match bad.opcode {
                    Some(opcode) => Reply::failure(opcode, bad.handle),
                    None => return,
                }
            }
        };
        self.replies.push(&reply);
    }
}


/// Routes port I/O exits to the console and file devices.
pub struct PortBus {
    console_port: u16,
    file_port: u16,
    pub console: Console,
    pub file: FilePort,
}


impl PortBus {
    pub fn new(machine: &MachineConfig, console: Console, file: FilePort) -> Self {
        Self { console_port: machine.console_port, file_port: machine.file_port, console, file }
    }

    pub fn io_out(&mut self, port: u16, data: &[u8], gm: &GuestMem) {
        if port == self.console_port {
            self.console.io_out(data);
        } else if port == self.file_port {
            self.file.io_out(data, gm);
        } else {
            debug!("ignoring out to port {:#x}: {:?}", port, data);
        }
    }

    pub fn io_in(&mut self, port: u16, data: &mut [u8]) {
        if port == self.console_port {
            self.console.io_in(data);
        } else if port == self.file_port {
            self.file.io_in(data);
        } else {
            debug!("ignoring in from port {:#x}", port);
            data.fill(0xff);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemorySize, PageSize};
    use crate::files::SharedFiles;
    use crate::protocol::FileHandle;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Writer whose contents the test can inspect afterwards.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn bus(dir: &TempDir, input: &'static [u8], out: Sink) -> PortBus {
        let engine = FileEngine::new(Arc::new(SharedFiles::new(dir.path(), ["s.txt"])), dir.path());
        PortBus::new(
            &MachineConfig::new(MemorySize::Mib2, PageSize::Small4K),
            Console::new(Box::new(input), Box::new(out)),
            FilePort::new(engine),
        )
    }

    fn read_word(bus: &mut PortBus) -> u32 {
        let mut w = [0u8; 4];
        bus.io_in(0x278, &mut w);
        u32::from_le_bytes(w)
    }

    #[test]
    fn console_bytes_pass_through() {
        let dir = TempDir::new().unwrap();
        let gm = GuestMem::create(2 << 20).unwrap();
        let out = Sink::default();
        let mut bus = bus(&dir, b"ok", out.clone());

        for &b in b"hi\n" {
            bus.io_out(0xE9, &[b], &gm);
        }
        assert_eq!(&*out.0.lock(), b"hi\n");

        let mut c = [0u8; 1];
        bus.io_in(0xE9, &mut c);
        assert_eq!(c[0], b'o');
        bus.io_in(0xE9, &mut c);
        bus.io_in(0xE9, &mut c);
        assert_eq!(c[0], 0);
    }

    #[test]
    fn open_reply_is_drained_high_word_first() {
        let dir = TempDir::new().unwrap();
        let gm = GuestMem::create(2 << 20).unwrap();
        let mut bus = bus(&dir, b"", Sink::default());

        for &b in b"0#out.txt#w#guest9/##" {
            bus.io_out(0x278, &[b], &gm);
        }
        assert_eq!(bus.file.pending_words(), 2);
        let handle = FileHandle::join(read_word(&mut bus), read_word(&mut bus));
        assert!(!handle.is_null());
        assert!(dir.path().join("guest9/out.txt").exists());
        assert_eq!(bus.file.ops(), 1);
    }

    #[test]
    fn malformed_request_gets_failure_shaped_reply() {
        let dir = TempDir::new().unwrap();
        let gm = GuestMem::create(2 << 20).unwrap();
        let mut bus = bus(&dir, b"", Sink::default());

        bus.io_out(0x278, b"1#nothex#g/##", &gm);
        assert_eq!(bus.file.pending_words(), 1);
        assert_eq!(read_word(&mut bus), u32::MAX);

        bus.io_out(0x278, b"7#what##", &gm);
        assert_eq!(bus.file.pending_words(), 0);
        assert_eq!(bus.file.ops(), 0);
    }

    #[test]
    fn new_request_discards_undrained_words() {
        let dir = TempDir::new().unwrap();
        let gm = GuestMem::create(2 << 20).unwrap();
        let mut bus = bus(&dir, b"", Sink::default());

        bus.io_out(0x278, b"0#a.txt#w#g/##", &gm);
        bus.io_out(0x278, b"1#0000000000000001#g/##", &gm);
        assert_eq!(bus.file.pending_words(), 1);
        assert_eq!(read_word(&mut bus), 0);
    }

    #[test]
    fn unknown_ports_read_all_ones() {
        let dir = TempDir::new().unwrap();
        let mut bus = bus(&dir, b"", Sink::default());
        let mut w = [0u8; 2];
        bus.io_in(0x80, &mut w);
        assert_eq!(w, [0xff, 0xff]);
    }
}
