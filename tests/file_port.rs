//! Drives the file-control port the way a guest does: request bytes go out
//! one at a time, reply words come back through 32-bit `in` accesses.

use minihv::config::{MachineConfig, MemorySize, PageSize, FILE_PORT};
use minihv::files::{FileEngine, SharedFiles};
use minihv::protocol::{FileHandle, Operation};
use minihv::vmm::devices::{Console, FilePort, PortBus};
use minihv::vmm::memory::GuestMem;
use std::fs;
use std::io;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

const LOREM: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit.\n";
const BUF: u64 = 0x10_0000;

struct Guest {
    bus: PortBus,
    gm: GuestMem,
    tag: String,
}

impl Guest {
    fn new(shared: &Arc<SharedFiles>, private_root: &std::path::Path, tag: &str) -> Self {
        let engine = FileEngine::new(Arc::clone(shared), private_root);
        let bus = PortBus::new(
            &MachineConfig::new(MemorySize::Mib2, PageSize::Small4K),
            Console::new(Box::new(io::empty()), Box::new(io::sink())),
            FilePort::new(engine),
        );
        Self { bus, gm: GuestMem::create(2 << 20).unwrap(), tag: tag.to_string() }
    }

    fn send(&mut self, op: &Operation) {
        for b in op.encode() {
            self.bus.io_out(FILE_PORT, &[b], &self.gm);
        }
    }

    fn word(&mut self) -> u32 {
        let mut w = [0u8; 4];
        self.bus.io_in(FILE_PORT, &mut w);
        u32::from_le_bytes(w)
    }

    fn handle(&mut self) -> FileHandle {
        let hi = self.word();
        let lo = self.word();
        FileHandle::join(hi, lo)
    }

    fn open(&mut self, name: &str, mode: &str) -> FileHandle {
        let tag = self.tag.clone();
        self.send(&Operation::Open { name: name.into(), mode: mode.into(), tag });
        self.handle()
    }

    fn close(&mut self, handle: FileHandle) -> i32 {
        self.send(&Operation::Close { handle, tag: Some(self.tag.clone()) });
        self.word() as i32
    }

    fn read(&mut self, handle: FileHandle, len: u32) -> (u32, FileHandle, Vec<u8>) {
        let tag = self.tag.clone();
        self.send(&Operation::Read { addr: BUF, elem_size: 1, count: len, handle, tag });
        let count = self.word();
        let handle = self.handle();
        let mut data = vec![0u8; count as usize];
        self.gm.read_guest(BUF, &mut data).unwrap();
        (count, handle, data)
    }

    fn write(&mut self, handle: FileHandle, data: &[u8]) -> (u32, FileHandle) {
        self.gm.write_guest(BUF, data).unwrap();
        let tag = self.tag.clone();
        self.send(&Operation::Write { addr: BUF, elem_size: 1, count: data.len() as u32, handle, tag });
        let count = self.word();
        (count, self.handle())
    }
}

fn setup(names: &[&str]) -> (TempDir, Arc<SharedFiles>) {
    let dir = TempDir::new().unwrap();
    for name in names {
        fs::write(dir.path().join(name), LOREM).unwrap();
    }
    let shared = Arc::new(SharedFiles::new(dir.path(), names.iter().copied()));
    (dir, shared)
}

#[test]
fn append_update_session_forks_private_copy() {
    let (dir, shared) = setup(&["lorem1.txt"]);
    let mut g = Guest::new(&shared, dir.path(), "guest1/");

    let h = g.open("lorem1.txt", "a+");
    assert!(!h.is_null());

    let (n, same, data) = g.read(h, 26);
    assert_eq!(n, 26);
    assert_eq!(same, h);
    assert_eq!(data, &LOREM.as_bytes()[..26]);

    let (n, h2) = g.write(h, b"LOREM IPSUM\n");
    assert_eq!(n, 12);
    assert_ne!(h2, h);
    assert_eq!(g.close(h2), 0);
    assert_eq!(g.bus.file.ops(), 4);

    let private = fs::read_to_string(dir.path().join("guest1/lorem1.txt")).unwrap();
    assert_eq!(private, format!("{}LOREM IPSUM\n", &LOREM[..26]));
    assert_eq!(fs::read_to_string(dir.path().join("lorem1.txt")).unwrap(), LOREM);
}

#[test]
fn append_update_session_on_short_file() {
    let (dir, shared) = setup(&["lorem1.txt"]);
    let prior = "Lorem ipsum\n";
    fs::write(dir.path().join("lorem1.txt"), prior).unwrap();
    let mut g = Guest::new(&shared, dir.path(), "guest1/");

    let h = g.open("lorem1.txt", "a+");
    let (n, _, data) = g.read(h, 26);
    assert_eq!(n as usize, prior.len());
    assert_eq!(data, prior.as_bytes());

    let (n, h) = g.write(h, b"LOREM IPSUM\n");
    assert_eq!(n, 12);
    assert_eq!(g.close(h), 0);

    let private = fs::read_to_string(dir.path().join("guest1/lorem1.txt")).unwrap();
    assert_eq!(private, "Lorem ipsum\nLOREM IPSUM\n");
    assert_eq!(fs::read_to_string(dir.path().join("lorem1.txt")).unwrap(), prior);
}

#[test]
fn writer_does_not_disturb_other_guest() {
    let (dir, shared) = setup(&["lorem2.txt"]);
    let mut g1 = Guest::new(&shared, dir.path(), "guest1/");
    let mut g2 = Guest::new(&shared, dir.path(), "guest2/");

    let h1 = g1.open("lorem2.txt", "r+");
    let h2 = g2.open("lorem2.txt", "r");
    let (_, h1) = g1.write(h1, b"XXXX");

    let (n, _, data) = g2.read(h2, LOREM.len() as u32);
    assert_eq!(n as usize, LOREM.len());
    assert_eq!(data, LOREM.as_bytes());
    assert!(g1.bus.file.engine().is_private(h1).unwrap());
    assert!(!g2.bus.file.engine().is_private(h2).unwrap());
    assert!(!dir.path().join("guest2/lorem2.txt").exists());
}

#[test]
fn forked_copy_keeps_the_read_prefix() {
    let (dir, shared) = setup(&["lorem1.txt"]);
    let mut g = Guest::new(&shared, dir.path(), "g/");

    let h = g.open("lorem1.txt", "r+");
    g.read(h, 6);
    let (n, h) = g.write(h, b"IPSUM");
    assert_eq!(n, 5);
    assert_eq!(g.close(h), 0);

    let copy = fs::read_to_string(dir.path().join("g/lorem1.txt")).unwrap();
    assert_eq!(copy, "Lorem IPSUM");
}

#[test]
fn unknown_handle_close_reports_eof() {
    let (dir, shared) = setup(&[]);
    let mut g = Guest::new(&shared, dir.path(), "g/");
    assert_eq!(g.close(FileHandle::new(0x77)), -1);
    let (n, h) = g.write(FileHandle::new(0x77), b"x");
    assert_eq!((n, h), (0, FileHandle::new(0x77)));
}

#[test]
fn concurrent_guests_share_one_file() {
    let (dir, shared) = setup(&["lorem1.txt"]);
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let shared = Arc::clone(&shared);
            let root = dir.path().to_path_buf();
            thread::spawn(move || {
                let mut g = Guest::new(&shared, &root, &format!("guest{}/", i));
                for _ in 0..20 {
                    let h = g.open("lorem1.txt", "r");
                    assert!(!h.is_null());
                    let (n, back, data) = g.read(h, 64);
                    assert_eq!(n as usize, LOREM.len());
                    assert_eq!(back, h);
                    assert_eq!(data, LOREM.as_bytes());
                    assert_eq!(g.close(h), 0);
                }
                g.bus.file.ops()
            })
        })
        .collect();

    for w in workers {
        assert_eq!(w.join().unwrap(), 60);
    }
}
