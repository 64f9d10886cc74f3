use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Port the guest writes console bytes to (Bochs/QEMU debug port).
pub const CONSOLE_PORT: u16 = 0xE9;
/// Port carrying the file-control protocol.
pub const FILE_PORT: u16 = 0x0278;

const MIB: u64 = 1024 * 1024;

/// Guest RAM sizes accepted by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemorySize {
    Mib2,
    Mib4,
    Mib8,
}

impl MemorySize {
    pub fn from_mib(mib: u32) -> Option<Self> {
        match mib {
            2 => Some(Self::Mib2),
            4 => Some(Self::Mib4),
            8 => Some(Self::Mib8),
            _ => None,
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            Self::Mib2 => 2 * MIB,
            Self::Mib4 => 4 * MIB,
            Self::Mib8 => 8 * MIB,
        }
    }
}

/// Granularity of the guest's identity mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSize {
    /// 2 MiB large pages mapped straight from the page directory.
    Large2M,
    /// 4 KiB pages through one page table per 2 MiB chunk.
    Small4K,
}

impl PageSize {
    /// CLI selector: `2` picks 2 MiB pages, `4` picks 4 KiB pages.
    pub fn from_selector(sel: u32) -> Option<Self> {
        match sel {
            2 => Some(Self::Large2M),
            4 => Some(Self::Small4K),
            _ => None,
        }
    }

    pub fn bytes(self) -> u64 {
        match self {
            Self::Large2M => 2 * MIB,
            Self::Small4K => 4 * 1024,
        }
    }
}

/// Per-machine settings shared by every guest launched from one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub memory: MemorySize,
    pub page_size: PageSize,
    pub console_port: u16,
    pub file_port: u16,
}

impl MachineConfig {
    pub fn new(memory: MemorySize, page_size: PageSize) -> Self {
        Self { memory, page_size, console_port: CONSOLE_PORT, file_port: FILE_PORT }
    }
}

/// Everything needed to launch a batch of guests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub machine: MachineConfig,
    /// One flat binary per guest machine.
    pub guests: Vec<PathBuf>,
    /// Filenames every guest reads in common (copy-on-write on first write).
    pub shared_files: Vec<String>,
    /// Root under which guest-private files are created.
    pub private_dir: PathBuf,
}

impl VmConfig {
    pub fn new(memory: MemorySize, page_size: PageSize) -> Self {
        Self {
            machine: MachineConfig::new(memory, page_size),
            guests: Vec::new(),
            shared_files: Vec::new(),
            private_dir: PathBuf::from("."),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.guests.is_empty() {
            return Err(Error::Config("at least one guest image is required".into()));
        }
        let mut seen = HashSet::new();
        for guest in &self.guests {
            if !seen.insert(guest) {
                return Err(Error::Config(format!(
                    "guest {} listed more than once",
                    guest.display()
                )));
            }
        }
        Ok(())
    }
}
