//! Minimal KVM hypervisor for flat bare-metal guests.
//!
//! Each guest gets its own VM, vCPU and thread. Guests talk to the host over
//! two I/O ports: a byte console and a file-control port whose requests are
//! served from host files, shared read-only between guests and forked into a
//! private copy on the first write.

pub mod config;
pub mod error;
pub mod files;
pub mod protocol;
pub mod types;
pub mod vm_runner;
pub mod vmm;


pub use config::{MachineConfig, MemorySize, PageSize, VmConfig};
pub use error::{Error, Result};
pub use types::{GuestExit, RunResult};
pub use vm_runner::VMRunner;
