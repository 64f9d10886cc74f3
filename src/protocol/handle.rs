//! Opaque file handles as they travel over the file port.
//!
//! The guest receives a handle as two 32-bit reads (high word first) and
//! echoes it back as a fixed-width uppercase hex field.

use std::fmt;

/// Capability token naming one open file of one guest. `0` is the null handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(u64);

/// Hex digits used to render a 64-bit guest pointer.
pub const HANDLE_HEX_WIDTH: usize = 16;

impl FileHandle {
    pub const NULL: FileHandle = FileHandle(0);

    pub const fn new(raw: u64) -> Self {
        FileHandle(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// High word, low word.
    pub const fn split(self) -> [u32; 2] {
        [(self.0 >> 32) as u32, self.0 as u32]
    }

    pub const fn join(high: u32, low: u32) -> Self {
        FileHandle(((high as u64) << 32) | low as u64)
    }

    /// Parse the guest's hex rendering. Accepts any width up to 16 digits.
    pub fn parse_hex(field: &str) -> Option<Self> {
        if field.is_empty() || field.len() > HANDLE_HEX_WIDTH {
            return None;
        }
        u64::from_str_radix(field, 16).ok().map(FileHandle)
    }

    pub fn to_hex(self) -> String {
        format!("{:016X}", self.0)
    }
}

impl fmt::Display for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
