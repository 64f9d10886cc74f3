//! Host file access on behalf of guests.

pub mod engine;
pub mod mode;
pub mod shared;

pub use engine::FileEngine;
pub use mode::OpenMode;
pub use shared::SharedFiles;
