//! Paravirtual file-port wire protocol.

pub mod codec;
pub mod handle;

pub use codec::{FrameAssembler, Opcode, Operation, RawFrame, Reply, ReplyQueue};
pub use handle::FileHandle;
