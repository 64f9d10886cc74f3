use serde::{Deserialize, Serialize};
use std::fmt;


/// Why a guest's exit loop reached the stopped state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GuestExit {
    Halted,
    Shutdown,
    InternalError { suberror: u32 },
    FailEntry { reason: u64 },
    /// The machine never ran or its run loop aborted.
    Failed { error: String },
}

impl GuestExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, GuestExit::Halted)
    }
}

impl fmt::Display for GuestExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuestExit::Halted => write!(f, "halted"),
            GuestExit::Shutdown => write!(f, "shutdown"),
            GuestExit::InternalError { suberror } => {
                write!(f, "internal error, suberror = {:#x}", suberror)
            }
            GuestExit::FailEntry { reason } => write!(f, "entry failure, reason = {:#x}", reason),
            GuestExit::Failed { error } => write!(f, "failed: {}", error),
        }
    }
}


/// Summary of one guest machine's run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunResult {
    pub guest: String,
    pub exit: GuestExit,
    pub exits_handled: u64,
    pub file_ops: u64,
}
