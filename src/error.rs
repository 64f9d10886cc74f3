use std::path::PathBuf;
use thiserror::Error;
use vmm_sys_util::errno;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// KVM handle, VM, vCPU, memory or register setup failed.
    #[error("VM initialization failed ({stage}): {source}")]
    Init {
        stage: &'static str,
        #[source]
        source: errno::Error,
    },

    #[error("guest memory error: {0}")]
    GuestMemory(String),

    #[error("cannot load guest image {path:?}: {reason}")]
    ImageLoad { path: PathBuf, reason: String },

    #[error("KVM_RUN failed: {0}")]
    Run(#[source] errno::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("file I/O error: {0}")]
    FileIo(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub fn init(stage: &'static str) -> impl FnOnce(errno::Error) -> Self {
        move |source| Error::Init { stage, source }
    }

    pub fn image_load(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Error::ImageLoad { path: path.into(), reason: reason.to_string() }
    }

    /// Errors that end the owning guest's thread.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Protocol(_) | Error::FileIo(_))
    }
}
