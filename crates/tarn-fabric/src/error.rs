use std::io;
use std::path::PathBuf;

/// Errors produced by commit signalling and schedulers.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// I/O error on a notification channel.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// No usable notification pipe could be created for the file.
    #[error("cannot create notification pipe for {path}: {reason}")]
    NotificationPipe { path: PathBuf, reason: String },

    /// The scheduler's thread has stopped and accepts no more work.
    #[error("scheduler is shut down")]
    Shutdown,
}

/// Convenience alias used throughout the fabric crate.
pub type FabricResult<T> = std::result::Result<T, FabricError>;
