use tarn_fabric::FabricError;
use tarn_notify::NotifyError;
use tarn_store::{ErrorKind, StoreError};
use tarn_sync::SyncError;

/// Errors from realm and coordinator operations.
#[derive(Debug, thiserror::Error)]
pub enum RealmError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// The file's schema differs and no migration made it match.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The migration callback failed.
    #[error("migration failed: {0}")]
    Migration(#[source] StoreError),

    /// The handle was used from a thread its scheduler does not run on.
    #[error("realm accessed from the wrong thread")]
    WrongThread,

    #[error("realm is closed")]
    Closed,

    #[error("not in a write transaction")]
    NotInWrite,

    #[error("already in a write transaction")]
    AlreadyInWrite,
}

impl RealmError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(err) => err.kind(),
            Self::Notify(err) => err.kind(),
            Self::Sync(err) => err.kind(),
            Self::Fabric(_) => ErrorKind::Io,
            Self::SchemaMismatch(_) | Self::Migration(_) => ErrorKind::SchemaMismatch,
            Self::WrongThread | Self::Closed | Self::NotInWrite | Self::AlreadyInWrite => {
                ErrorKind::Logic
            }
        }
    }
}

/// Convenience alias used throughout the coordinator crate.
pub type RealmResult<T> = std::result::Result<T, RealmError>;
