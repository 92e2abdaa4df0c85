use tarn_store::{ErrorKind, StoreError};

use crate::state::SessionState;

/// Errors from sync session operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The requested lifecycle change is not valid from the current state.
    #[error("cannot {action} a session that is {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    /// The operation needs a connected session.
    #[error("session is {0}, not connected")]
    NotConnected(SessionState),

    /// A remote record does not match local state.
    #[error("merge conflict on {table}: {reason}")]
    MergeConflict { table: String, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MergeConflict { .. } => ErrorKind::MergeConflict,
            Self::Store(err) => err.kind(),
            Self::InvalidTransition { .. } | Self::NotConnected(_) => ErrorKind::Logic,
        }
    }
}

/// Convenience alias used throughout the sync crate.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
