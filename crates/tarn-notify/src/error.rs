use tarn_store::{ErrorKind, StoreError};

/// Errors from queries and notifiers.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The query does not fit the table it runs against.
    #[error("invalid query on {table}: {reason}")]
    InvalidQuery { table: String, reason: String },
}

impl NotifyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(e) => e.kind(),
            Self::InvalidQuery { .. } => ErrorKind::Logic,
        }
    }
}

pub type NotifyResult<T> = Result<T, NotifyError>;
