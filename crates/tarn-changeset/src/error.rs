//! Error types for the changeset crate.

use tarn_types::Version;

/// Errors that can occur while encoding, folding, or replaying changesets.
#[derive(Debug, thiserror::Error)]
pub enum ChangesetError {
    /// The requested range is inverted.
    #[error("invalid changeset range: {from} > {to}")]
    InvalidRange { from: Version, to: Version },

    /// A transaction log is missing from the folded range.
    #[error("transaction log gap: expected {expected}, found {found:?}")]
    Gap {
        expected: Version,
        found: Option<Version>,
    },

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record could not be applied to the replay target.
    #[error("replay failed: {0}")]
    Replay(String),
}

/// Convenience alias for changeset results.
pub type ChangesetResult<T> = Result<T, ChangesetError>;
