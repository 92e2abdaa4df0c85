//! Transaction logs and changesets for the Tarn object store.
//!
//! Every committed write transaction stores a [`TransactionLog`]: the ordered
//! low-level [`Instruction`]s it performed. Folding the logs of a version range
//! yields a [`Changeset`], which serves both for cross-version diffing in the
//! notifier pipeline and as the replayable payload exchanged with a sync
//! session.
//!
//! # Key Types
//!
//! - [`Instruction`] / [`LogRecord`] / [`TransactionLog`] -- per-commit mutation records
//! - [`Changeset`] / [`TableChanges`] -- folded, key-addressed difference between two versions
//! - [`ReplayTarget`] / [`RowState`] -- applying a changeset to a state

pub mod changeset;
pub mod error;
pub mod instruction;
pub mod replay;

pub use changeset::{Changeset, TableChanges, VersionedRecord};
pub use error::{ChangesetError, ChangesetResult};
pub use instruction::{Instruction, LogBuilder, LogRecord, TransactionLog};
pub use replay::{ReplayTarget, RowState, TableState};
