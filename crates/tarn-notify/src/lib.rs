//! Change notifications for Tarn collections.
//!
//! Observers register interest in a query's results, a list property or a
//! single object. Each registration is backed by a [`Notifier`] that, on a
//! background thread, diffs the observed state between the version it last
//! saw and a newer one and produces a [`ChangeEvent`].
//!
//! # Key Types
//!
//! - [`Query`] / [`Predicate`] — filtered and sorted views of one table
//! - [`CollectionDelta`] — index-based deletions, insertions and modifications
//! - [`ListChangeBuilder`] — exact list deltas from replayed list instructions
//! - [`ResultsNotifier`], [`ListNotifier`], [`ObjectNotifier`]
//!
//! # Design Rules
//!
//! 1. Ordered diffs use Myers' minimal edit script; a reordered element is a
//!    deletion plus an insertion, never a move on its own.
//! 2. A retained element counts as modified if it changed or an object it
//!    links to directly changed.
//! 3. A removed table or deleted object produces one terminal
//!    [`ChangeEvent::Invalidated`].

pub mod delta;
pub mod error;
pub mod index_set;
pub mod list;
pub mod notifier;
pub mod query;

pub use delta::{calculate_ordered, calculate_unordered, CollectionDelta, Move};
pub use error::{NotifyError, NotifyResult};
pub use index_set::IndexSet;
pub use list::ListChangeBuilder;
pub use notifier::{
    ChangeEvent, Delta, ListNotifier, Notifier, ObjectChange, ObjectNotifier, ResultsNotifier,
};
pub use query::{CompareOp, Predicate, Query, SortDescriptor};
