//! Sync session lifecycle for Tarn.
//!
//! The remote protocol lives elsewhere. This crate is the interface it talks
//! to: a [`SyncSession`] per store file that knows which local versions still
//! need uploading, applies remote changesets with conflict detection, and
//! reports lifecycle and progress to the application.
//!
//! # Key Types
//!
//! - [`SyncSession`] — upload bookkeeping and remote changeset application
//! - [`SessionState`] / [`ConnectionState`] — lifecycle and its observer view
//! - [`ProgressTracker`] / [`ProgressToken`] — transfer progress callbacks
//! - [`SyncTransport`] — the seam a network client implements

pub mod error;
pub mod progress;
pub mod session;
pub mod state;
pub mod transport;

pub use error::{SyncError, SyncResult};
pub use progress::{Progress, ProgressDirection, ProgressMode, ProgressToken, ProgressTracker};
pub use session::{ConnectionToken, SyncSession};
pub use state::{ConnectionState, SessionState, Transition};
pub use transport::{sync_once, SyncRound, SyncTransport};
