//! Copy-on-write, multi-version object store for Tarn files.
//!
//! A store is a single file holding every committed version that a reader
//! still needs. Versions are immutable: a commit writes the pages it changed
//! to fresh locations, appends its transaction log and a new catalog, and
//! then flips a header slot. Readers pin a version and never block on the
//! writer; the writer never blocks on readers.
//!
//! # Key Types
//!
//! - [`VersionedStore`] -- open/create a file, begin transactions, fold history
//! - [`ReadTransaction`] -- pinned view of one committed version
//! - [`WriteTransaction`] -- the single writer's overlay
//! - [`Snapshot`] -- row-level queries shared by both transaction kinds
//!
//! # Design Rules
//!
//! 1. At most one write transaction per file, across threads and processes.
//! 2. A committed version's bytes are never modified while any reader in
//!    this process pins it, and never reused while another process has the
//!    file open.
//! 3. Every block is checksummed; a failed check is reported as corruption,
//!    never repaired.
//! 4. A failed commit leaves the previous version current.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod file;
pub mod format;
pub mod lock;
pub mod page;
pub mod pin;
pub mod snapshot;
pub mod store;
pub mod write;

pub use config::{Compression, Durability, StoreConfig};
pub use error::{ErrorKind, StoreError, StoreResult};
pub use snapshot::{ReadTransaction, Snapshot};
pub use store::{StoreInfo, VersionedStore};
pub use write::WriteTransaction;
