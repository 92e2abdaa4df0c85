//! Realms and their per-file coordinators.
//!
//! A [`Realm`] is a thread-bound view of a Tarn store file. Every realm on
//! one file in a process shares a [`Coordinator`], which owns the commit
//! listener, runs observers' notifiers on a background thread, and hands
//! their output back to each realm's scheduler.
//!
//! # Key Types
//!
//! - [`RealmConfig`] — path, schema, migration, signalling and refresh policy
//! - [`Realm`] — reads, writes and observer registration on one thread
//! - [`Coordinator`] — the shared per-file state behind every realm
//! - [`Results`] / [`NotificationToken`] — query output and observer lifetime
//!
//! # Design Rules
//!
//! 1. A realm's reads see one version until it refreshes, writes, or has
//!    notifications delivered; it never moves backwards.
//! 2. All notifiers of one realm advance together. A realm with output not
//!    yet delivered has none of its notifiers run again until it is.
//! 3. Callbacks run on the realm's scheduler, never inside a write. Output
//!    arriving during a write is delivered when the write ends.

pub mod config;
pub mod coordinator;
pub mod error;
mod migrate;
pub mod realm;
pub mod results;

pub use config::{MigrationFn, RealmConfig};
pub use coordinator::{Coordinator, NotifierId};
pub use error::{RealmError, RealmResult};
pub use realm::Realm;
pub use results::{NotificationToken, Results};
