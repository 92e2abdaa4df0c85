//! Commit signalling and scheduling for Tarn.
//!
//! When one handle commits, every other handle on the same file (in this
//! process or another) must find out so it can advance and recompute its
//! observers. This crate carries that wake-up and hands the resulting work to
//! the thread that owns each observer.
//!
//! # Key Types
//!
//! - [`CommitSignal`] — a payload-free, coalescing wake-up channel per file,
//!   with local, polling and named-pipe backends chosen by [`SignalBackend`].
//! - [`ExternalCommitHelper`] — the listener thread that turns signals into
//!   callbacks.
//! - [`Scheduler`] — queues delivery tasks onto an owning thread;
//!   [`EventLoop`] and [`ThreadScheduler`] are the provided implementations.

pub mod error;
#[cfg(target_os = "linux")]
pub mod fifo;
pub mod helper;
pub mod scheduler;
pub mod signal;

pub use error::{FabricError, FabricResult};
#[cfg(target_os = "linux")]
pub use fifo::FifoSignal;
pub use helper::ExternalCommitHelper;
pub use scheduler::{EventLoop, Scheduler, SchedulerId, Task, ThreadScheduler};
pub use signal::{CommitSignal, LocalSignal, PollingSignal, SignalBackend, DEFAULT_POLL_INTERVAL_MS};
