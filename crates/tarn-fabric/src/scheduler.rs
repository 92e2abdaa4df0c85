//! Schedulers: run work on the thread that owns an observer.
//!
//! # Key Types
//!
//! - [`Scheduler`] — handle used from any thread to queue a task onto one
//!   owning thread.
//! - [`EventLoop`] — a task queue bound to the thread that created it; that
//!   thread drains it with [`EventLoop::run_pending`] or
//!   [`EventLoop::run_until`].
//! - [`ThreadScheduler`] — a dedicated thread that drains its queue forever.
//!
//! Tasks queued from one thread run in the order they were queued. There is
//! no cancellation; a task that may become stale must check for itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::error::{FabricError, FabricResult};

/// A unit of work for a scheduler.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Process-unique scheduler identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulerId(u64);

impl SchedulerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sched-{}", self.0)
    }
}

/// Queues work onto one owning thread.
pub trait Scheduler: Send + Sync {
    fn id(&self) -> SchedulerId;

    /// Returns `true` when called on the owning thread.
    fn is_on_thread(&self) -> bool;

    /// Queue `task` to run later on the owning thread. Tasks queued after
    /// the owning loop has stopped are dropped unrun.
    fn invoke(&self, task: Task);

    /// Returns `false` once the owning loop has stopped, so nothing should
    /// be queued for delivery any more.
    fn can_deliver_notifications(&self) -> bool;
}

enum Job {
    Run(Task),
    Stop,
}

/// The cross-thread half of a queue.
struct QueueHandle {
    id: SchedulerId,
    owner: ThreadId,
    sender: Sender<Job>,
    open: AtomicBool,
}

impl Scheduler for QueueHandle {
    fn id(&self) -> SchedulerId {
        self.id
    }

    fn is_on_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    fn invoke(&self, task: Task) {
        if !self.open.load(Ordering::Acquire) || self.sender.send(Job::Run(task)).is_err() {
            trace!(scheduler = %self.id, "dropping task for stopped scheduler");
        }
    }

    fn can_deliver_notifications(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// EventLoop
// ---------------------------------------------------------------------------

/// A task queue drained by the thread that created it.
pub struct EventLoop {
    handle: Arc<QueueHandle>,
    receiver: Receiver<Job>,
}

impl EventLoop {
    /// Create a loop owned by the current thread.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            handle: Arc::new(QueueHandle {
                id: SchedulerId::next(),
                owner: thread::current().id(),
                sender,
                open: AtomicBool::new(true),
            }),
            receiver,
        }
    }

    /// A handle other threads use to queue work onto this loop.
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.handle.clone()
    }

    /// Run every task already queued. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.receiver.try_recv() {
            match job {
                Job::Run(task) => {
                    task();
                    ran += 1;
                }
                Job::Stop => break,
            }
        }
        ran
    }

    /// Run tasks as they arrive until `done` returns `true` or `timeout`
    /// passes. Returns whether `done` was satisfied.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.run_pending();
            if done() {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            match self.receiver.recv_timeout(remaining) {
                Ok(Job::Run(task)) => task(),
                Ok(Job::Stop) => return done(),
                Err(RecvTimeoutError::Timeout) => return done(),
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.handle.open.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("id", &self.handle.id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ThreadScheduler
// ---------------------------------------------------------------------------

/// A scheduler with its own thread.
pub struct ThreadScheduler {
    handle: Arc<QueueHandle>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadScheduler {
    pub fn spawn(name: impl Into<String>) -> FabricResult<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let id = SchedulerId::next();

        let thread = thread::Builder::new().name(name.into()).spawn(move || {
            let _ = ready_tx.send(thread::current().id());
            while let Ok(job) = receiver.recv() {
                match job {
                    Job::Run(task) => task(),
                    Job::Stop => break,
                }
            }
            debug!(scheduler = %id, "scheduler thread stopped");
        })?;
        let owner = ready_rx.recv().map_err(|_| FabricError::Shutdown)?;

        Ok(Self {
            handle: Arc::new(QueueHandle {
                id,
                owner,
                sender,
                open: AtomicBool::new(true),
            }),
            thread: Some(thread),
        })
    }

    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.handle.clone()
    }
}

impl Scheduler for ThreadScheduler {
    fn id(&self) -> SchedulerId {
        self.handle.id
    }

    fn is_on_thread(&self) -> bool {
        self.handle.is_on_thread()
    }

    fn invoke(&self, task: Task) {
        self.handle.invoke(task)
    }

    fn can_deliver_notifications(&self) -> bool {
        self.handle.can_deliver_notifications()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.handle.open.store(false, Ordering::Release);
        let _ = self.handle.sender.send(Job::Stop);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl std::fmt::Debug for ThreadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadScheduler")
            .field("id", &self.handle.id)
            .finish()
    }
}
