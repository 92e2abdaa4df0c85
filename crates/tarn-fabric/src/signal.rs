//! Commit signals: how a committing handle wakes the listeners of a file.
//!
//! A signal carries no payload. Listeners remember the last token they saw
//! and, once woken, look at the store for whatever is newer. Any number of
//! notifications that arrive before a listener runs collapse into one wake.

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FabricResult;

/// Wake-up channel shared by everyone watching one store file.
pub trait CommitSignal: Send + Sync {
    /// Wake every listener of the file.
    fn notify(&self) -> FabricResult<()>;

    /// The newest token, for a listener that is about to start waiting.
    fn current(&self) -> u64;

    /// Block until a token newer than `last_seen` exists and return it, or
    /// return `None` once [`interrupt`](Self::interrupt) was called.
    fn wait(&self, last_seen: u64) -> FabricResult<Option<u64>>;

    /// Release every waiter permanently.
    fn interrupt(&self);
}

#[derive(Debug, Default)]
struct SignalState {
    generation: u64,
    interrupted: bool,
}

// ---------------------------------------------------------------------------
// LocalSignal
// ---------------------------------------------------------------------------

/// In-process signal: a generation counter behind a condition variable.
#[derive(Debug, Default)]
pub struct LocalSignal {
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl LocalSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommitSignal for LocalSignal {
    fn notify(&self) -> FabricResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.generation += 1;
        self.changed.notify_all();
        Ok(())
    }

    fn current(&self) -> u64 {
        self.state.lock().expect("lock poisoned").generation
    }

    fn wait(&self, last_seen: u64) -> FabricResult<Option<u64>> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.interrupted {
                return Ok(None);
            }
            if state.generation > last_seen {
                return Ok(Some(state.generation));
            }
            state = self.changed.wait(state).expect("lock poisoned");
        }
    }

    fn interrupt(&self) {
        self.state.lock().expect("lock poisoned").interrupted = true;
        self.changed.notify_all();
    }
}

// ---------------------------------------------------------------------------
// PollingSignal
// ---------------------------------------------------------------------------

/// Reads the current token, typically the store's latest version.
pub type Probe = Box<dyn Fn() -> u64 + Send + Sync>;

/// Signal that notices other processes by polling a probe at a fixed
/// interval. Local notifications re-probe immediately.
pub struct PollingSignal {
    probe: Probe,
    interval: Duration,
    state: Mutex<SignalState>,
    changed: Condvar,
}

impl PollingSignal {
    pub fn new(interval: Duration, probe: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        Self {
            probe: Box::new(probe),
            interval,
            state: Mutex::new(SignalState::default()),
            changed: Condvar::new(),
        }
    }
}

impl CommitSignal for PollingSignal {
    fn notify(&self) -> FabricResult<()> {
        self.state.lock().expect("lock poisoned").generation += 1;
        self.changed.notify_all();
        Ok(())
    }

    fn current(&self) -> u64 {
        (self.probe)()
    }

    fn wait(&self, last_seen: u64) -> FabricResult<Option<u64>> {
        let mut state = self.state.lock().expect("lock poisoned");
        loop {
            if state.interrupted {
                return Ok(None);
            }
            let seen_generation = state.generation;
            drop(state);

            let token = (self.probe)();
            if token > last_seen {
                return Ok(Some(token));
            }

            state = self.state.lock().expect("lock poisoned");
            if state.generation == seen_generation && !state.interrupted {
                state = self
                    .changed
                    .wait_timeout(state, self.interval)
                    .expect("lock poisoned")
                    .0;
            }
        }
    }

    fn interrupt(&self) {
        self.state.lock().expect("lock poisoned").interrupted = true;
        self.changed.notify_all();
    }
}

impl std::fmt::Debug for PollingSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingSignal")
            .field("interval", &self.interval)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Default polling interval when a backend needs one and none was given.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Which signal a coordinator uses for a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SignalBackend {
    /// Only handles in this process are woken.
    Local,
    /// Other processes are noticed by polling the store.
    Poll { interval_ms: u64 },
    /// A named pipe next to the file. Falls back to polling where named
    /// pipes are not supported.
    Fifo,
}

impl Default for SignalBackend {
    fn default() -> Self {
        Self::Fifo
    }
}

impl SignalBackend {
    /// Open the signal for the store at `path`. `probe` reads the store's
    /// latest version and is used by polling backends.
    pub fn open(
        self,
        path: &Path,
        probe: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> FabricResult<Arc<dyn CommitSignal>> {
        debug!(path = %path.display(), backend = ?self, "opening commit signal");
        match self {
            Self::Local => Ok(Arc::new(LocalSignal::new())),
            Self::Poll { interval_ms } => Ok(Arc::new(PollingSignal::new(
                Duration::from_millis(interval_ms.max(1)),
                probe,
            ))),
            Self::Fifo => Self::open_fifo(path, probe),
        }
    }

    #[cfg(target_os = "linux")]
    fn open_fifo(
        path: &Path,
        _probe: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> FabricResult<Arc<dyn CommitSignal>> {
        Ok(Arc::new(crate::fifo::FifoSignal::open(path)?))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_fifo(
        path: &Path,
        probe: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> FabricResult<Arc<dyn CommitSignal>> {
        debug!(path = %path.display(), "named pipes unavailable; polling instead");
        Self::Poll {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
        .open(path, probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn local_wait_returns_after_notify() {
        let signal = Arc::new(LocalSignal::new());
        let seen = signal.current();
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || tx.send(signal.wait(seen).unwrap()).unwrap())
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        signal.notify().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(1));
        waiter.join().unwrap();
    }

    #[test]
    fn local_notifications_coalesce() {
        let signal = LocalSignal::new();
        for _ in 0..3 {
            signal.notify().unwrap();
        }
        assert_eq!(signal.wait(0).unwrap(), Some(3));
    }

    #[test]
    fn interrupt_releases_waiters() {
        let signal = Arc::new(LocalSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait(0).unwrap())
        };
        signal.interrupt();
        assert_eq!(waiter.join().unwrap(), None);
        signal.notify().unwrap();
        assert_eq!(signal.wait(0).unwrap(), None);
    }

    #[test]
    fn polling_sees_probe_advance() {
        let version = Arc::new(AtomicU64::new(4));
        let signal = {
            let version = Arc::clone(&version);
            PollingSignal::new(Duration::from_millis(10), move || {
                version.load(Ordering::SeqCst)
            })
        };
        assert_eq!(signal.current(), 4);
        version.store(6, Ordering::SeqCst);
        assert_eq!(signal.wait(4).unwrap(), Some(6));
    }

    #[test]
    fn polling_local_notify_reprobes() {
        let version = Arc::new(AtomicU64::new(1));
        let signal = {
            let version = Arc::clone(&version);
            Arc::new(PollingSignal::new(Duration::from_secs(3600), move || {
                version.load(Ordering::SeqCst)
            }))
        };
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || tx.send(signal.wait(1).unwrap()).unwrap())
        };
        thread::sleep(Duration::from_millis(20));
        version.store(2, Ordering::SeqCst);
        signal.notify().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Some(2));
        waiter.join().unwrap();
    }

    #[test]
    fn backend_serde_shape() {
        let json = serde_json::to_string(&SignalBackend::Poll { interval_ms: 250 }).unwrap();
        assert_eq!(json, r#"{"kind":"poll","interval_ms":250}"#);
        let back: SignalBackend = serde_json::from_str(r#"{"kind":"local"}"#).unwrap();
        assert_eq!(back, SignalBackend::Local);
        assert_eq!(SignalBackend::default(), SignalBackend::Fifo);
    }
}
