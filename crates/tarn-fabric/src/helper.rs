//! Listener thread that turns commit signals into callbacks.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::FabricResult;
use crate::signal::CommitSignal;

/// Pause after a failed wait before trying again.
const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Owns the background thread that waits on a file's [`CommitSignal`] and
/// calls back once per wake.
///
/// Several commits that land before the callback runs produce one call; the
/// callback is expected to look for everything newer than what it last saw.
pub struct ExternalCommitHelper {
    signal: Arc<dyn CommitSignal>,
    listener: Option<JoinHandle<()>>,
}

impl ExternalCommitHelper {
    pub fn start(
        signal: Arc<dyn CommitSignal>,
        callback: impl Fn() + Send + 'static,
    ) -> FabricResult<Self> {
        // Taken before spawning so a commit racing the thread start still wakes.
        let baseline = signal.current();
        let listener = {
            let signal = Arc::clone(&signal);
            thread::Builder::new()
                .name("tarn-commit-listener".into())
                .spawn(move || listen(signal.as_ref(), baseline, callback))?
        };
        Ok(Self {
            signal,
            listener: Some(listener),
        })
    }

    /// Tell every listener of the file, including this one, that a commit
    /// happened.
    pub fn notify_others(&self) -> FabricResult<()> {
        self.signal.notify()
    }

    pub fn signal(&self) -> &Arc<dyn CommitSignal> {
        &self.signal
    }
}

fn listen(signal: &dyn CommitSignal, baseline: u64, callback: impl Fn()) {
    let mut seen = baseline;
    loop {
        match signal.wait(seen) {
            Ok(Some(token)) => {
                seen = token;
                callback();
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "commit signal wait failed");
                thread::sleep(RETRY_DELAY);
            }
        }
    }
    debug!("commit listener stopped");
}

impl Drop for ExternalCommitHelper {
    fn drop(&mut self) {
        self.signal.interrupt();
        if let Some(listener) = self.listener.take() {
            if listener.thread().id() != thread::current().id() {
                let _ = listener.join();
            }
        }
    }
}

impl std::fmt::Debug for ExternalCommitHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalCommitHelper")
            .field("running", &self.listener.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{LocalSignal, PollingSignal};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::mpsc;

    #[test]
    fn notify_invokes_callback() {
        let (tx, rx) = mpsc::channel();
        let helper = ExternalCommitHelper::start(Arc::new(LocalSignal::new()), move || {
            let _ = tx.send(());
        })
        .unwrap();
        helper.notify_others().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        helper.notify_others().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn notify_right_after_start_is_not_lost() {
        for _ in 0..50 {
            let (tx, rx) = mpsc::channel();
            let helper = ExternalCommitHelper::start(Arc::new(LocalSignal::new()), move || {
                let _ = tx.send(());
            })
            .unwrap();
            helper.notify_others().unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
    }

    #[test]
    fn commits_during_a_running_callback_wake_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let helper = {
            let calls = Arc::clone(&calls);
            ExternalCommitHelper::start(Arc::new(LocalSignal::new()), move || {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = entered_tx.send(());
                let _ = release_rx.recv_timeout(Duration::from_secs(5));
            })
            .unwrap()
        };

        helper.notify_others().unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..20 {
            helper.notify_others().unwrap();
        }
        release_tx.send(()).unwrap();

        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        release_tx.send(()).unwrap();
        assert!(entered_rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        drop(helper);
    }

    #[test]
    fn polling_helper_notices_external_version() {
        let version = Arc::new(AtomicU64::new(0));
        let signal = {
            let version = Arc::clone(&version);
            Arc::new(PollingSignal::new(Duration::from_millis(5), move || {
                version.load(Ordering::SeqCst)
            }))
        };
        let (tx, rx) = mpsc::channel();
        let _helper = ExternalCommitHelper::start(signal, move || {
            let _ = tx.send(());
        })
        .unwrap();
        version.store(1, Ordering::SeqCst);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn drop_stops_listener() {
        let signal: Arc<dyn CommitSignal> = Arc::new(LocalSignal::new());
        let helper = ExternalCommitHelper::start(Arc::clone(&signal), || {}).unwrap();
        drop(helper);
        assert_eq!(signal.wait(0).unwrap(), None);
    }
}
