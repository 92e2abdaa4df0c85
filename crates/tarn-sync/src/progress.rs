//! Transfer progress reporting.
//!
//! Progress is counted in changeset records. Callbacks run on whichever
//! thread reported the progress, never while the registry lock is held.

use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressDirection {
    Upload,
    Download,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    /// Report every change for as long as the token lives.
    ReportIndefinitely,
    /// Report until the work outstanding at registration is done, then stop.
    ForCurrentlyOutstandingWork,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub transferred: u64,
    pub transferable: u64,
}

impl Progress {
    pub fn is_transfer_complete(&self) -> bool {
        self.transferred >= self.transferable
    }

    /// Completed fraction in `0.0..=1.0`. Nothing to transfer counts as done.
    pub fn fraction(&self) -> f64 {
        if self.transferable == 0 {
            1.0
        } else {
            (self.transferred as f64 / self.transferable as f64).min(1.0)
        }
    }
}

type Callback = Arc<dyn Fn(Progress) + Send + Sync>;

struct Entry {
    id: u64,
    direction: ProgressDirection,
    /// Transferable total captured at registration, for
    /// [`ProgressMode::ForCurrentlyOutstandingWork`].
    target: Option<u64>,
    callback: Callback,
}

impl Entry {
    /// What this entry should see for `progress`, and whether it is finished.
    fn view(&self, progress: Progress) -> (Progress, bool) {
        match self.target {
            None => (progress, false),
            Some(target) => {
                let view = Progress {
                    transferred: progress.transferred.min(target),
                    transferable: target,
                };
                (view, view.is_transfer_complete())
            }
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    upload: Progress,
    download: Progress,
    entries: Vec<Entry>,
}

impl Registry {
    fn current(&mut self, direction: ProgressDirection) -> &mut Progress {
        match direction {
            ProgressDirection::Upload => &mut self.upload,
            ProgressDirection::Download => &mut self.download,
        }
    }
}

/// Progress counters for both directions plus their observers.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    registry: Arc<Mutex<Registry>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self, direction: ProgressDirection) -> Progress {
        *self
            .registry
            .lock()
            .expect("lock poisoned")
            .current(direction)
    }

    /// Register `callback`. It is called once right away with the current
    /// progress, then on every update.
    ///
    /// In [`ProgressMode::ForCurrentlyOutstandingWork`] the callback stops
    /// after reporting completion; if nothing is outstanding it is called
    /// once and the returned token is inert.
    pub fn add_notifier(
        &self,
        direction: ProgressDirection,
        mode: ProgressMode,
        callback: impl Fn(Progress) + Send + Sync + 'static,
    ) -> ProgressToken {
        let callback: Callback = Arc::new(callback);
        let (id, first, finished) = {
            let mut registry = self.registry.lock().expect("lock poisoned");
            let progress = *registry.current(direction);
            let target = match mode {
                ProgressMode::ReportIndefinitely => None,
                ProgressMode::ForCurrentlyOutstandingWork => Some(progress.transferable),
            };
            registry.next_id += 1;
            let entry = Entry {
                id: registry.next_id,
                direction,
                target,
                callback: Arc::clone(&callback),
            };
            let (first, finished) = entry.view(progress);
            if !finished {
                registry.entries.push(entry);
            }
            (registry.next_id, first, finished)
        };
        callback(first);
        ProgressToken {
            id,
            registry: if finished {
                Weak::new()
            } else {
                Arc::downgrade(&self.registry)
            },
        }
    }

    /// More work became known in `direction`.
    pub fn add_transferable(&self, direction: ProgressDirection, records: u64) {
        self.update(direction, |p| p.transferable += records);
    }

    /// Work finished in `direction`.
    pub fn add_transferred(&self, direction: ProgressDirection, records: u64) {
        self.update(direction, |p| {
            p.transferred = (p.transferred + records).min(p.transferable.max(p.transferred));
        });
    }

    /// Replace the counters for `direction` wholesale.
    pub fn set(&self, direction: ProgressDirection, progress: Progress) {
        self.update(direction, |p| *p = progress);
    }

    fn update(&self, direction: ProgressDirection, change: impl FnOnce(&mut Progress)) {
        let calls: Vec<(Callback, Progress)> = {
            let mut registry = self.registry.lock().expect("lock poisoned");
            let before = *registry.current(direction);
            change(registry.current(direction));
            let progress = *registry.current(direction);
            if progress == before {
                return;
            }
            let mut calls = Vec::new();
            registry.entries.retain(|entry| {
                if entry.direction != direction {
                    return true;
                }
                let (view, finished) = entry.view(progress);
                calls.push((Arc::clone(&entry.callback), view));
                !finished
            });
            calls
        };
        for (callback, progress) in calls {
            callback(progress);
        }
    }
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock().expect("lock poisoned");
        f.debug_struct("ProgressTracker")
            .field("upload", &registry.upload)
            .field("download", &registry.download)
            .field("notifiers", &registry.entries.len())
            .finish()
    }
}

/// Keeps a progress callback registered. Dropping it unregisters.
#[must_use = "dropping the token unregisters the callback"]
pub struct ProgressToken {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl ProgressToken {
    /// Returns `true` while the callback can still be called.
    pub fn is_active(&self) -> bool {
        self.registry.upgrade().is_some_and(|registry| {
            registry
                .lock()
                .expect("lock poisoned")
                .entries
                .iter()
                .any(|e| e.id == self.id)
        })
    }

    pub fn invalidate(self) {}
}

impl Drop for ProgressToken {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .expect("lock poisoned")
                .entries
                .retain(|e| e.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<Progress>>>, impl Fn(Progress) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |p| sink.lock().unwrap().push(p))
    }

    fn p(transferred: u64, transferable: u64) -> Progress {
        Progress {
            transferred,
            transferable,
        }
    }

    #[test]
    fn indefinite_reports_every_change() {
        let tracker = ProgressTracker::new();
        let (seen, callback) = recorder();
        let token = tracker.add_notifier(
            ProgressDirection::Upload,
            ProgressMode::ReportIndefinitely,
            callback,
        );
        tracker.add_transferable(ProgressDirection::Upload, 4);
        tracker.add_transferred(ProgressDirection::Upload, 4);
        tracker.add_transferable(ProgressDirection::Upload, 2);
        tracker.add_transferable(ProgressDirection::Download, 9);
        assert!(token.is_active());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![p(0, 0), p(0, 4), p(4, 4), p(4, 6)]
        );
    }

    #[test]
    fn outstanding_work_stops_after_completion() {
        let tracker = ProgressTracker::new();
        tracker.add_transferable(ProgressDirection::Download, 10);
        let (seen, callback) = recorder();
        let token = tracker.add_notifier(
            ProgressDirection::Download,
            ProgressMode::ForCurrentlyOutstandingWork,
            callback,
        );
        tracker.add_transferable(ProgressDirection::Download, 5);
        tracker.add_transferred(ProgressDirection::Download, 6);
        tracker.add_transferred(ProgressDirection::Download, 6);
        tracker.add_transferred(ProgressDirection::Download, 3);
        assert!(!token.is_active());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![p(0, 10), p(0, 10), p(6, 10), p(10, 10)]
        );
        assert!(seen.lock().unwrap().last().unwrap().is_transfer_complete());
    }

    #[test]
    fn nothing_outstanding_reports_once() {
        let tracker = ProgressTracker::new();
        let (seen, callback) = recorder();
        let token = tracker.add_notifier(
            ProgressDirection::Upload,
            ProgressMode::ForCurrentlyOutstandingWork,
            callback,
        );
        tracker.add_transferable(ProgressDirection::Upload, 3);
        assert!(!token.is_active());
        assert_eq!(*seen.lock().unwrap(), vec![p(0, 0)]);
    }

    #[test]
    fn dropping_token_unregisters() {
        let tracker = ProgressTracker::new();
        let (seen, callback) = recorder();
        let token = tracker.add_notifier(
            ProgressDirection::Upload,
            ProgressMode::ReportIndefinitely,
            callback,
        );
        token.invalidate();
        tracker.add_transferable(ProgressDirection::Upload, 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn fraction_handles_empty_transfer() {
        assert_eq!(p(0, 0).fraction(), 1.0);
        assert_eq!(p(1, 4).fraction(), 0.25);
    }
}
