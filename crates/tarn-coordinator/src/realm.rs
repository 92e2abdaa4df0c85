//! Thread-bound handles on a store file.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tarn_fabric::Scheduler;
use tarn_notify::{ChangeEvent, ListNotifier, Notifier, ObjectNotifier, Query, ResultsNotifier};
use tarn_store::{ReadTransaction, Snapshot, StoreResult, WriteTransaction};
use tarn_sync::SyncSession;
use tarn_types::{ObjectKey, Value, Version};
use tracing::{debug, info};

use crate::config::RealmConfig;
use crate::coordinator::{Callback, Coordinator, RealmId};
use crate::error::{RealmError, RealmResult};
use crate::migrate::prepare_schema;
use crate::results::{NotificationToken, Results};

pub(crate) struct RealmState {
    pub(crate) read: ReadTransaction,
    pub(crate) write: Option<WriteTransaction>,
    pub(crate) closed: bool,
    /// A delivery arrived during a write and runs when it ends.
    pub(crate) deferred: bool,
}

/// The part of a realm the coordinator reaches from other threads.
pub(crate) struct RealmShared {
    pub(crate) id: RealmId,
    pub(crate) coordinator: Arc<Coordinator>,
    pub(crate) scheduler: Arc<dyn Scheduler>,
    pub(crate) auto_refresh: bool,
    /// Mirrors `state.read.version()` for lock-free checks.
    pub(crate) version: AtomicU64,
    pub(crate) state: Mutex<RealmState>,
}

impl RealmShared {
    /// Move the read view forward to `read`. Never moves backwards.
    pub(crate) fn advance(&self, read: ReadTransaction) {
        let mut state = self.state.lock().expect("lock poisoned");
        if read.version() > state.read.version() {
            self.version.store(read.version().value(), Ordering::Release);
            state.read = read;
        }
    }
}

/// A handle on a store file, bound to the thread that opened it.
///
/// Reads see one pinned version until the realm advances: by
/// [`refresh`](Self::refresh), by starting a write, or when the coordinator
/// delivers notifications. Observers registered through a realm get their
/// callbacks on the realm's scheduler.
pub struct Realm {
    shared: Arc<RealmShared>,
    _not_send: PhantomData<*const ()>,
}

impl Realm {
    /// Open `config.path`, creating or migrating its schema as needed.
    ///
    /// `scheduler` must belong to the calling thread.
    pub fn open(config: RealmConfig, scheduler: Arc<dyn Scheduler>) -> RealmResult<Self> {
        if !scheduler.is_on_thread() {
            return Err(RealmError::WrongThread);
        }
        let coordinator = Coordinator::get_or_create(&config)?;
        if let Some(version) = prepare_schema(coordinator.store(), &config)? {
            coordinator.did_commit(version);
        }
        let read = coordinator.store().read_latest()?;
        let shared = Arc::new(RealmShared {
            id: coordinator.next_realm_id(),
            coordinator: Arc::clone(&coordinator),
            scheduler,
            auto_refresh: config.auto_refresh,
            version: AtomicU64::new(read.version().value()),
            state: Mutex::new(RealmState {
                read,
                write: None,
                closed: false,
                deferred: false,
            }),
        });
        coordinator.register_realm(&shared);
        info!(path = %coordinator.path().display(), version = %shared.version.load(Ordering::Acquire), "realm opened");
        Ok(Self {
            shared,
            _not_send: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        self.shared.coordinator.path()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.shared.coordinator
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.shared.scheduler
    }

    /// The version reads currently see.
    pub fn version(&self) -> RealmResult<Version> {
        let state = self.open_state()?;
        Ok(state.read.version())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().expect("lock poisoned").closed
    }

    fn open_state(&self) -> RealmResult<std::sync::MutexGuard<'_, RealmState>> {
        let state = self.shared.state.lock().expect("lock poisoned");
        if state.closed {
            return Err(RealmError::Closed);
        }
        Ok(state)
    }

    /// Advance to the latest version. Returns whether the version changed.
    /// Inside a write this does nothing.
    ///
    /// Observers are called with everything up to the new version before
    /// this returns.
    pub fn refresh(&self) -> RealmResult<bool> {
        let current = {
            let state = self.open_state()?;
            if state.write.is_some() {
                return Ok(false);
            }
            state.read.version()
        };
        let latest = self.shared.coordinator.store().read_latest()?;
        if latest.version() <= current {
            return Ok(false);
        }
        debug!(from = %current, to = %latest.version(), "realm refreshed");
        self.shared.coordinator.catch_up(&self.shared, latest);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Start a write, waiting for any other writer on the file.
    pub fn begin_write(&self) -> RealmResult<()> {
        self.start_write(true)
    }

    /// Start a write, failing with [`ErrorKind::WouldBlock`] if another
    /// writer holds the file.
    ///
    /// [`ErrorKind::WouldBlock`]: tarn_store::ErrorKind::WouldBlock
    pub fn try_begin_write(&self) -> RealmResult<()> {
        self.start_write(false)
    }

    fn start_write(&self, wait: bool) -> RealmResult<()> {
        if self.open_state()?.write.is_some() {
            return Err(RealmError::AlreadyInWrite);
        }
        let store = self.shared.coordinator.store();
        let txn = if wait {
            store.begin_write()?
        } else {
            store.try_begin_write()?
        };
        // The base is the latest version and stays readable while we hold
        // the writer lock.
        let base = store.read(txn.base_version())?;
        let behind = base.version() > self.open_state()?.read.version();
        self.open_state()?.write = Some(txn);
        if behind {
            self.shared.coordinator.catch_up(&self.shared, base);
        }
        Ok(())
    }

    pub fn is_in_write(&self) -> bool {
        self.shared
            .state
            .lock()
            .expect("lock poisoned")
            .write
            .is_some()
    }

    /// Run `edit` against the open write transaction.
    pub fn edit<T>(&self, edit: impl FnOnce(&mut WriteTransaction) -> StoreResult<T>) -> RealmResult<T> {
        let mut state = self.open_state()?;
        let txn = state.write.as_mut().ok_or(RealmError::NotInWrite)?;
        Ok(edit(txn)?)
    }

    /// Commit the open write and announce it to every other handle.
    pub fn commit_write(&self) -> RealmResult<Version> {
        let txn = self
            .open_state()?
            .write
            .take()
            .ok_or(RealmError::NotInWrite)?;
        let result = txn.commit();
        let version = match result {
            Ok(version) => version,
            Err(err) => {
                self.write_ended();
                return Err(err.into());
            }
        };
        // Another writer may already have moved past our version.
        let read = self.shared.coordinator.store().read_latest()?;
        self.shared.advance(read);
        self.shared.coordinator.did_commit(version);
        debug!(%version, "realm committed");
        self.write_ended();
        Ok(version)
    }

    /// Discard the open write.
    pub fn cancel_write(&self) -> RealmResult<()> {
        let txn = self
            .open_state()?
            .write
            .take()
            .ok_or(RealmError::NotInWrite)?;
        txn.cancel();
        self.write_ended();
        Ok(())
    }

    /// Run a delivery that arrived during the write.
    fn write_ended(&self) {
        let deferred = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            std::mem::take(&mut state.deferred)
        };
        if deferred {
            self.shared.coordinator.deliver(&self.shared, None);
        }
    }

    /// Begin a write, run `body`, and commit. Any error cancels the write.
    pub fn write<T>(&self, body: impl FnOnce(&mut WriteTransaction) -> StoreResult<T>) -> RealmResult<T> {
        self.begin_write()?;
        match self.edit(body) {
            Ok(value) => {
                self.commit_write()?;
                Ok(value)
            }
            Err(err) => {
                self.cancel_write()?;
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Run `body` against what the realm sees: the write overlay inside a
    /// write, the pinned version otherwise.
    pub fn read<T>(&self, body: impl FnOnce(&dyn Snapshot) -> T) -> RealmResult<T> {
        let state = self.open_state()?;
        Ok(match state.write.as_ref() {
            Some(txn) => body(txn),
            None => body(&state.read),
        })
    }

    pub fn objects(&self, query: Query) -> RealmResult<Results> {
        let (version, keys) = self.read(|snapshot| {
            query.run(snapshot).map(|keys| (snapshot.version(), keys))
        })??;
        Ok(Results::new(query, version, keys))
    }

    pub fn object(&self, table: &str, key: ObjectKey) -> RealmResult<Option<Vec<Value>>> {
        Ok(self.read(|snapshot| snapshot.get(table, key))??)
    }

    pub fn value(&self, table: &str, key: ObjectKey, property: &str) -> RealmResult<Value> {
        Ok(self.read(|snapshot| snapshot.get_value(table, key, property))??)
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    /// Observe the results of `query`. The first event is
    /// [`ChangeEvent::Initial`]; later events carry index deltas.
    pub fn observe_results(
        &self,
        query: Query,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> RealmResult<NotificationToken> {
        self.observe(Box::new(ResultsNotifier::new(query)), callback)
    }

    /// Observe one object. Deleting it produces a final
    /// [`ChangeEvent::Invalidated`].
    pub fn observe_object(
        &self,
        table: &str,
        key: ObjectKey,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> RealmResult<NotificationToken> {
        self.observe(Box::new(ObjectNotifier::new(table, key)), callback)
    }

    pub fn observe_list(
        &self,
        table: &str,
        key: ObjectKey,
        property: &str,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> RealmResult<NotificationToken> {
        self.observe(Box::new(ListNotifier::new(table, key, property)), callback)
    }

    fn observe(
        &self,
        mut notifier: Box<dyn Notifier>,
        callback: impl FnMut(&ChangeEvent) + Send + 'static,
    ) -> RealmResult<NotificationToken> {
        let read = {
            let state = self.open_state()?;
            if state.write.is_some() {
                return Err(RealmError::AlreadyInWrite);
            }
            state.read.clone()
        };
        notifier.prepare(&read)?;
        let callback: Box<dyn FnMut(&ChangeEvent) + Send> = Box::new(callback);
        let callback: Callback = Arc::new(Mutex::new(callback));
        let coordinator = &self.shared.coordinator;
        let id = coordinator.register_notifier(self.shared.id, notifier, read, callback);
        Ok(NotificationToken::new(id, coordinator))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// The sync session for this file, shared by every realm on it.
    pub fn attach_session(&self) -> RealmResult<Arc<SyncSession>> {
        self.open_state()?;
        self.shared.coordinator.sync_session()
    }

    /// Close the realm. An open write is cancelled, every observer is
    /// unregistered, and pending deliveries are dropped.
    pub fn close(&self) {
        let write = {
            let mut state = self.shared.state.lock().expect("lock poisoned");
            if state.closed {
                return;
            }
            state.closed = true;
            state.write.take()
        };
        if let Some(txn) = write {
            txn.cancel();
        }
        self.shared.coordinator.unregister_realm(self.shared.id);
        debug!(path = %self.path().display(), "realm closed");
    }
}

impl Drop for Realm {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Realm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Realm")
            .field("path", &self.path())
            .field("version", &self.shared.version.load(Ordering::Acquire))
            .field("scheduler", &self.shared.scheduler.id())
            .finish()
    }
}
