//! One coordinator per open file per process.
//!
//! Every [`Realm`](crate::Realm) on the same file shares a [`Coordinator`].
//! It owns the file's commit listener and a background thread that runs all
//! notifiers, then hands their output to each realm's scheduler.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use tarn_changeset::Changeset;
use tarn_fabric::{ExternalCommitHelper, FabricError, Scheduler, SignalBackend, Task};
use tarn_notify::{ChangeEvent, Notifier};
use tarn_store::{ReadTransaction, Snapshot, VersionedStore};
use tarn_sync::SyncSession;
use tarn_types::{Schema, Version};
use tracing::{debug, info, trace, warn};

use crate::config::RealmConfig;
use crate::error::RealmResult;
use crate::realm::RealmShared;

pub(crate) type Callback = Arc<Mutex<Box<dyn FnMut(&ChangeEvent) + Send>>>;

/// Identifies a registered notifier within its coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotifierId(u64);

impl fmt::Display for NotifierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notifier-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct RealmId(u64);

/// Output waiting for delivery, with the version it was computed at kept
/// pinned so the realm can advance to it.
struct Pending {
    event: ChangeEvent,
    snapshot: ReadTransaction,
}

struct NotifierEntry {
    realm: RealmId,
    /// `None` while the worker is running it.
    notifier: Option<Box<dyn Notifier>>,
    pending: Option<Pending>,
    callback: Callback,
    /// Produced its terminal event; never run again.
    terminal: bool,
}

struct RealmEntry {
    handle: Weak<RealmShared>,
    scheduler: Arc<dyn Scheduler>,
    /// A delivery task is queued or deferred.
    posted: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    realms: BTreeMap<RealmId, RealmEntry>,
    notifiers: BTreeMap<NotifierId, NotifierEntry>,
}

enum WorkerMessage {
    Wake,
    Shutdown,
}

struct Worker {
    sender: Sender<WorkerMessage>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<Coordinator>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<Coordinator>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// The canonical path of `path`, whether or not the file exists yet.
fn canonical_path(path: &Path) -> io::Result<PathBuf> {
    if path.exists() {
        return path.canonicalize();
    }
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "store path has no file name")
    })?;
    Ok(parent.canonicalize()?.join(name))
}

/// Shared state for every handle on one file in this process.
pub struct Coordinator {
    path: PathBuf,
    store: VersionedStore,
    state: Mutex<State>,
    /// Held while notifiers run, so a realm catching up and the worker never
    /// run the same notifier.
    pass: Mutex<()>,
    session: Mutex<Option<Arc<SyncSession>>>,
    helper: Mutex<Option<ExternalCommitHelper>>,
    worker: Mutex<Option<Worker>>,
}

impl Coordinator {
    /// The coordinator for `config.path`, opening the file if no handle in
    /// this process has it open.
    pub fn get_or_create(config: &RealmConfig) -> RealmResult<Arc<Self>> {
        let path = canonical_path(&config.path).map_err(tarn_store::StoreError::from)?;
        let mut registry = registry().lock().expect("lock poisoned");
        registry.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = registry.get(&path).and_then(Weak::upgrade) {
            return Ok(existing);
        }

        let store = if config.read_only {
            VersionedStore::open_read_only(&path, config.store.clone())?
        } else {
            let empty = Schema::empty();
            let schema = config.schema.as_ref().unwrap_or(&empty);
            VersionedStore::open_with_schema(
                &path,
                config.store.clone(),
                schema,
                config.schema_version,
            )?
        };
        let coordinator = Arc::new(Self {
            path: path.clone(),
            store,
            state: Mutex::new(State::default()),
            pass: Mutex::new(()),
            session: Mutex::new(None),
            helper: Mutex::new(None),
            worker: Mutex::new(None),
        });
        coordinator.start(config.signal)?;
        registry.insert(path.clone(), Arc::downgrade(&coordinator));
        info!(path = %path.display(), "coordinator created");
        Ok(coordinator)
    }

    /// The live coordinator for `path`, if any handle has it open.
    pub fn get_existing(path: impl AsRef<Path>) -> Option<Arc<Self>> {
        let path = path.as_ref().canonicalize().ok()?;
        registry()
            .lock()
            .expect("lock poisoned")
            .get(&path)
            .and_then(Weak::upgrade)
    }

    fn start(self: &Arc<Self>, backend: SignalBackend) -> RealmResult<()> {
        let (sender, receiver) = mpsc::channel();
        let weak = Arc::downgrade(self);
        let thread = thread::Builder::new()
            .name("tarn-notifier".into())
            .spawn(move || run_worker(weak, receiver))
            .map_err(FabricError::from)?;
        *self.worker.lock().expect("lock poisoned") = Some(Worker {
            sender,
            thread: Some(thread),
        });

        let probe = self.store.clone();
        let signal = backend.open(&self.path, move || {
            probe.latest_version().map_or(0, |v| v.value())
        })?;
        let weak = Arc::downgrade(self);
        let helper = ExternalCommitHelper::start(signal, move || {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.wake();
            }
        })?;
        *self.helper.lock().expect("lock poisoned") = Some(helper);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    /// Number of open realms on this file in this process.
    pub fn realm_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").realms.len()
    }

    pub fn notifier_count(&self) -> usize {
        self.state.lock().expect("lock poisoned").notifiers.len()
    }

    /// The file's sync session, created on first use. Commits made through
    /// any realm on the file are reported to it.
    pub fn sync_session(self: &Arc<Self>) -> RealmResult<Arc<SyncSession>> {
        let mut slot = self.session.lock().expect("lock poisoned");
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(SyncSession::new(self.store.clone())?);
        let weak = Arc::downgrade(self);
        session.set_commit_hook(move |_| {
            if let Some(coordinator) = weak.upgrade() {
                coordinator.announce_commit();
            }
        });
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub(crate) fn next_realm_id(&self) -> RealmId {
        let mut state = self.state.lock().expect("lock poisoned");
        state.next_id += 1;
        RealmId(state.next_id)
    }

    pub(crate) fn register_realm(&self, realm: &Arc<RealmShared>) {
        self.state.lock().expect("lock poisoned").realms.insert(
            realm.id,
            RealmEntry {
                handle: Arc::downgrade(realm),
                scheduler: Arc::clone(&realm.scheduler),
                posted: false,
            },
        );
    }

    /// Forget a realm and every notifier it registered.
    pub(crate) fn unregister_realm(&self, id: RealmId) {
        let removed: Vec<NotifierEntry> = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.realms.remove(&id);
            let ids: Vec<NotifierId> = state
                .notifiers
                .iter()
                .filter(|(_, e)| e.realm == id)
                .map(|(nid, _)| *nid)
                .collect();
            ids.iter()
                .filter_map(|nid| state.notifiers.remove(nid))
                .collect()
        };
        debug!(path = %self.path.display(), notifiers = removed.len(), "realm unregistered");
    }

    /// Register a notifier already prepared against `snapshot`. Its first
    /// event is [`ChangeEvent::Initial`] at that version.
    pub(crate) fn register_notifier(
        &self,
        realm: RealmId,
        notifier: Box<dyn Notifier>,
        snapshot: ReadTransaction,
        callback: Callback,
    ) -> NotifierId {
        let id = {
            let mut state = self.state.lock().expect("lock poisoned");
            state.next_id += 1;
            let id = NotifierId(state.next_id);
            let version = notifier.version();
            state.notifiers.insert(
                id,
                NotifierEntry {
                    realm,
                    notifier: Some(notifier),
                    pending: Some(Pending {
                        event: ChangeEvent::Initial { version },
                        snapshot,
                    }),
                    callback,
                    terminal: false,
                },
            );
            id
        };
        trace!(notifier = %id, "notifier registered");
        self.wake();
        id
    }

    pub fn unregister_notifier(&self, id: NotifierId) {
        if self
            .state
            .lock()
            .expect("lock poisoned")
            .notifiers
            .remove(&id)
            .is_some()
        {
            trace!(notifier = %id, "notifier unregistered");
        }
    }

    fn is_registered(&self, id: NotifierId) -> bool {
        self.state
            .lock()
            .expect("lock poisoned")
            .notifiers
            .contains_key(&id)
    }

    // -----------------------------------------------------------------------
    // Commits
    // -----------------------------------------------------------------------

    /// A realm in this process committed `version`.
    pub(crate) fn did_commit(&self, version: Version) {
        self.announce_commit();
        let session = self.session.lock().expect("lock poisoned").clone();
        if let Some(session) = session {
            if let Err(err) = session.local_version_advanced(version) {
                warn!(%version, error = %err, "sync session could not record commit");
            }
        }
    }

    /// Wake every listener on the file, including this coordinator.
    fn announce_commit(&self) {
        if let Some(helper) = self.helper.lock().expect("lock poisoned").as_ref() {
            if let Err(err) = helper.notify_others() {
                warn!(path = %self.path.display(), error = %err, "commit signal failed");
            }
        }
        self.wake();
    }

    pub(crate) fn wake(&self) {
        if let Some(worker) = self.worker.lock().expect("lock poisoned").as_ref() {
            let _ = worker.sender.send(WorkerMessage::Wake);
        }
    }

    // -----------------------------------------------------------------------
    // Notifier pass (worker thread)
    // -----------------------------------------------------------------------

    /// Bring every runnable notifier up to the latest version and queue
    /// delivery for each realm with output.
    ///
    /// A realm with undelivered output has none of its notifiers run, so all
    /// notifiers of one realm advance together.
    fn run_pass(self: &Arc<Self>) {
        let read = match self.store.read_latest() {
            Ok(read) => read,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read latest version");
                return;
            }
        };
        let latest = read.version();
        let pass = self.pass.lock().expect("lock poisoned");

        let batch: Vec<(NotifierId, Box<dyn Notifier>)> = {
            let mut state = self.state.lock().expect("lock poisoned");
            let blocked: BTreeSet<RealmId> = state
                .notifiers
                .values()
                .filter(|e| e.pending.is_some())
                .map(|e| e.realm)
                .collect();
            state
                .notifiers
                .iter_mut()
                .filter(|(_, e)| !e.terminal && !blocked.contains(&e.realm))
                .filter(|(_, e)| e.notifier.as_ref().is_some_and(|n| n.version() < latest))
                .filter_map(|(id, e)| e.notifier.take().map(|n| (*id, n)))
                .collect()
        };

        let ran = batch.len();
        let mut changesets: BTreeMap<Version, Result<Changeset, String>> = BTreeMap::new();
        let mut outputs = Vec::with_capacity(batch.len());
        for (id, mut notifier) in batch {
            let event = self.run_notifier(id, notifier.as_mut(), &read, &mut changesets);
            outputs.push((id, notifier, event));
        }

        let deliveries = {
            let mut state = self.state.lock().expect("lock poisoned");
            for (id, notifier, event) in outputs {
                let Some(entry) = state.notifiers.get_mut(&id) else {
                    continue;
                };
                entry.notifier = Some(notifier);
                if let Some(event) = event {
                    entry.terminal = event.is_terminal();
                    entry.pending = Some(Pending {
                        event,
                        snapshot: read.clone(),
                    });
                }
            }

            let with_output: BTreeSet<RealmId> = state
                .notifiers
                .values()
                .filter(|e| e.pending.is_some())
                .map(|e| e.realm)
                .collect();
            let mut deliveries = Vec::new();
            for (id, entry) in state.realms.iter_mut() {
                if entry.posted || !entry.scheduler.can_deliver_notifications() {
                    continue;
                }
                let Some(realm) = entry.handle.upgrade() else {
                    continue;
                };
                let behind = realm.auto_refresh && realm.version.load(Ordering::Acquire) < latest.value();
                if !with_output.contains(id) && !behind {
                    continue;
                }
                entry.posted = true;
                deliveries.push((Arc::clone(&entry.scheduler), Arc::downgrade(&realm)));
            }
            deliveries
        };
        drop(pass);

        debug!(
            path = %self.path.display(),
            version = %latest,
            notifiers = ran,
            deliveries = deliveries.len(),
            "notifier pass"
        );
        for (scheduler, realm) in deliveries {
            let coordinator = Arc::downgrade(self);
            let refresh = read.clone();
            let task: Task = Box::new(move || {
                if let (Some(coordinator), Some(realm)) = (coordinator.upgrade(), realm.upgrade()) {
                    coordinator.deliver(&realm, Some(refresh));
                }
            });
            scheduler.invoke(task);
        }
    }

    /// Run one notifier up to `read`. A failure invalidates it.
    fn run_notifier(
        &self,
        id: NotifierId,
        notifier: &mut dyn Notifier,
        read: &ReadTransaction,
        changesets: &mut BTreeMap<Version, Result<Changeset, String>>,
    ) -> Option<ChangeEvent> {
        let latest = read.version();
        let from = notifier.version();
        let changeset = changesets
            .entry(from)
            .or_insert_with(|| self.store.changeset(from, latest).map_err(|e| e.to_string()));
        let result = match changeset {
            Ok(changeset) => notifier.run(read, changeset).map_err(|e| e.to_string()),
            Err(reason) => Err(reason.clone()),
        };
        match result {
            Ok(event) => event,
            Err(reason) => {
                warn!(notifier = %id, %reason, "notifier failed, invalidating");
                Some(ChangeEvent::Invalidated { version: latest })
            }
        }
    }

    /// Advance `realm` to `target` on its own thread, delivering everything
    /// its observers would see on the way before returning.
    ///
    /// Output the worker already computed goes out first, at its own
    /// version. Then the realm's notifiers run up to `target` and their
    /// events go out with the realm at `target`.
    pub(crate) fn catch_up(&self, realm: &Arc<RealmShared>, target: ReadTransaction) {
        let latest = target.version();
        let (earlier, later) = {
            let _pass = self.pass.lock().expect("lock poisoned");
            let (earlier, batch) = {
                let mut state = self.state.lock().expect("lock poisoned");
                let mut earlier = Vec::new();
                let mut batch = Vec::new();
                for (id, entry) in state.notifiers.iter_mut().filter(|(_, e)| e.realm == realm.id) {
                    if let Some(pending) = entry.pending.take() {
                        earlier.push((*id, pending, Arc::clone(&entry.callback)));
                    }
                    if entry.terminal {
                        continue;
                    }
                    if entry.notifier.as_ref().is_some_and(|n| n.version() < latest) {
                        if let Some(notifier) = entry.notifier.take() {
                            batch.push((*id, notifier));
                        }
                    }
                }
                (earlier, batch)
            };

            let mut changesets = BTreeMap::new();
            let mut outputs = Vec::with_capacity(batch.len());
            for (id, mut notifier) in batch {
                let event = self.run_notifier(id, notifier.as_mut(), &target, &mut changesets);
                outputs.push((id, notifier, event));
            }

            let mut state = self.state.lock().expect("lock poisoned");
            let mut later = Vec::new();
            for (id, notifier, event) in outputs {
                let Some(entry) = state.notifiers.get_mut(&id) else {
                    continue;
                };
                entry.notifier = Some(notifier);
                if let Some(event) = event {
                    entry.terminal = event.is_terminal();
                    later.push((
                        id,
                        Pending {
                            event,
                            snapshot: target.clone(),
                        },
                        Arc::clone(&entry.callback),
                    ));
                }
            }
            (earlier, later)
        };

        trace!(
            version = %latest,
            earlier = earlier.len(),
            later = later.len(),
            "realm catching up"
        );
        if let Some(snapshot) = earlier.iter().map(|(_, p, _)| &p.snapshot).max_by_key(|s| s.version()) {
            realm.advance(snapshot.clone());
        }
        self.invoke(earlier);
        realm.advance(target);
        self.invoke(later);
    }

    // -----------------------------------------------------------------------
    // Delivery (realm thread)
    // -----------------------------------------------------------------------

    /// Hand pending output to `realm`'s callbacks. Runs on the realm's
    /// thread.
    ///
    /// A closed realm drops everything. A realm inside a write defers until
    /// the write ends. Otherwise the realm advances to the newest delivered
    /// version (or to `refresh` if it auto-refreshes and none of its
    /// notifiers lags behind it) and the callbacks of notifiers that are
    /// still registered run.
    pub(crate) fn deliver(&self, realm: &Arc<RealmShared>, refresh: Option<ReadTransaction>) {
        {
            let mut realm_state = realm.state.lock().expect("lock poisoned");
            if realm_state.closed {
                return;
            }
            if realm_state.write.is_some() {
                realm_state.deferred = true;
                trace!("delivery deferred until the write ends");
                return;
            }
            realm_state.deferred = false;
        }

        let (events, lagging) = {
            let mut state = self.state.lock().expect("lock poisoned");
            if let Some(entry) = state.realms.get_mut(&realm.id) {
                entry.posted = false;
            }
            let mut events = Vec::new();
            for (id, entry) in state.notifiers.iter_mut().filter(|(_, e)| e.realm == realm.id) {
                if let Some(pending) = entry.pending.take() {
                    events.push((*id, pending, Arc::clone(&entry.callback)));
                }
            }
            let lagging = refresh.as_ref().is_some_and(|refresh| {
                state.notifiers.values().any(|e| {
                    e.realm == realm.id
                        && !e.terminal
                        && e.notifier.as_ref().map_or(true, |n| n.version() < refresh.version())
                })
            });
            (events, lagging)
        };

        let mut target: Option<&ReadTransaction> = events
            .iter()
            .map(|(_, pending, _)| &pending.snapshot)
            .max_by_key(|snapshot| snapshot.version());
        if realm.auto_refresh && !lagging {
            if let Some(refresh) = refresh.as_ref() {
                if target.map_or(true, |t| t.version() < refresh.version()) {
                    target = Some(refresh);
                }
            }
        }
        if let Some(target) = target {
            realm.advance(target.clone());
        }

        let delivered = !events.is_empty();
        self.invoke(events);
        if delivered {
            self.wake();
        }
    }

    /// Run the callbacks of notifiers that are still registered.
    fn invoke(&self, events: Vec<(NotifierId, Pending, Callback)>) {
        for (id, pending, callback) in events {
            if !self.is_registered(id) {
                continue;
            }
            {
                let mut guard = callback.lock().expect("lock poisoned");
                let callback: &mut (dyn FnMut(&ChangeEvent) + Send) = &mut **guard;
                callback(&pending.event);
            }
            if pending.event.is_terminal() {
                self.unregister_notifier(id);
            }
        }
    }
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().expect("lock poisoned");
        f.debug_struct("Coordinator")
            .field("path", &self.path)
            .field("realms", &state.realms.len())
            .field("notifiers", &state.notifiers.len())
            .finish()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        debug!(path = %self.path.display(), "coordinator released");
    }
}

fn run_worker(coordinator: Weak<Coordinator>, receiver: Receiver<WorkerMessage>) {
    while let Ok(message) = receiver.recv() {
        if matches!(message, WorkerMessage::Shutdown) {
            break;
        }
        // Wakes that piled up while the last pass ran are covered by this one.
        if receiver
            .try_iter()
            .any(|m| matches!(m, WorkerMessage::Shutdown))
        {
            break;
        }
        let Some(coordinator) = coordinator.upgrade() else {
            break;
        };
        coordinator.run_pass();
    }
    debug!("notifier worker stopped");
}
