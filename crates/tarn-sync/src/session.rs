//! The session a remote-sync transport drives for one store file.
//!
//! The transport owns the network. The session tracks what has to be
//! uploaded, applies what was downloaded, and exposes lifecycle state and
//! progress to the application.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use tarn_changeset::{Changeset, Instruction, ReplayTarget};
use tarn_store::{Snapshot, VersionedStore, WriteTransaction};
use tarn_types::{ObjectKey, Value, Version};
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::progress::{Progress, ProgressDirection, ProgressMode, ProgressToken, ProgressTracker};
use crate::state::{ConnectionState, SessionState, Transition};

type ConnectionCallback = Arc<dyn Fn(ConnectionState, ConnectionState) + Send + Sync>;
type CommitHook = Arc<dyn Fn(Version) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: u64,
    entries: Vec<(u64, ConnectionCallback)>,
}

struct Inner {
    state: SessionState,
    /// Newest local version the session has accounted for.
    known: Version,
    /// Every local change up to here has been acknowledged by the server.
    uploaded: Version,
    /// Upload handed to the transport but not yet acknowledged: end version
    /// and record count.
    in_flight: Option<(Version, u64)>,
    /// Versions produced by applying remote changesets. They are never
    /// uploaded back.
    remote: BTreeSet<Version>,
}

/// Sync state for one store file.
pub struct SyncSession {
    store: VersionedStore,
    inner: Mutex<Inner>,
    observers: Arc<Mutex<Observers>>,
    progress: ProgressTracker,
    commit_hook: Mutex<Option<CommitHook>>,
}

impl SyncSession {
    /// A new, inactive session. Everything committed so far counts as
    /// already uploaded.
    pub fn new(store: VersionedStore) -> SyncResult<Self> {
        let latest = store.latest_version()?;
        Ok(Self {
            store,
            inner: Mutex::new(Inner {
                state: SessionState::Inactive,
                known: latest,
                uploaded: latest,
                in_flight: None,
                remote: BTreeSet::new(),
            }),
            observers: Arc::new(Mutex::new(Observers::default())),
            progress: ProgressTracker::new(),
            commit_hook: Mutex::new(None),
        })
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().expect("lock poisoned").state.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().expect("lock poisoned").state.connection()
    }

    /// Called with every version this session commits, so the owner can
    /// wake observers.
    pub fn set_commit_hook(&self, hook: impl Fn(Version) + Send + Sync + 'static) {
        *self.commit_hook.lock().expect("lock poisoned") = Some(Arc::new(hook));
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn connect(&self) -> SyncResult<()> {
        self.transition(Transition::Connect)
    }

    /// The transport finished connecting.
    pub fn connected(&self) -> SyncResult<()> {
        self.transition(Transition::Connected)
    }

    pub fn suspend(&self) -> SyncResult<()> {
        self.transition(Transition::Suspend)
    }

    pub fn resume(&self) -> SyncResult<()> {
        self.transition(Transition::Resume)
    }

    /// The transport failed; the session stays in error until reconnected.
    pub fn fail(&self, message: impl Into<String>) -> SyncResult<()> {
        self.transition(Transition::Fail(message.into()))
    }

    pub fn close(&self) -> SyncResult<()> {
        self.transition(Transition::Close)
    }

    fn transition(&self, transition: Transition) -> SyncResult<()> {
        let (before, after) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let next = inner.state.apply(&transition).ok_or_else(|| {
                SyncError::InvalidTransition {
                    state: inner.state.clone(),
                    action: transition.name(),
                }
            })?;
            let before = inner.state.connection();
            if !next.is_active() && inner.in_flight.take().is_some() {
                debug!("in-flight upload dropped, will be retaken");
            }
            info!(from = %inner.state, to = %next, "sync session transition");
            inner.state = next;
            (before, inner.state.connection())
        };
        if before != after {
            let callbacks: Vec<ConnectionCallback> = self
                .observers
                .lock()
                .expect("lock poisoned")
                .entries
                .iter()
                .map(|(_, cb)| Arc::clone(cb))
                .collect();
            for callback in callbacks {
                callback(before, after);
            }
        }
        Ok(())
    }

    /// Observe connection changes. The callback gets `(old, new)`.
    pub fn observe_connection(
        &self,
        callback: impl Fn(ConnectionState, ConnectionState) + Send + Sync + 'static,
    ) -> ConnectionToken {
        let mut observers = self.observers.lock().expect("lock poisoned");
        observers.next_id += 1;
        let id = observers.next_id;
        observers.entries.push((id, Arc::new(callback)));
        ConnectionToken {
            id,
            observers: Arc::downgrade(&self.observers),
        }
    }

    // -----------------------------------------------------------------------
    // Upload
    // -----------------------------------------------------------------------

    /// A local commit produced `version`. Older or already seen versions are
    /// ignored.
    pub fn local_version_advanced(&self, version: Version) -> SyncResult<()> {
        let added = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            if version <= inner.known {
                return Ok(());
            }
            let logs = self.store.transaction_logs(inner.known, version)?;
            let added: u64 = logs
                .iter()
                .filter(|log| !inner.remote.contains(&log.version))
                .map(|log| log.records.len() as u64)
                .sum();
            debug!(from = %inner.known, to = %version, records = added, "local changes pending upload");
            inner.known = version;
            added
        };
        if added > 0 {
            self.progress.add_transferable(ProgressDirection::Upload, added);
        }
        Ok(())
    }

    /// Everything committed locally since the last acknowledged upload,
    /// folded into one changeset. Returns `None` if there is nothing to send
    /// or an upload is still awaiting acknowledgement.
    pub fn take_pending_upload(&self) -> SyncResult<Option<Changeset>> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.state != SessionState::Connected {
            return Err(SyncError::NotConnected(inner.state.clone()));
        }
        if inner.in_flight.is_some() || inner.known == inner.uploaded {
            return Ok(None);
        }

        let logs = self.store.transaction_logs(inner.uploaded, inner.known)?;
        let mut changeset = Changeset::empty(inner.uploaded);
        for log in logs.iter().filter(|log| !inner.remote.contains(&log.version)) {
            changeset.push_log(log);
        }
        changeset.to = inner.known;

        if changeset.records.is_empty() {
            inner.uploaded = inner.known;
            prune_remote(&mut inner);
            return Ok(None);
        }
        inner.in_flight = Some((inner.known, changeset.len() as u64));
        debug!(from = %changeset.from, to = %changeset.to, records = changeset.len(), "upload taken");
        Ok(Some(changeset))
    }

    /// The server acknowledged the upload last returned by
    /// [`take_pending_upload`](Self::take_pending_upload).
    pub fn upload_completed(&self) {
        let done = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some((version, records)) = inner.in_flight.take() else {
                return;
            };
            inner.uploaded = version;
            prune_remote(&mut inner);
            records
        };
        self.progress.add_transferred(ProgressDirection::Upload, done);
    }

    // -----------------------------------------------------------------------
    // Download
    // -----------------------------------------------------------------------

    /// The transport learned that `records` more records are waiting on the
    /// server.
    pub fn download_announced(&self, records: u64) {
        self.progress.add_transferable(ProgressDirection::Download, records);
    }

    /// Apply a changeset received from the server in one write transaction.
    ///
    /// Every record is checked against current state first: the object must
    /// exist (or not, for creations) and the `old` values must match. On any
    /// mismatch the write is cancelled and [`SyncError::MergeConflict`] is
    /// returned; nothing becomes visible.
    pub fn remote_changeset_available(&self, changeset: &Changeset) -> SyncResult<Version> {
        // Held across the commit so the new version is marked remote before
        // anyone can report it as a local change.
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.state != SessionState::Connected {
            return Err(SyncError::NotConnected(inner.state.clone()));
        }
        if changeset.records.is_empty() {
            return Ok(self.store.latest_version()?);
        }

        let mut txn = self.store.begin_write()?;
        for entry in &changeset.records {
            let instruction = &entry.record.instruction;
            if let Err(reason) = check(&txn, instruction) {
                warn!(table = instruction.table(), %reason, "remote changeset conflicts");
                txn.cancel();
                return Err(SyncError::MergeConflict {
                    table: instruction.table().to_string(),
                    reason,
                });
            }
            if let Err(err) = txn.apply(instruction) {
                txn.cancel();
                return Err(err.into());
            }
        }
        let version = txn.commit()?;
        inner.remote.insert(version);
        drop(inner);
        info!(%version, records = changeset.len(), "remote changeset applied");

        self.progress
            .add_transferred(ProgressDirection::Download, changeset.len() as u64);
        let hook = self.commit_hook.lock().expect("lock poisoned").clone();
        if let Some(hook) = hook {
            hook(version);
        }
        Ok(version)
    }

    // -----------------------------------------------------------------------
    // Progress
    // -----------------------------------------------------------------------

    pub fn add_progress_notifier(
        &self,
        direction: ProgressDirection,
        mode: ProgressMode,
        callback: impl Fn(Progress) + Send + Sync + 'static,
    ) -> ProgressToken {
        self.progress.add_notifier(direction, mode, callback)
    }

    pub fn progress(&self, direction: ProgressDirection) -> Progress {
        self.progress.current(direction)
    }
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("lock poisoned");
        f.debug_struct("SyncSession")
            .field("path", &self.store.path())
            .field("state", &inner.state)
            .field("known", &inner.known)
            .field("uploaded", &inner.uploaded)
            .finish()
    }
}

fn prune_remote(inner: &mut Inner) {
    let uploaded = inner.uploaded;
    inner.remote.retain(|v| *v > uploaded);
}

/// Keeps a connection observer registered. Dropping it unregisters.
#[must_use = "dropping the token unregisters the callback"]
pub struct ConnectionToken {
    id: u64,
    observers: Weak<Mutex<Observers>>,
}

impl Drop for ConnectionToken {
    fn drop(&mut self) {
        if let Some(observers) = self.observers.upgrade() {
            observers
                .lock()
                .expect("lock poisoned")
                .entries
                .retain(|(id, _)| *id != self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Conflict detection
// ---------------------------------------------------------------------------

/// Verify that `instruction` was produced against the state `txn` holds now.
fn check(txn: &WriteTransaction, instruction: &Instruction) -> Result<(), String> {
    match instruction {
        Instruction::AddTable { schema } => {
            if txn.has_table(&schema.name) {
                return Err(format!("table {} already exists", schema.name));
            }
        }
        Instruction::RemoveTable { table } => {
            require_table(txn, table)?;
        }
        Instruction::AddProperty {
            table, property, ..
        } => {
            let schema = txn.object_schema(table).map_err(|e| e.to_string())?;
            if schema.property(&property.name).is_some() {
                return Err(format!("property {} already exists", property.name));
            }
        }
        Instruction::RemoveProperty { table, property } => {
            let schema = txn.object_schema(table).map_err(|e| e.to_string())?;
            if schema.property(property).is_none() {
                return Err(format!("property {property} does not exist"));
            }
        }
        Instruction::CreateObject { table, key, .. } => {
            require_table(txn, table)?;
            if txn.contains(table, *key).map_err(|e| e.to_string())? {
                return Err(format!("object {key} already exists"));
            }
        }
        Instruction::EraseObject { table, key, values } => {
            if existing(txn, table, *key)? != *values {
                return Err(format!("object {key} changed before erase"));
            }
        }
        Instruction::Set {
            table,
            key,
            property,
            old,
            ..
        } => {
            existing(txn, table, *key)?;
            let current = txn
                .get_value(table, *key, property)
                .map_err(|e| e.to_string())?;
            expect_value(&current, old, property)?;
        }
        Instruction::ListInsert {
            table,
            key,
            property,
            index,
            ..
        } => {
            let items = list(txn, table, *key, property)?;
            if *index > items.len() {
                return Err(format!("insert at {index} past end of {property} ({})", items.len()));
            }
        }
        Instruction::ListSet {
            table,
            key,
            property,
            index,
            old,
            ..
        }
        | Instruction::ListErase {
            table,
            key,
            property,
            index,
            old,
        } => {
            let items = list(txn, table, *key, property)?;
            match items.get(*index) {
                Some(current) => expect_value(current, old, property)?,
                None => return Err(format!("{property}[{index}] does not exist")),
            }
        }
        Instruction::ListMove {
            table,
            key,
            property,
            from,
            to,
        } => {
            let len = list(txn, table, *key, property)?.len();
            if *from >= len || *to >= len {
                return Err(format!("move {from}->{to} out of range for {property} ({len})"));
            }
        }
        Instruction::ListClear {
            table,
            key,
            property,
            old,
        } => {
            if list(txn, table, *key, property)? != *old {
                return Err(format!("{property} changed before clear"));
            }
        }
    }
    Ok(())
}

fn require_table(txn: &WriteTransaction, table: &str) -> Result<(), String> {
    if txn.has_table(table) {
        Ok(())
    } else {
        Err(format!("table {table} does not exist"))
    }
}

fn existing(txn: &WriteTransaction, table: &str, key: ObjectKey) -> Result<Vec<Value>, String> {
    require_table(txn, table)?;
    txn.get(table, key)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("object {key} does not exist"))
}

fn list(
    txn: &WriteTransaction,
    table: &str,
    key: ObjectKey,
    property: &str,
) -> Result<Vec<Value>, String> {
    existing(txn, table, key)?;
    txn.list(table, key, property).map_err(|e| e.to_string())
}

fn expect_value(current: &Value, old: &Value, property: &str) -> Result<(), String> {
    if current == old {
        Ok(())
    } else {
        Err(format!("{property} is {current:?}, expected {old:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tarn_store::StoreConfig;
    use tarn_types::{ObjectSchema, Property, PropertyType, Schema};

    fn schema() -> Schema {
        Schema::new(vec![ObjectSchema::new(
            "Dog",
            vec![
                Property::new("name", PropertyType::String),
                Property::new("age", PropertyType::Int),
            ],
        )])
    }

    fn open(dir: &tempfile::TempDir, name: &str) -> VersionedStore {
        VersionedStore::open_with_schema(
            dir.path().join(name),
            StoreConfig::ephemeral(),
            &schema(),
            1,
        )
        .unwrap()
    }

    fn add_dog(store: &VersionedStore, name: &str, age: i64) -> (ObjectKey, Version) {
        let mut txn = store.begin_write().unwrap();
        let key = txn
            .create_object("Dog", vec![Value::from(name), Value::Int(age)])
            .unwrap();
        (key, txn.commit().unwrap())
    }

    fn connected(store: &VersionedStore) -> SyncSession {
        let session = SyncSession::new(store.clone()).unwrap();
        session.connect().unwrap();
        session.connected().unwrap();
        session
    }

    #[test]
    fn connection_state_follows_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "a.tarn");
        let session = SyncSession::new(store).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _token = session.observe_connection(move |_, new| sink.lock().unwrap().push(new));

        session.connect().unwrap();
        session.connected().unwrap();
        session.suspend().unwrap();
        session.resume().unwrap();
        session.connected().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnected,
                ConnectionState::Connecting,
                ConnectionState::Connected,
            ]
        );
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn invalid_transition_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let session = SyncSession::new(open(&dir, "a.tarn")).unwrap();
        let err = session.resume().unwrap_err();
        assert!(matches!(err, SyncError::InvalidTransition { action: "resume", .. }));
        assert_eq!(session.state(), SessionState::Inactive);
    }

    #[test]
    fn pending_uploads_are_coalesced() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "a.tarn");
        add_dog(&store, "before", 1);
        let session = connected(&store);

        add_dog(&store, "rex", 2);
        let (_, v) = add_dog(&store, "fido", 3);
        session.local_version_advanced(v).unwrap();

        let upload = session.take_pending_upload().unwrap().unwrap();
        assert_eq!(upload.to, v);
        assert_eq!(upload.table("Dog").unwrap().insertions.len(), 2);
        assert!(session.take_pending_upload().unwrap().is_none());

        assert_eq!(session.progress(ProgressDirection::Upload).transferred, 0);
        session.upload_completed();
        let progress = session.progress(ProgressDirection::Upload);
        assert_eq!(progress.transferable, 2);
        assert!(progress.is_transfer_complete());
        assert!(session.take_pending_upload().unwrap().is_none());
    }

    #[test]
    fn suspend_retakes_unacknowledged_upload() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "a.tarn");
        let session = connected(&store);
        let (_, v) = add_dog(&store, "rex", 2);
        session.local_version_advanced(v).unwrap();
        assert!(session.take_pending_upload().unwrap().is_some());

        session.suspend().unwrap();
        assert!(matches!(
            session.take_pending_upload(),
            Err(SyncError::NotConnected(SessionState::Suspended))
        ));
        session.resume().unwrap();
        session.connected().unwrap();
        assert_eq!(session.take_pending_upload().unwrap().unwrap().to, v);
    }

    #[test]
    fn remote_changeset_is_applied_and_not_uploaded_back() {
        let dir = tempfile::tempdir().unwrap();
        let server = open(&dir, "server.tarn");
        let client = open(&dir, "client.tarn");
        let session = connected(&client);
        let commits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&commits);
        session.set_commit_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (_, v) = add_dog(&server, "fido", 4);
        let remote = server.changeset(Version::ZERO, v).unwrap();
        session.download_announced(remote.len() as u64);
        let applied = session.remote_changeset_available(&remote).unwrap();

        let read = client.read(applied).unwrap();
        assert_eq!(read.len("Dog").unwrap(), 1);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert!(session.progress(ProgressDirection::Download).is_transfer_complete());

        session.local_version_advanced(applied).unwrap();
        assert!(session.take_pending_upload().unwrap().is_none());
    }

    #[test]
    fn stale_set_is_a_merge_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let server = open(&dir, "server.tarn");
        let client = open(&dir, "client.tarn");
        let (key, v1) = add_dog(&server, "fido", 4);
        let (_, c1) = add_dog(&client, "fido", 4);
        let session = connected(&client);

        let mut txn = server.begin_write().unwrap();
        txn.set("Dog", key, "age", Value::Int(5)).unwrap();
        let v2 = txn.commit().unwrap();

        let mut txn = client.begin_write().unwrap();
        txn.set("Dog", key, "age", Value::Int(9)).unwrap();
        let c2 = txn.commit().unwrap();
        assert_eq!(c1, v1);

        let err = session
            .remote_changeset_available(&server.changeset(v1, v2).unwrap())
            .unwrap_err();
        assert!(matches!(err, SyncError::MergeConflict { .. }));
        assert_eq!(err.kind(), tarn_store::ErrorKind::MergeConflict);
        assert_eq!(client.latest_version().unwrap(), c2);
        assert_eq!(
            client.read_latest().unwrap().get_value("Dog", key, "age").unwrap(),
            Value::Int(9)
        );
    }

    #[test]
    fn duplicate_create_is_a_merge_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let server = open(&dir, "server.tarn");
        let client = open(&dir, "client.tarn");
        let (_, v) = add_dog(&server, "fido", 4);
        add_dog(&client, "rex", 1);
        let session = connected(&client);
        let err = session
            .remote_changeset_available(&server.changeset(Version::ZERO, v).unwrap())
            .unwrap_err();
        assert!(matches!(err, SyncError::MergeConflict { ref table, .. } if table == "Dog"));
    }

    #[test]
    fn remote_changes_need_a_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, "a.tarn");
        let session = SyncSession::new(store.clone()).unwrap();
        let changeset = Changeset::empty(Version::ZERO);
        assert!(matches!(
            session.remote_changeset_available(&changeset),
            Err(SyncError::NotConnected(SessionState::Inactive))
        ));
    }
}
