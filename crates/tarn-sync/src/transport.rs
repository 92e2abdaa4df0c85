use tarn_changeset::Changeset;

use crate::error::SyncResult;
use crate::session::SyncSession;

/// The network side of a sync session.
///
/// Implementations move changesets to and from a server; how they encode
/// them on the wire is their own business.
pub trait SyncTransport: Send {
    /// Send local changes. Returning `Ok` means the server acknowledged them.
    fn upload(&mut self, changeset: &Changeset) -> SyncResult<()>;

    /// The next changeset waiting on the server, if any.
    fn download(&mut self) -> SyncResult<Option<Changeset>>;
}

/// What one [`sync_once`] round moved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncRound {
    pub uploaded: usize,
    pub downloaded: usize,
}

/// Upload pending local changes, then apply everything the server has.
///
/// A transport failure moves the session into the error state before the
/// error is returned.
pub fn sync_once(session: &SyncSession, transport: &mut dyn SyncTransport) -> SyncResult<SyncRound> {
    let mut round = SyncRound::default();

    if let Some(changeset) = session.take_pending_upload()? {
        if let Err(err) = transport.upload(&changeset) {
            session.fail(err.to_string())?;
            return Err(err);
        }
        session.upload_completed();
        round.uploaded = changeset.len();
    }

    loop {
        let changeset = match transport.download() {
            Ok(Some(changeset)) => changeset,
            Ok(None) => break,
            Err(err) => {
                session.fail(err.to_string())?;
                return Err(err);
            }
        };
        session.remote_changeset_available(&changeset)?;
        round.downloaded += changeset.len();
    }

    Ok(round)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tarn_store::{Snapshot, StoreConfig, VersionedStore};
    use tarn_types::{ObjectSchema, Property, PropertyType, Schema, Value, Version};

    use crate::error::SyncError;
    use crate::state::SessionState;

    #[derive(Default)]
    struct Loopback {
        sent: Vec<Changeset>,
        inbox: VecDeque<Changeset>,
        broken: bool,
    }

    impl SyncTransport for Loopback {
        fn upload(&mut self, changeset: &Changeset) -> SyncResult<()> {
            if self.broken {
                return Err(SyncError::MergeConflict {
                    table: "Dog".into(),
                    reason: "server rejected upload".into(),
                });
            }
            self.sent.push(changeset.clone());
            Ok(())
        }

        fn download(&mut self) -> SyncResult<Option<Changeset>> {
            Ok(self.inbox.pop_front())
        }
    }

    fn open(dir: &tempfile::TempDir, name: &str) -> VersionedStore {
        let schema = Schema::new(vec![ObjectSchema::new(
            "Dog",
            vec![Property::new("name", PropertyType::String)],
        )]);
        VersionedStore::open_with_schema(dir.path().join(name), StoreConfig::ephemeral(), &schema, 1)
            .unwrap()
    }

    fn add_dog(store: &VersionedStore, name: &str) -> Version {
        let mut txn = store.begin_write().unwrap();
        txn.create_object("Dog", vec![Value::from(name)]).unwrap();
        txn.commit().unwrap()
    }

    #[test]
    fn round_trips_between_two_stores() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(&dir, "a.tarn");
        let b = open(&dir, "b.tarn");
        let session_a = SyncSession::new(a.clone()).unwrap();
        let session_b = SyncSession::new(b.clone()).unwrap();
        for session in [&session_a, &session_b] {
            session.connect().unwrap();
            session.connected().unwrap();
        }

        let v = add_dog(&a, "fido");
        session_a.local_version_advanced(v).unwrap();

        let mut wire = Loopback::default();
        let round = sync_once(&session_a, &mut wire).unwrap();
        assert_eq!(round, SyncRound { uploaded: 1, downloaded: 0 });

        let mut wire_b = Loopback {
            inbox: wire.sent.drain(..).collect(),
            ..Loopback::default()
        };
        let round = sync_once(&session_b, &mut wire_b).unwrap();
        assert_eq!(round.downloaded, 1);
        assert_eq!(b.read_latest().unwrap().len("Dog").unwrap(), 1);
    }

    #[test]
    fn transport_failure_puts_session_in_error() {
        let dir = tempfile::tempdir().unwrap();
        let a = open(&dir, "a.tarn");
        let session = SyncSession::new(a.clone()).unwrap();
        session.connect().unwrap();
        session.connected().unwrap();
        session.local_version_advanced(add_dog(&a, "rex")).unwrap();

        let mut wire = Loopback {
            broken: true,
            ..Loopback::default()
        };
        assert!(sync_once(&session, &mut wire).is_err());
        assert!(matches!(session.state(), SessionState::Error(_)));
    }
}
