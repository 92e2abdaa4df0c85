//! Notifiers: recompute what an observer sees between two versions.
//!
//! A notifier is prepared once against the version its observer starts
//! from. After that, every [`Notifier::run`] receives a newer snapshot and
//! the changeset from the notifier's last version up to it, and reports
//! what changed for its collection or object, if anything.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tarn_changeset::Changeset;
use tarn_store::Snapshot;
use tarn_types::{ObjectKey, ObjectSchema, Value, Version};
use tracing::{trace, warn};

use crate::delta::{calculate_ordered, calculate_unordered, CollectionDelta};
use crate::error::{NotifyError, NotifyResult};
use crate::list::ListChangeBuilder;
use crate::query::Query;

/// What changed for one observed object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectChange {
    pub properties: BTreeSet<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delta {
    Collection(CollectionDelta),
    Object(ObjectChange),
}

/// An event delivered to an observer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ChangeEvent {
    /// The state at registration; always the first event.
    Initial { version: Version },
    /// Something the observer can see changed.
    Update { version: Version, delta: Delta },
    /// The observed object or table is gone. Nothing follows.
    Invalidated { version: Version },
}

impl ChangeEvent {
    pub fn version(&self) -> Version {
        match self {
            Self::Initial { version }
            | Self::Update { version, .. }
            | Self::Invalidated { version } => *version,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Invalidated { .. })
    }

    pub fn collection_delta(&self) -> Option<&CollectionDelta> {
        match self {
            Self::Update {
                delta: Delta::Collection(delta),
                ..
            } => Some(delta),
            _ => None,
        }
    }
}

/// Background computation for one observer.
pub trait Notifier: Send {
    /// Capture the observed state at `snapshot`.
    fn prepare(&mut self, snapshot: &dyn Snapshot) -> NotifyResult<()>;

    /// The version the notifier last looked at.
    fn version(&self) -> Version;

    /// Table whose changes this notifier reacts to.
    fn table(&self) -> &str;

    /// Advance to `snapshot`. `changeset` spans [`version`](Self::version)
    /// to `snapshot.version()`. Returns `None` when nothing visible changed.
    fn run(
        &mut self,
        snapshot: &dyn Snapshot,
        changeset: &Changeset,
    ) -> NotifyResult<Option<ChangeEvent>>;
}

/// Returns `true` if `row` links, directly or through a list, to an object
/// the changeset modified.
fn links_changed(schema: &ObjectSchema, row: &[Value], changeset: &Changeset) -> bool {
    schema
        .properties
        .iter()
        .zip(row)
        .any(|(property, value)| match property.ty.link_target() {
            Some(target) if changeset.touches_table(target) => match value {
                Value::Link(key) => changeset.is_modified(target, *key),
                Value::List(items) => items
                    .iter()
                    .filter_map(Value::as_link)
                    .any(|key| changeset.is_modified(target, key)),
                _ => false,
            },
            _ => false,
        })
}

fn has_touched_links(schema: &ObjectSchema, changeset: &Changeset) -> bool {
    schema.properties.iter().any(|p| {
        p.ty
            .link_target()
            .is_some_and(|target| changeset.touches_table(target))
    })
}

fn table_gone(snapshot: &dyn Snapshot, changeset: &Changeset, table: &str) -> bool {
    !snapshot.has_table(table) || changeset.table(table).is_some_and(|t| t.removed)
}

// ---------------------------------------------------------------------------
// ResultsNotifier
// ---------------------------------------------------------------------------

/// Watches the results of a [`Query`].
#[derive(Debug)]
pub struct ResultsNotifier {
    query: Query,
    keys: Vec<ObjectKey>,
    version: Version,
}

impl ResultsNotifier {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            keys: Vec::new(),
            version: Version::ZERO,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Result keys as of [`Notifier::version`].
    pub fn keys(&self) -> &[ObjectKey] {
        &self.keys
    }
}

impl Notifier for ResultsNotifier {
    fn prepare(&mut self, snapshot: &dyn Snapshot) -> NotifyResult<()> {
        self.keys = self.query.run(snapshot)?;
        self.version = snapshot.version();
        Ok(())
    }

    fn version(&self) -> Version {
        self.version
    }

    fn table(&self) -> &str {
        &self.query.table
    }

    fn run(
        &mut self,
        snapshot: &dyn Snapshot,
        changeset: &Changeset,
    ) -> NotifyResult<Option<ChangeEvent>> {
        let version = snapshot.version();
        let table = self.query.table.clone();
        if table_gone(snapshot, changeset, &table) {
            self.version = version;
            return Ok(Some(ChangeEvent::Invalidated { version }));
        }

        let schema = snapshot.object_schema(&table)?.clone();
        let check_links = has_touched_links(&schema, changeset);
        if !changeset.touches_table(&table) && !check_links {
            self.version = version;
            return Ok(None);
        }

        let new_keys = self.query.run(snapshot)?;
        let mut failure: Option<NotifyError> = None;
        let is_modified = |_: usize, new_index: usize| {
            let key = new_keys[new_index];
            if changeset.is_modified(&table, key) {
                return true;
            }
            if !check_links {
                return false;
            }
            match snapshot.get(&table, key) {
                Ok(Some(row)) => links_changed(&schema, &row, changeset),
                Ok(None) => false,
                Err(e) => {
                    failure.get_or_insert(e.into());
                    false
                }
            }
        };
        // A key that was erased and created again names a different object,
        // so the two must not be diffed as equal.
        let old_ids: Vec<(ObjectKey, bool)> = self.keys.iter().map(|k| (*k, false)).collect();
        let new_ids: Vec<(ObjectKey, bool)> = new_keys
            .iter()
            .map(|k| (*k, changeset.is_replaced(&table, *k)))
            .collect();
        let delta = if self.query.is_key_ordered() {
            calculate_unordered(&old_ids, &new_ids, is_modified)
        } else {
            calculate_ordered(&old_ids, &new_ids, is_modified)
        };
        if let Some(e) = failure {
            return Err(e);
        }

        trace!(
            table = %table,
            deletions = delta.deletions.len(),
            insertions = delta.insertions.len(),
            modifications = delta.modifications.len(),
            "results diffed"
        );
        self.keys = new_keys;
        self.version = version;
        if delta.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChangeEvent::Update {
            version,
            delta: Delta::Collection(delta),
        }))
    }
}

// ---------------------------------------------------------------------------
// ListNotifier
// ---------------------------------------------------------------------------

/// Watches one list property of one object.
#[derive(Debug)]
pub struct ListNotifier {
    table: String,
    key: ObjectKey,
    property: String,
    len: usize,
    version: Version,
}

impl ListNotifier {
    pub fn new(table: impl Into<String>, key: ObjectKey, property: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key,
            property: property.into(),
            len: 0,
            version: Version::ZERO,
        }
    }
}

impl Notifier for ListNotifier {
    fn prepare(&mut self, snapshot: &dyn Snapshot) -> NotifyResult<()> {
        self.len = snapshot.list(&self.table, self.key, &self.property)?.len();
        self.version = snapshot.version();
        Ok(())
    }

    fn version(&self) -> Version {
        self.version
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn run(
        &mut self,
        snapshot: &dyn Snapshot,
        changeset: &Changeset,
    ) -> NotifyResult<Option<ChangeEvent>> {
        let version = snapshot.version();
        self.version = version;
        if table_gone(snapshot, changeset, &self.table)
            || changeset.is_deleted(&self.table, self.key)
        {
            return Ok(Some(ChangeEvent::Invalidated { version }));
        }
        let schema = snapshot.object_schema(&self.table)?.clone();
        let Some(property) = schema.property(&self.property) else {
            return Ok(Some(ChangeEvent::Invalidated { version }));
        };

        let mut builder = ListChangeBuilder::new(self.len);
        for instruction in changeset.list_instructions(&self.table, self.key, &self.property) {
            builder.apply(instruction);
        }
        if builder.is_invalidated() {
            return Ok(Some(ChangeEvent::Invalidated { version }));
        }

        let items = snapshot.list(&self.table, self.key, &self.property)?;
        let target = property.ty.link_target().map(str::to_string);
        let check_links = target
            .as_deref()
            .is_some_and(|target| changeset.touches_table(target));
        let is_modified = |index: usize| match (&target, items.get(index)) {
            (Some(target), Some(Value::Link(key))) if check_links => {
                changeset.is_modified(target, *key)
            }
            _ => false,
        };

        let delta = if builder.len() == items.len() {
            builder.finish(is_modified)
        } else {
            // The log and the stored list disagree; report a full reset.
            warn!(
                table = %self.table,
                key = %self.key,
                property = %self.property,
                "list log does not match stored list"
            );
            CollectionDelta::replace_all(self.len, items.len())
        };
        self.len = items.len();
        if delta.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChangeEvent::Update {
            version,
            delta: Delta::Collection(delta),
        }))
    }
}

// ---------------------------------------------------------------------------
// ObjectNotifier
// ---------------------------------------------------------------------------

/// Watches the properties of one object.
#[derive(Debug)]
pub struct ObjectNotifier {
    table: String,
    key: ObjectKey,
    version: Version,
}

impl ObjectNotifier {
    pub fn new(table: impl Into<String>, key: ObjectKey) -> Self {
        Self {
            table: table.into(),
            key,
            version: Version::ZERO,
        }
    }
}

impl Notifier for ObjectNotifier {
    fn prepare(&mut self, snapshot: &dyn Snapshot) -> NotifyResult<()> {
        if !snapshot.contains(&self.table, self.key)? {
            return Err(tarn_store::StoreError::NoSuchObject {
                table: self.table.clone(),
                key: self.key,
            }
            .into());
        }
        self.version = snapshot.version();
        Ok(())
    }

    fn version(&self) -> Version {
        self.version
    }

    fn table(&self) -> &str {
        &self.table
    }

    fn run(
        &mut self,
        snapshot: &dyn Snapshot,
        changeset: &Changeset,
    ) -> NotifyResult<Option<ChangeEvent>> {
        let version = snapshot.version();
        self.version = version;
        if table_gone(snapshot, changeset, &self.table)
            || changeset.is_deleted(&self.table, self.key)
        {
            return Ok(Some(ChangeEvent::Invalidated { version }));
        }
        let properties = changeset.modified_properties(&self.table, self.key);
        if properties.is_empty() {
            return Ok(None);
        }
        Ok(Some(ChangeEvent::Update {
            version,
            delta: Delta::Object(ObjectChange { properties }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Predicate;
    use tarn_store::{StoreConfig, VersionedStore};
    use tarn_types::{Property, PropertyType, Schema};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: VersionedStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::new(vec![
            ObjectSchema::new(
                "Dog",
                vec![
                    Property::new("id", PropertyType::Int),
                    Property::new("name", PropertyType::String),
                ],
            )
            .with_primary_key("id"),
            ObjectSchema::new(
                "Person",
                vec![
                    Property::new("name", PropertyType::String),
                    Property::new("dogs", PropertyType::list(PropertyType::link("Dog"))),
                ],
            ),
        ]);
        let store = VersionedStore::open_with_schema(
            dir.path().join("n.tarn"),
            StoreConfig::ephemeral(),
            &schema,
            1,
        )
        .unwrap();
        Fixture { _dir: dir, store }
    }

    /// Commit `edit` and run `notifier` across it.
    fn step(
        store: &VersionedStore,
        notifier: &mut dyn Notifier,
        edit: impl FnOnce(&mut tarn_store::WriteTransaction),
    ) -> Option<ChangeEvent> {
        let mut txn = store.begin_write().unwrap();
        edit(&mut txn);
        let version = txn.commit().unwrap();
        let changeset = store.changeset(notifier.version(), version).unwrap();
        let read = store.read(version).unwrap();
        notifier.run(&read, &changeset).unwrap()
    }

    fn dog(txn: &mut tarn_store::WriteTransaction, id: i64, name: &str) -> ObjectKey {
        txn.create_object("Dog", vec![Value::Int(id), Value::from(name)])
            .unwrap()
    }

    #[test]
    fn results_insert_lands_at_index_zero() {
        let f = fixture();
        let mut notifier =
            ResultsNotifier::new(Query::table("Dog").filter(Predicate::eq("name", "fido")));
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();
        assert!(notifier.keys().is_empty());

        let event = step(&f.store, &mut notifier, |txn| {
            dog(txn, 1, "fido");
        })
        .unwrap();
        assert_eq!(event.version(), Version::new(1));
        let delta = event.collection_delta().unwrap();
        assert_eq!(delta.insertions.as_slice(), &[0]);
        assert!(delta.deletions.is_empty());
        assert!(delta.modifications.is_empty());
    }

    #[test]
    fn results_ignore_unrelated_changes() {
        let f = fixture();
        let mut notifier = ResultsNotifier::new(Query::table("Dog"));
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();
        let event = step(&f.store, &mut notifier, |txn| {
            txn.create_object("Person", vec![Value::from("ann"), Value::List(vec![])])
                .unwrap();
        });
        assert_eq!(event, None);
        assert_eq!(notifier.version(), Version::new(1));
    }

    #[test]
    fn results_report_modifications_and_sort_moves() {
        let f = fixture();
        let mut txn = f.store.begin_write().unwrap();
        let a = dog(&mut txn, 1, "ace");
        dog(&mut txn, 2, "bo");
        dog(&mut txn, 3, "cy");
        txn.commit().unwrap();

        let mut notifier = ResultsNotifier::new(Query::table("Dog").sorted_by("name", true));
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();

        let event = step(&f.store, &mut notifier, |txn| {
            txn.set("Dog", a, "name", Value::from("zed")).unwrap();
        })
        .unwrap();
        let delta = event.collection_delta().unwrap();
        assert_eq!(delta.deletions.as_slice(), &[0]);
        assert_eq!(delta.insertions.as_slice(), &[2]);
        assert_eq!(delta.moves.len(), 1);

        let b = ObjectKey::new(1);
        let event = step(&f.store, &mut notifier, |txn| {
            txn.set("Dog", b, "name", Value::from("bob")).unwrap();
        })
        .unwrap();
        let delta = event.collection_delta().unwrap();
        assert_eq!(delta.modifications.as_slice(), &[0]);
        assert!(delta.insertions.is_empty());
    }

    #[test]
    fn results_see_linked_object_changes() {
        let f = fixture();
        let mut txn = f.store.begin_write().unwrap();
        let rex = dog(&mut txn, 1, "rex");
        txn.create_object(
            "Person",
            vec![Value::from("ann"), Value::List(vec![Value::Link(rex)])],
        )
        .unwrap();
        txn.commit().unwrap();

        let mut notifier = ResultsNotifier::new(Query::table("Person"));
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();
        let event = step(&f.store, &mut notifier, |txn| {
            txn.set("Dog", rex, "name", Value::from("max")).unwrap();
        })
        .unwrap();
        assert_eq!(event.collection_delta().unwrap().modifications.as_slice(), &[0]);
    }

    #[test]
    fn list_notifier_tracks_edits() {
        let f = fixture();
        let mut txn = f.store.begin_write().unwrap();
        let a = dog(&mut txn, 1, "a");
        let b = dog(&mut txn, 2, "b");
        let owner = txn
            .create_object(
                "Person",
                vec![Value::from("ann"), Value::List(vec![Value::Link(a), Value::Link(b)])],
            )
            .unwrap();
        txn.commit().unwrap();

        let mut notifier = ListNotifier::new("Person", owner, "dogs");
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();

        let event = step(&f.store, &mut notifier, |txn| {
            let c = dog(txn, 3, "c");
            txn.list_insert("Person", owner, "dogs", 0, Value::Link(c)).unwrap();
            txn.list_remove("Person", owner, "dogs", 2).unwrap();
        })
        .unwrap();
        let delta = event.collection_delta().unwrap();
        assert_eq!(delta.insertions.as_slice(), &[0]);
        assert_eq!(delta.deletions.as_slice(), &[1]);

        let event = step(&f.store, &mut notifier, |txn| {
            txn.set("Dog", a, "name", Value::from("alf")).unwrap();
        })
        .unwrap();
        let delta = event.collection_delta().unwrap();
        assert_eq!(delta.modifications_new.as_slice(), &[1]);

        let event = step(&f.store, &mut notifier, |txn| {
            txn.delete_object("Person", owner).unwrap();
        })
        .unwrap();
        assert!(event.is_terminal());
    }

    #[test]
    fn object_notifier_reports_properties_then_invalidates() {
        let f = fixture();
        let mut txn = f.store.begin_write().unwrap();
        let rex = dog(&mut txn, 1, "rex");
        txn.commit().unwrap();

        let mut notifier = ObjectNotifier::new("Dog", rex);
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();

        let event = step(&f.store, &mut notifier, |txn| {
            txn.set("Dog", rex, "name", Value::from("max")).unwrap();
        })
        .unwrap();
        match event {
            ChangeEvent::Update {
                delta: Delta::Object(change),
                ..
            } => assert_eq!(change.properties, BTreeSet::from(["name".to_string()])),
            other => panic!("unexpected {other:?}"),
        }

        let event = step(&f.store, &mut notifier, |txn| {
            txn.delete_object("Dog", rex).unwrap();
        });
        assert_eq!(event, Some(ChangeEvent::Invalidated { version: Version::new(3) }));
    }

    #[test]
    fn removed_table_invalidates_results() {
        let f = fixture();
        let mut notifier = ResultsNotifier::new(Query::table("Person"));
        notifier.prepare(&f.store.read_latest().unwrap()).unwrap();
        let event = step(&f.store, &mut notifier, |txn| {
            txn.remove_table("Person").unwrap();
        })
        .unwrap();
        assert!(event.is_terminal());
    }

    fn person_schema() -> ObjectSchema {
        ObjectSchema::new(
            "Person",
            vec![
                Property::new("name", PropertyType::String),
                Property::new("dogs", PropertyType::list(PropertyType::link("Dog"))),
            ],
        )
    }

    #[test]
    fn readded_table_still_invalidates() {
        let f = fixture();
        let mut txn = f.store.begin_write().unwrap();
        let tom = txn
            .create_object("Person", vec![Value::from("tom"), Value::List(vec![])])
            .unwrap();
        txn.commit().unwrap();

        let snapshot = f.store.read_latest().unwrap();
        let mut results = ResultsNotifier::new(Query::table("Person"));
        results.prepare(&snapshot).unwrap();
        let mut object = ObjectNotifier::new("Person", tom);
        object.prepare(&snapshot).unwrap();

        let mut txn = f.store.begin_write().unwrap();
        txn.remove_table("Person").unwrap();
        txn.add_table(person_schema()).unwrap();
        let felix = txn
            .create_object("Person", vec![Value::from("felix"), Value::List(vec![])])
            .unwrap();
        let version = txn.commit().unwrap();
        assert_ne!(felix, tom);

        let read = f.store.read(version).unwrap();
        let changeset = f.store.changeset(results.version(), version).unwrap();
        let event = results.run(&read, &changeset).unwrap();
        assert_eq!(event, Some(ChangeEvent::Invalidated { version }));
        let event = object.run(&read, &changeset).unwrap();
        assert_eq!(event, Some(ChangeEvent::Invalidated { version }));
    }

    #[test]
    fn recreated_key_is_a_different_object() {
        let f = fixture();
        let mut txn = f.store.begin_write().unwrap();
        let rex = dog(&mut txn, 1, "rex");
        txn.commit().unwrap();

        let snapshot = f.store.read_latest().unwrap();
        let mut results = ResultsNotifier::new(Query::table("Dog"));
        results.prepare(&snapshot).unwrap();
        let mut object = ObjectNotifier::new("Dog", rex);
        object.prepare(&snapshot).unwrap();

        let mut txn = f.store.begin_write().unwrap();
        txn.delete_object("Dog", rex).unwrap();
        txn.create_object_with_key("Dog", rex, vec![Value::Int(1), Value::from("max")])
            .unwrap();
        let version = txn.commit().unwrap();

        let read = f.store.read(version).unwrap();
        let changeset = f.store.changeset(results.version(), version).unwrap();
        let event = results.run(&read, &changeset).unwrap().unwrap();
        let delta = event.collection_delta().unwrap();
        assert_eq!(delta.deletions.as_slice(), &[0]);
        assert_eq!(delta.insertions.as_slice(), &[0]);
        assert!(delta.modifications.is_empty());
        assert_eq!(results.keys(), &[rex]);

        let event = object.run(&read, &changeset).unwrap();
        assert_eq!(event, Some(ChangeEvent::Invalidated { version }));
    }

    #[test]
    fn missing_object_cannot_be_observed() {
        let f = fixture();
        let mut notifier = ObjectNotifier::new("Dog", ObjectKey::new(42));
        let err = notifier.prepare(&f.store.read_latest().unwrap()).unwrap_err();
        assert!(matches!(err, NotifyError::Store(_)));
    }
}
