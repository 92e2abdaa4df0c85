//! Cross-version changesets: the folded effect of every transaction log in a
//! version range, addressed by object key.

use std::collections::{BTreeMap, BTreeSet};

use tarn_types::{ObjectKey, Version};
use tracing::debug;

use crate::error::{ChangesetError, ChangesetResult};
use crate::instruction::{Instruction, LogRecord, TransactionLog};
use crate::replay::ReplayTarget;

/// Net effect of a version range on one table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableChanges {
    /// Objects created inside the range that still exist at its end.
    pub insertions: BTreeSet<ObjectKey>,
    /// Objects that existed before the range and were erased inside it. A
    /// key erased and then created again is in both sets: the new object is
    /// a different one.
    pub deletions: BTreeSet<ObjectKey>,
    /// Pre-existing, surviving objects and the properties changed on them.
    pub modifications: BTreeMap<ObjectKey, BTreeSet<String>>,
    /// A column was added or removed.
    pub schema_changed: bool,
    /// The table was created inside the range.
    pub added: bool,
    /// The table was removed inside the range. Stays set if it was added
    /// again afterwards.
    pub removed: bool,
}

impl TableChanges {
    pub fn is_empty(&self) -> bool {
        self.insertions.is_empty()
            && self.deletions.is_empty()
            && self.modifications.is_empty()
            && !self.schema_changed
            && !self.added
            && !self.removed
    }

    pub fn is_modified(&self, key: ObjectKey) -> bool {
        self.modifications.contains_key(&key)
    }

    /// The object at `key` was erased and a new one created under the same key.
    pub fn is_replaced(&self, key: ObjectKey) -> bool {
        self.deletions.contains(&key) && self.insertions.contains(&key)
    }

    fn fold(&mut self, instruction: &Instruction) {
        match instruction {
            Instruction::AddTable { .. } => {
                self.added = true;
                self.schema_changed = true;
            }
            Instruction::RemoveTable { .. } => {
                self.removed = true;
                self.insertions.clear();
                self.modifications.clear();
            }
            Instruction::AddProperty { .. } | Instruction::RemoveProperty { .. } => {
                self.schema_changed = true;
            }
            Instruction::CreateObject { key, .. } => {
                self.insertions.insert(*key);
            }
            Instruction::EraseObject { key, .. } => {
                if !self.insertions.remove(key) {
                    self.deletions.insert(*key);
                    self.modifications.remove(key);
                }
            }
            other => {
                let (Some(key), Some(property)) = (other.object(), other.property()) else {
                    return;
                };
                if self.insertions.contains(&key) {
                    return;
                }
                self.modifications
                    .entry(key)
                    .or_default()
                    .insert(property.to_string());
            }
        }
    }
}

/// A record tagged with the version whose transaction produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct VersionedRecord {
    pub version: Version,
    pub record: LogRecord,
}

/// The structured difference between two versions of a file.
///
/// Built by folding the transaction logs of every version in `(from, to]`.
/// The ordered `records` keep commit order (version, then sequence number) so
/// the changeset can be replayed; `tables` holds the per-table summary used
/// for notification diffing.
#[derive(Clone, Debug, PartialEq)]
pub struct Changeset {
    pub from: Version,
    pub to: Version,
    pub tables: BTreeMap<String, TableChanges>,
    pub records: Vec<VersionedRecord>,
}

impl Changeset {
    /// A changeset with no changes at `version`.
    pub fn empty(version: Version) -> Self {
        Self {
            from: version,
            to: version,
            tables: BTreeMap::new(),
            records: Vec::new(),
        }
    }

    /// Fold the logs covering `(from, to]` into a changeset.
    ///
    /// `logs` must contain exactly one log per version in the range, in
    /// ascending order; anything else is a [`ChangesetError::Gap`].
    pub fn from_logs(from: Version, to: Version, logs: &[TransactionLog]) -> ChangesetResult<Self> {
        if from > to {
            return Err(ChangesetError::InvalidRange { from, to });
        }

        let mut changeset = Self::empty(from);
        let mut expected = from.next();
        for log in logs {
            if log.version != expected {
                return Err(ChangesetError::Gap {
                    expected,
                    found: Some(log.version),
                });
            }
            changeset.push_log(log);
            expected = expected.next();
        }
        if changeset.to != to {
            return Err(ChangesetError::Gap {
                expected,
                found: None,
            });
        }

        debug!(%from, %to, records = changeset.records.len(), "changeset folded");
        Ok(changeset)
    }

    /// Extend the changeset with the log of the version directly after `to`.
    pub fn push_log(&mut self, log: &TransactionLog) {
        for record in &log.records {
            self.tables
                .entry(record.instruction.table().to_string())
                .or_default()
                .fold(&record.instruction);
            self.records.push(VersionedRecord {
                version: log.version,
                record: record.clone(),
            });
        }
        self.to = log.version;
    }

    /// Returns `true` if no table changed.
    pub fn is_empty(&self) -> bool {
        self.tables.values().all(TableChanges::is_empty)
    }

    /// Number of low-level records in the range.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn table(&self, name: &str) -> Option<&TableChanges> {
        self.tables.get(name)
    }

    /// Returns `true` if anything in `table` changed.
    pub fn touches_table(&self, table: &str) -> bool {
        self.tables.get(table).is_some_and(|t| !t.is_empty())
    }

    pub fn is_modified(&self, table: &str, key: ObjectKey) -> bool {
        self.tables.get(table).is_some_and(|t| t.is_modified(key))
    }

    pub fn is_replaced(&self, table: &str, key: ObjectKey) -> bool {
        self.tables.get(table).is_some_and(|t| t.is_replaced(key))
    }

    pub fn is_deleted(&self, table: &str, key: ObjectKey) -> bool {
        self.tables
            .get(table)
            .is_some_and(|t| t.removed || t.deletions.contains(&key))
    }

    /// Properties changed on `key`, empty if none.
    pub fn modified_properties(&self, table: &str, key: ObjectKey) -> BTreeSet<String> {
        self.tables
            .get(table)
            .and_then(|t| t.modifications.get(&key))
            .cloned()
            .unwrap_or_default()
    }

    /// The list instructions applied to one list property, in commit order.
    pub fn list_instructions<'a>(
        &'a self,
        table: &'a str,
        key: ObjectKey,
        property: &'a str,
    ) -> impl Iterator<Item = &'a Instruction> + 'a {
        self.records
            .iter()
            .map(|r| &r.record.instruction)
            .filter(move |i| {
                i.table() == table
                    && i.object() == Some(key)
                    && (i.property() == Some(property)
                        || matches!(i, Instruction::EraseObject { .. }))
            })
    }

    /// Apply every record, in commit order, to `target`.
    pub fn replay<T: ReplayTarget>(&self, target: &mut T) -> Result<(), T::Error> {
        for record in &self.records {
            target.apply(&record.record.instruction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::LogBuilder;
    use tarn_types::Value;

    fn create(key: u64) -> Instruction {
        Instruction::CreateObject {
            table: "Dog".into(),
            key: ObjectKey::new(key),
            values: vec![Value::from("rex")],
        }
    }

    fn erase(key: u64) -> Instruction {
        Instruction::EraseObject {
            table: "Dog".into(),
            key: ObjectKey::new(key),
            values: vec![Value::from("rex")],
        }
    }

    fn rename(key: u64) -> Instruction {
        Instruction::Set {
            table: "Dog".into(),
            key: ObjectKey::new(key),
            property: "name".into(),
            old: Value::from("rex"),
            new: Value::from("fido"),
        }
    }

    fn log(version: u64, instructions: Vec<Instruction>) -> TransactionLog {
        let mut builder = LogBuilder::new();
        for i in instructions {
            builder.push(i);
        }
        builder.finish(Version::new(version))
    }

    #[test]
    fn empty_range() {
        let cs = Changeset::from_logs(Version::new(4), Version::new(4), &[]).unwrap();
        assert!(cs.is_empty());
        assert_eq!(cs.len(), 0);
    }

    #[test]
    fn inverted_range_rejected() {
        assert!(matches!(
            Changeset::from_logs(Version::new(5), Version::new(4), &[]),
            Err(ChangesetError::InvalidRange { .. })
        ));
    }

    #[test]
    fn missing_log_is_a_gap() {
        let logs = vec![log(1, vec![create(0)]), log(3, vec![create(1)])];
        assert!(matches!(
            Changeset::from_logs(Version::ZERO, Version::new(3), &logs),
            Err(ChangesetError::Gap { .. })
        ));
        let logs = vec![log(1, vec![create(0)])];
        assert!(matches!(
            Changeset::from_logs(Version::ZERO, Version::new(2), &logs),
            Err(ChangesetError::Gap { found: None, .. })
        ));
    }

    #[test]
    fn insert_then_erase_nets_to_nothing() {
        let logs = vec![log(1, vec![create(0)]), log(2, vec![rename(0), erase(0)])];
        let cs = Changeset::from_logs(Version::ZERO, Version::new(2), &logs).unwrap();
        let dog = cs.table("Dog").unwrap();
        assert!(dog.insertions.is_empty());
        assert!(dog.deletions.is_empty());
        assert!(dog.modifications.is_empty());
        // The raw records are still kept for replay.
        assert_eq!(cs.len(), 3);
    }

    #[test]
    fn erase_then_create_same_key_is_a_replacement() {
        let logs = vec![
            log(3, vec![rename(0), erase(0)]),
            log(4, vec![create(0), rename(0)]),
        ];
        let cs = Changeset::from_logs(Version::new(2), Version::new(4), &logs).unwrap();
        let dog = cs.table("Dog").unwrap();
        assert!(dog.deletions.contains(&ObjectKey::new(0)));
        assert!(dog.insertions.contains(&ObjectKey::new(0)));
        assert!(dog.modifications.is_empty());
        assert!(cs.is_replaced("Dog", ObjectKey::new(0)));
        assert!(cs.is_deleted("Dog", ObjectKey::new(0)));
    }

    #[test]
    fn removal_is_kept_when_the_table_comes_back() {
        let schema = tarn_types::ObjectSchema::new("Dog", vec![]);
        let logs = vec![
            log(
                2,
                vec![
                    Instruction::RemoveTable { table: "Dog".into() },
                    Instruction::AddTable { schema },
                ],
            ),
            log(3, vec![create(7)]),
        ];
        let cs = Changeset::from_logs(Version::new(1), Version::new(3), &logs).unwrap();
        let dog = cs.table("Dog").unwrap();
        assert!(dog.removed);
        assert!(dog.added);
        assert!(dog.insertions.contains(&ObjectKey::new(7)));
        assert!(cs.is_deleted("Dog", ObjectKey::new(0)));
    }

    #[test]
    fn set_on_new_object_is_not_a_modification() {
        let logs = vec![log(1, vec![create(0), rename(0)])];
        let cs = Changeset::from_logs(Version::ZERO, Version::new(1), &logs).unwrap();
        assert!(cs.table("Dog").unwrap().insertions.contains(&ObjectKey::new(0)));
        assert!(!cs.is_modified("Dog", ObjectKey::new(0)));
    }

    #[test]
    fn erase_drops_prior_modifications() {
        let logs = vec![log(6, vec![rename(3)]), log(7, vec![erase(3)])];
        let cs = Changeset::from_logs(Version::new(5), Version::new(7), &logs).unwrap();
        assert!(cs.is_deleted("Dog", ObjectKey::new(3)));
        assert!(!cs.is_modified("Dog", ObjectKey::new(3)));
    }

    #[test]
    fn modifications_record_property_names() {
        let logs = vec![log(
            2,
            vec![
                rename(9),
                Instruction::ListInsert {
                    table: "Dog".into(),
                    key: ObjectKey::new(9),
                    property: "tags".into(),
                    index: 0,
                    value: Value::from("good"),
                },
            ],
        )];
        let cs = Changeset::from_logs(Version::new(1), Version::new(2), &logs).unwrap();
        let props = cs.modified_properties("Dog", ObjectKey::new(9));
        assert!(props.contains("name"));
        assert!(props.contains("tags"));
        assert_eq!(cs.list_instructions("Dog", ObjectKey::new(9), "tags").count(), 1);
    }

    #[test]
    fn records_keep_commit_order() {
        let logs = vec![log(1, vec![create(0), create(1)]), log(2, vec![rename(1)])];
        let cs = Changeset::from_logs(Version::ZERO, Version::new(2), &logs).unwrap();
        let order: Vec<(u64, u32)> = cs
            .records
            .iter()
            .map(|r| (r.version.value(), r.record.seq))
            .collect();
        assert_eq!(order, vec![(1, 0), (1, 1), (2, 0)]);
    }

    #[test]
    fn removed_table_marks_everything_deleted() {
        let logs = vec![log(2, vec![Instruction::RemoveTable { table: "Dog".into() }])];
        let cs = Changeset::from_logs(Version::new(1), Version::new(2), &logs).unwrap();
        assert!(cs.is_deleted("Dog", ObjectKey::new(42)));
        assert!(cs.touches_table("Dog"));
        assert!(!cs.touches_table("Cat"));
    }
}
