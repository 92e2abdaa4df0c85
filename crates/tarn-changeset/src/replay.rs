//! Replaying changesets onto a target state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tarn_types::{ObjectKey, ObjectSchema, Value};

use crate::error::{ChangesetError, ChangesetResult};
use crate::instruction::Instruction;

/// Anything a changeset can be applied to.
pub trait ReplayTarget {
    type Error;

    /// Apply one instruction. Implementations must be deterministic.
    fn apply(&mut self, instruction: &Instruction) -> Result<(), Self::Error>;
}

/// Rows of one table, in property order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableState {
    pub schema: ObjectSchema,
    pub rows: BTreeMap<ObjectKey, Vec<Value>>,
}

impl TableState {
    pub fn new(schema: ObjectSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
        }
    }

    fn column(&self, property: &str) -> ChangesetResult<usize> {
        self.schema
            .property_index(property)
            .ok_or_else(|| replay_err(format!("no property {}.{property}", self.schema.name)))
    }

    fn row_mut(&mut self, key: ObjectKey) -> ChangesetResult<&mut Vec<Value>> {
        let name = &self.schema.name;
        self.rows
            .get_mut(&key)
            .ok_or_else(|| replay_err(format!("no object {name}{key}")))
    }

    fn list_mut(&mut self, key: ObjectKey, property: &str) -> ChangesetResult<&mut Vec<Value>> {
        let col = self.column(property)?;
        match self.row_mut(key)?.get_mut(col) {
            Some(Value::List(items)) => Ok(items),
            _ => Err(replay_err(format!("{property} is not a list"))),
        }
    }
}

/// Plain in-memory row state keyed by table name.
///
/// Mirrors what the store holds for the tables it contains, without paging or
/// versioning. Useful for checking that replaying a changeset reproduces a
/// later version exactly.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RowState {
    pub tables: BTreeMap<String, TableState>,
}

impl RowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&self, name: &str) -> Option<&TableState> {
        self.tables.get(name)
    }

    pub fn get(&self, table: &str, key: ObjectKey) -> Option<&[Value]> {
        self.tables
            .get(table)
            .and_then(|t| t.rows.get(&key))
            .map(Vec::as_slice)
    }

    fn table_mut(&mut self, name: &str) -> ChangesetResult<&mut TableState> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| replay_err(format!("no table {name}")))
    }
}

fn replay_err(msg: String) -> ChangesetError {
    ChangesetError::Replay(msg)
}

fn check_index(index: usize, len: usize) -> ChangesetResult<()> {
    if index >= len {
        return Err(replay_err(format!("list index {index} out of bounds ({len})")));
    }
    Ok(())
}

impl ReplayTarget for RowState {
    type Error = ChangesetError;

    fn apply(&mut self, instruction: &Instruction) -> ChangesetResult<()> {
        match instruction {
            Instruction::AddTable { schema } => {
                self.tables
                    .insert(schema.name.clone(), TableState::new(schema.clone()));
            }
            Instruction::RemoveTable { table } => {
                self.tables.remove(table);
            }
            Instruction::AddProperty {
                table,
                property,
                default,
            } => {
                let state = self.table_mut(table)?;
                state.schema.properties.push(property.clone());
                for row in state.rows.values_mut() {
                    row.push(default.clone());
                }
            }
            Instruction::RemoveProperty { table, property } => {
                let state = self.table_mut(table)?;
                let col = state.column(property)?;
                state.schema.properties.remove(col);
                if state.schema.primary_key.as_deref() == Some(property) {
                    state.schema.primary_key = None;
                }
                for row in state.rows.values_mut() {
                    row.remove(col);
                }
            }
            Instruction::CreateObject { table, key, values } => {
                let state = self.table_mut(table)?;
                if state.rows.insert(*key, values.clone()).is_some() {
                    return Err(replay_err(format!("object {table}{key} already exists")));
                }
            }
            Instruction::EraseObject { table, key, .. } => {
                if self.table_mut(table)?.rows.remove(key).is_none() {
                    return Err(replay_err(format!("no object {table}{key}")));
                }
            }
            Instruction::Set {
                table,
                key,
                property,
                new,
                ..
            } => {
                let state = self.table_mut(table)?;
                let col = state.column(property)?;
                state.row_mut(*key)?[col] = new.clone();
            }
            Instruction::ListInsert {
                table,
                key,
                property,
                index,
                value,
            } => {
                let list = self.table_mut(table)?.list_mut(*key, property)?;
                if *index > list.len() {
                    return Err(replay_err(format!("list index {index} out of bounds")));
                }
                list.insert(*index, value.clone());
            }
            Instruction::ListSet {
                table,
                key,
                property,
                index,
                new,
                ..
            } => {
                let list = self.table_mut(table)?.list_mut(*key, property)?;
                check_index(*index, list.len())?;
                list[*index] = new.clone();
            }
            Instruction::ListErase {
                table,
                key,
                property,
                index,
                ..
            } => {
                let list = self.table_mut(table)?.list_mut(*key, property)?;
                check_index(*index, list.len())?;
                list.remove(*index);
            }
            Instruction::ListMove {
                table,
                key,
                property,
                from,
                to,
            } => {
                let list = self.table_mut(table)?.list_mut(*key, property)?;
                check_index(*from, list.len())?;
                check_index(*to, list.len())?;
                let item = list.remove(*from);
                list.insert(*to, item);
            }
            Instruction::ListClear {
                table,
                key,
                property,
                ..
            } => {
                self.table_mut(table)?.list_mut(*key, property)?.clear();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changeset::Changeset;
    use crate::instruction::{LogBuilder, TransactionLog};
    use proptest::prelude::*;
    use tarn_types::{Property, PropertyType, Version};

    fn dog_table() -> ObjectSchema {
        ObjectSchema::new(
            "Dog",
            vec![
                Property::new("name", PropertyType::String),
                Property::new("tags", PropertyType::list(PropertyType::String)),
            ],
        )
    }

    fn base_state() -> RowState {
        let mut state = RowState::new();
        state
            .apply(&Instruction::AddTable { schema: dog_table() })
            .unwrap();
        state
    }

    #[test]
    fn create_set_erase() {
        let mut state = base_state();
        let key = ObjectKey::new(0);
        state
            .apply(&Instruction::CreateObject {
                table: "Dog".into(),
                key,
                values: vec![Value::from("rex"), Value::List(vec![])],
            })
            .unwrap();
        state
            .apply(&Instruction::Set {
                table: "Dog".into(),
                key,
                property: "name".into(),
                old: Value::from("rex"),
                new: Value::from("fido"),
            })
            .unwrap();
        assert_eq!(state.get("Dog", key).unwrap()[0], Value::from("fido"));

        state
            .apply(&Instruction::EraseObject {
                table: "Dog".into(),
                key,
                values: vec![],
            })
            .unwrap();
        assert!(state.get("Dog", key).is_none());
    }

    #[test]
    fn list_operations() {
        let mut state = base_state();
        let key = ObjectKey::new(1);
        let list = |items: &[&str]| Value::List(items.iter().map(|s| Value::from(*s)).collect());
        state
            .apply(&Instruction::CreateObject {
                table: "Dog".into(),
                key,
                values: vec![Value::from("rex"), list(&["a", "b", "c"])],
            })
            .unwrap();
        state
            .apply(&Instruction::ListMove {
                table: "Dog".into(),
                key,
                property: "tags".into(),
                from: 0,
                to: 2,
            })
            .unwrap();
        assert_eq!(state.get("Dog", key).unwrap()[1], list(&["b", "c", "a"]));

        let err = state.apply(&Instruction::ListErase {
            table: "Dog".into(),
            key,
            property: "tags".into(),
            index: 7,
            old: Value::Null,
        });
        assert!(matches!(err, Err(ChangesetError::Replay(_))));
    }

    #[test]
    fn add_and_remove_property_reshapes_rows() {
        let mut state = base_state();
        let key = ObjectKey::new(0);
        state
            .apply(&Instruction::CreateObject {
                table: "Dog".into(),
                key,
                values: vec![Value::from("rex"), Value::List(vec![])],
            })
            .unwrap();
        state
            .apply(&Instruction::AddProperty {
                table: "Dog".into(),
                property: Property::nullable("age", PropertyType::Int),
                default: Value::Null,
            })
            .unwrap();
        state
            .apply(&Instruction::RemoveProperty {
                table: "Dog".into(),
                property: "name".into(),
            })
            .unwrap();
        assert_eq!(
            state.get("Dog", key).unwrap(),
            &[Value::List(vec![]), Value::Null]
        );
    }

    #[test]
    fn duplicate_create_is_an_error() {
        let mut state = base_state();
        let create = Instruction::CreateObject {
            table: "Dog".into(),
            key: ObjectKey::new(3),
            values: vec![Value::from("rex"), Value::List(vec![])],
        };
        state.apply(&create).unwrap();
        assert!(state.apply(&create).is_err());
    }

    /// A small mutation language over a fixed set of keys, so generated
    /// sequences are always valid against the state they run on.
    #[derive(Clone, Debug)]
    enum Op {
        Create(u64),
        Rename(u64, String),
        Erase(u64),
        Push(u64, String),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..6).prop_map(Op::Create),
            (0u64..6, "[a-z]{1,4}").prop_map(|(k, s)| Op::Rename(k, s)),
            (0u64..6).prop_map(Op::Erase),
            (0u64..6, "[a-z]{1,3}").prop_map(|(k, s)| Op::Push(k, s)),
        ]
    }

    /// Turn ops into instructions valid against `state`, applying them as we go.
    fn lower(state: &mut RowState, ops: &[Op]) -> Vec<Instruction> {
        let mut out = Vec::new();
        for op in ops {
            let exists = |s: &RowState, k: u64| s.get("Dog", ObjectKey::new(k)).is_some();
            let instr = match op {
                Op::Create(k) if !exists(state, *k) => Instruction::CreateObject {
                    table: "Dog".into(),
                    key: ObjectKey::new(*k),
                    values: vec![Value::from("pup"), Value::List(vec![])],
                },
                Op::Rename(k, name) if exists(state, *k) => Instruction::Set {
                    table: "Dog".into(),
                    key: ObjectKey::new(*k),
                    property: "name".into(),
                    old: state.get("Dog", ObjectKey::new(*k)).unwrap()[0].clone(),
                    new: Value::from(name.as_str()),
                },
                Op::Erase(k) if exists(state, *k) => Instruction::EraseObject {
                    table: "Dog".into(),
                    key: ObjectKey::new(*k),
                    values: state.get("Dog", ObjectKey::new(*k)).unwrap().to_vec(),
                },
                Op::Push(k, tag) if exists(state, *k) => {
                    let len = state.get("Dog", ObjectKey::new(*k)).unwrap()[1]
                        .as_list()
                        .unwrap()
                        .len();
                    Instruction::ListInsert {
                        table: "Dog".into(),
                        key: ObjectKey::new(*k),
                        property: "tags".into(),
                        index: len,
                        value: Value::from(tag.as_str()),
                    }
                }
                _ => continue,
            };
            state.apply(&instr).unwrap();
            out.push(instr);
        }
        out
    }

    fn to_log(version: u64, instructions: Vec<Instruction>) -> TransactionLog {
        let mut builder = LogBuilder::new();
        for i in instructions {
            builder.push(i);
        }
        builder.finish(Version::new(version))
    }

    proptest! {
        #[test]
        fn folded_changeset_replays_to_final_state(
            base in prop::collection::vec(op(), 0..12),
            batches in prop::collection::vec(prop::collection::vec(op(), 0..8), 1..4),
        ) {
            let mut live = base_state();
            lower(&mut live, &base);
            let start = live.clone();

            let mut logs = Vec::new();
            for (i, batch) in batches.iter().enumerate() {
                let instrs = lower(&mut live, batch);
                logs.push(to_log(i as u64 + 6, instrs));
            }

            let to = Version::new(5 + batches.len() as u64);
            let cs = Changeset::from_logs(Version::new(5), to, &logs).unwrap();
            let mut replayed = start.clone();
            cs.replay(&mut replayed).unwrap();
            prop_assert_eq!(&replayed, &live);

            // The folded summary agrees with the before/after states.
            if let Some(dog) = cs.table("Dog") {
                for key in &dog.insertions {
                    prop_assert!(live.get("Dog", *key).is_some());
                    prop_assert!(start.get("Dog", *key).is_none() || dog.deletions.contains(key));
                }
                for key in &dog.deletions {
                    prop_assert!(start.get("Dog", *key).is_some());
                    prop_assert!(live.get("Dog", *key).is_none() || dog.insertions.contains(key));
                }
            }
        }
    }
}
