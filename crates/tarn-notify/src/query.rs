//! Queries over one table of a snapshot.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use tarn_store::Snapshot;
use tarn_types::{ObjectKey, ObjectSchema, Value};

use crate::error::{NotifyError, NotifyResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// A row filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Every object.
    All,
    Compare {
        property: String,
        op: CompareOp,
        value: Value,
    },
    /// String property contains `needle`.
    Contains { property: String, needle: String },
    /// String property starts with `prefix`.
    BeginsWith { property: String, prefix: String },
    /// Property equals one of `values`.
    In { property: String, values: Vec<Value> },
    /// A link, or a list of links, points at `key`.
    LinksTo { property: String, key: ObjectKey },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::compare(property, CompareOp::Eq, value)
    }

    pub fn compare(property: impl Into<String>, op: CompareOp, value: impl Into<Value>) -> Self {
        Self::Compare {
            property: property.into(),
            op,
            value: value.into(),
        }
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            Self::All => other,
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut any) => {
                any.push(other);
                Self::Or(any)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Resolve property names to column indices.
    fn bind(&self, schema: &ObjectSchema) -> NotifyResult<Bound> {
        let column = |property: &str| {
            schema
                .property_index(property)
                .ok_or_else(|| NotifyError::InvalidQuery {
                    table: schema.name.clone(),
                    reason: format!("no property {property}"),
                })
        };
        Ok(match self {
            Self::All => Bound::All,
            Self::Compare {
                property,
                op,
                value,
            } => Bound::Compare(column(property)?, *op, value.clone()),
            Self::Contains { property, needle } => Bound::Contains(column(property)?, needle.clone()),
            Self::BeginsWith { property, prefix } => {
                Bound::BeginsWith(column(property)?, prefix.clone())
            }
            Self::In { property, values } => Bound::In(column(property)?, values.clone()),
            Self::LinksTo { property, key } => {
                let col = column(property)?;
                if schema.properties[col].ty.link_target().is_none() {
                    return Err(NotifyError::InvalidQuery {
                        table: schema.name.clone(),
                        reason: format!("{property} is not a link"),
                    });
                }
                Bound::LinksTo(col, *key)
            }
            Self::And(all) => Bound::And(
                all.iter()
                    .map(|p| p.bind(schema))
                    .collect::<NotifyResult<_>>()?,
            ),
            Self::Or(any) => Bound::Or(
                any.iter()
                    .map(|p| p.bind(schema))
                    .collect::<NotifyResult<_>>()?,
            ),
            Self::Not(inner) => Bound::Not(Box::new(inner.bind(schema)?)),
        })
    }
}

/// A predicate with columns resolved against one schema.
enum Bound {
    All,
    Compare(usize, CompareOp, Value),
    Contains(usize, String),
    BeginsWith(usize, String),
    In(usize, Vec<Value>),
    LinksTo(usize, ObjectKey),
    And(Vec<Bound>),
    Or(Vec<Bound>),
    Not(Box<Bound>),
}

impl Bound {
    fn matches(&self, row: &[Value]) -> bool {
        match self {
            Self::All => true,
            Self::Compare(col, op, value) => compare(&row[*col], *op, value),
            Self::Contains(col, needle) => row[*col].as_str().is_some_and(|s| s.contains(needle.as_str())),
            Self::BeginsWith(col, prefix) => {
                row[*col].as_str().is_some_and(|s| s.starts_with(prefix.as_str()))
            }
            Self::In(col, values) => values.contains(&row[*col]),
            Self::LinksTo(col, key) => match &row[*col] {
                Value::Link(k) => k == key,
                Value::List(items) => items.iter().any(|v| v.as_link() == Some(*key)),
                _ => false,
            },
            Self::And(all) => all.iter().all(|p| p.matches(row)),
            Self::Or(any) => any.iter().any(|p| p.matches(row)),
            Self::Not(inner) => !inner.matches(row),
        }
    }
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> bool {
    match op {
        CompareOp::Eq => lhs == rhs,
        CompareOp::Ne => lhs != rhs,
        _ => {
            // Ordering comparisons never match null or mismatched kinds.
            let ordering = match (lhs, rhs) {
                (Value::Int(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
                (Value::Double(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
                (Value::Null, _) | (_, Value::Null) => None,
                (a, b) if std::mem::discriminant(a) == std::mem::discriminant(b) => {
                    Some(a.total_cmp(b))
                }
                _ => None,
            };
            match (op, ordering) {
                (CompareOp::Lt, Some(o)) => o == Ordering::Less,
                (CompareOp::Le, Some(o)) => o != Ordering::Greater,
                (CompareOp::Gt, Some(o)) => o == Ordering::Greater,
                (CompareOp::Ge, Some(o)) => o != Ordering::Less,
                _ => false,
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub property: String,
    pub ascending: bool,
}

/// A filtered, optionally sorted view of one table.
///
/// Without sort descriptors results come back in key order; ties in a sort
/// are also broken by key, so every query has one deterministic order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    pub predicate: Predicate,
    #[serde(default)]
    pub sort: Vec<SortDescriptor>,
}

impl Query {
    /// Every object of `table`.
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            predicate: Predicate::All,
            sort: Vec::new(),
        }
    }

    pub fn filter(mut self, predicate: Predicate) -> Self {
        let current = std::mem::replace(&mut self.predicate, Predicate::All);
        self.predicate = current.and(predicate);
        self
    }

    pub fn sorted_by(mut self, property: impl Into<String>, ascending: bool) -> Self {
        self.sort.push(SortDescriptor {
            property: property.into(),
            ascending,
        });
        self
    }

    /// Returns `true` if results are in key order.
    pub fn is_key_ordered(&self) -> bool {
        self.sort.is_empty()
    }

    /// Keys of the matching objects, in result order.
    pub fn run(&self, snapshot: &dyn Snapshot) -> NotifyResult<Vec<ObjectKey>> {
        let schema = snapshot.object_schema(&self.table)?;
        let predicate = self.predicate.bind(schema)?;
        let sort = self
            .sort
            .iter()
            .map(|s| {
                schema
                    .property_index(&s.property)
                    .map(|col| (col, s.ascending))
                    .ok_or_else(|| NotifyError::InvalidQuery {
                        table: self.table.clone(),
                        reason: format!("cannot sort by missing property {}", s.property),
                    })
            })
            .collect::<NotifyResult<Vec<_>>>()?;

        if sort.is_empty() {
            let mut keys = Vec::new();
            snapshot.scan(&self.table, &mut |key, row| {
                if predicate.matches(row) {
                    keys.push(key);
                }
            })?;
            return Ok(keys);
        }

        let mut rows: Vec<(ObjectKey, Vec<Value>)> = Vec::new();
        snapshot.scan(&self.table, &mut |key, row| {
            if predicate.matches(row) {
                rows.push((key, sort.iter().map(|(col, _)| row[*col].clone()).collect()));
            }
        })?;
        rows.sort_by(|(ka, a), (kb, b)| {
            for (i, (_, ascending)) in sort.iter().enumerate() {
                let order = a[i].total_cmp(&b[i]);
                if order != Ordering::Equal {
                    return if *ascending { order } else { order.reverse() };
                }
            }
            ka.cmp(kb)
        });
        Ok(rows.into_iter().map(|(key, _)| key).collect())
    }

    /// Returns `true` if the object exists and matches the predicate.
    pub fn matches(&self, snapshot: &dyn Snapshot, key: ObjectKey) -> NotifyResult<bool> {
        let schema = snapshot.object_schema(&self.table)?;
        let predicate = self.predicate.bind(schema)?;
        Ok(snapshot
            .get(&self.table, key)?
            .is_some_and(|row| predicate.matches(&row)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_store::{StoreConfig, VersionedStore};
    use tarn_types::{Property, PropertyType, Schema};

    fn store(dir: &tempfile::TempDir) -> VersionedStore {
        let schema = Schema::new(vec![
            ObjectSchema::new(
                "Dog",
                vec![
                    Property::new("name", PropertyType::String),
                    Property::new("age", PropertyType::Int),
                ],
            ),
            ObjectSchema::new(
                "Person",
                vec![Property::new("dogs", PropertyType::list(PropertyType::link("Dog")))],
            ),
        ]);
        let store = VersionedStore::open_with_schema(
            dir.path().join("q.tarn"),
            StoreConfig::ephemeral(),
            &schema,
            1,
        )
        .unwrap();
        let mut txn = store.begin_write().unwrap();
        for (name, age) in [("rex", 3), ("fido", 7), ("ace", 3), ("max", 1)] {
            txn.create_object("Dog", vec![Value::from(name), Value::Int(age)])
                .unwrap();
        }
        txn.create_object(
            "Person",
            vec![Value::List(vec![Value::Link(ObjectKey::new(1))])],
        )
        .unwrap();
        txn.commit().unwrap();
        store
    }

    fn keys(raw: &[u64]) -> Vec<ObjectKey> {
        raw.iter().copied().map(ObjectKey::new).collect()
    }

    #[test]
    fn filters_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let read = store(&dir).read_latest().unwrap();
        let q = Query::table("Dog").filter(Predicate::eq("age", 3));
        assert_eq!(q.run(&read).unwrap(), keys(&[0, 2]));

        let q = Query::table("Dog").filter(Predicate::compare("age", CompareOp::Ge, 3).negate());
        assert_eq!(q.run(&read).unwrap(), keys(&[3]));

        let q = Query::table("Dog").filter(
            Predicate::BeginsWith {
                property: "name".into(),
                prefix: "f".into(),
            }
            .or(Predicate::Contains {
                property: "name".into(),
                needle: "ax".into(),
            }),
        );
        assert_eq!(q.run(&read).unwrap(), keys(&[1, 3]));
    }

    #[test]
    fn sorts_with_key_tiebreak() {
        let dir = tempfile::tempdir().unwrap();
        let read = store(&dir).read_latest().unwrap();
        let q = Query::table("Dog").sorted_by("age", false);
        assert_eq!(q.run(&read).unwrap(), keys(&[1, 0, 2, 3]));
        let q = Query::table("Dog").sorted_by("age", true).sorted_by("name", true);
        assert_eq!(q.run(&read).unwrap(), keys(&[3, 2, 0, 1]));
    }

    #[test]
    fn links_to_searches_lists() {
        let dir = tempfile::tempdir().unwrap();
        let read = store(&dir).read_latest().unwrap();
        let q = Query::table("Person").filter(Predicate::LinksTo {
            property: "dogs".into(),
            key: ObjectKey::new(1),
        });
        assert_eq!(q.run(&read).unwrap(), keys(&[0]));
        assert!(q.matches(&read, ObjectKey::new(0)).unwrap());
    }

    #[test]
    fn ordering_ignores_null_and_mismatched_kinds() {
        assert!(!compare(&Value::Null, CompareOp::Lt, &Value::Int(1)));
        assert!(!compare(&Value::from("a"), CompareOp::Lt, &Value::Int(1)));
        assert!(compare(&Value::Int(1), CompareOp::Lt, &Value::Double(1.5)));
        assert!(compare(&Value::Null, CompareOp::Eq, &Value::Null));
    }

    #[test]
    fn unknown_property_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let read = store(&dir).read_latest().unwrap();
        let err = Query::table("Dog")
            .filter(Predicate::eq("color", "brown"))
            .run(&read)
            .unwrap_err();
        assert!(matches!(err, NotifyError::InvalidQuery { .. }));
    }

    #[test]
    fn query_serializes_as_json() {
        let q = Query::table("Dog").filter(Predicate::eq("name", "fido"));
        let json = serde_json::to_string(&q).unwrap();
        let back: Query = serde_json::from_str(&json).unwrap();
        assert_eq!(back, q);
    }
}
