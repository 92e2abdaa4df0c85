//! Read access to one version.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tarn_changeset::{RowState, TableState};
use tarn_types::{ObjectKey, ObjectSchema, Schema, Value, Version};

use crate::catalog::Catalog;
use crate::error::{StoreError, StoreResult};
use crate::page::{page_of, Page};
use crate::pin::VersionPin;
use crate::store::Shared;

/// A consistent view of every table at one version.
///
/// Implementors supply page access; the row-level queries are provided.
/// Both [`ReadTransaction`] and the write overlay implement it, so query code
/// runs unchanged inside and outside a write.
pub trait Snapshot {
    fn version(&self) -> Version;

    fn schema(&self) -> &Schema;

    fn schema_version(&self) -> u64;

    /// The page `page` of `table`, or `None` if it holds no rows.
    fn page(&self, table: &str, page: u64) -> StoreResult<Option<Arc<Page>>>;

    /// Page numbers of `table` in ascending order.
    fn page_numbers(&self, table: &str) -> StoreResult<Vec<u64>>;

    /// Number of objects in `table`.
    fn len(&self, table: &str) -> StoreResult<usize>;

    fn object_schema(&self, table: &str) -> StoreResult<&ObjectSchema> {
        self.schema()
            .table(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))
    }

    fn has_table(&self, table: &str) -> bool {
        self.schema().table(table).is_some()
    }

    fn table_names(&self) -> Vec<String> {
        self.schema().tables.iter().map(|t| t.name.clone()).collect()
    }

    fn get(&self, table: &str, key: ObjectKey) -> StoreResult<Option<Vec<Value>>> {
        self.object_schema(table)?;
        Ok(self
            .page(table, page_of(key))?
            .and_then(|page| page.rows.get(&key).cloned()))
    }

    fn contains(&self, table: &str, key: ObjectKey) -> StoreResult<bool> {
        self.object_schema(table)?;
        Ok(self
            .page(table, page_of(key))?
            .is_some_and(|page| page.rows.contains_key(&key)))
    }

    /// The value of one property. Missing objects are an error.
    fn get_value(&self, table: &str, key: ObjectKey, property: &str) -> StoreResult<Value> {
        let col = property_column(self.object_schema(table)?, property)?;
        let row = self
            .get(table, key)?
            .ok_or_else(|| StoreError::NoSuchObject {
                table: table.to_string(),
                key,
            })?;
        Ok(row[col].clone())
    }

    /// Keys of `table` in ascending key order.
    fn keys(&self, table: &str) -> StoreResult<Vec<ObjectKey>> {
        let mut keys = Vec::new();
        for n in self.page_numbers(table)? {
            if let Some(page) = self.page(table, n)? {
                keys.extend(page.rows.keys().copied());
            }
        }
        Ok(keys)
    }

    /// Every object of `table` in ascending key order.
    fn objects(&self, table: &str) -> StoreResult<Vec<(ObjectKey, Vec<Value>)>> {
        let mut out = Vec::new();
        self.scan(table, &mut |key, row| out.push((key, row.to_vec())))?;
        Ok(out)
    }

    /// Visit every object of `table` in ascending key order without cloning.
    fn scan(&self, table: &str, f: &mut dyn FnMut(ObjectKey, &[Value])) -> StoreResult<()> {
        self.object_schema(table)?;
        for n in self.page_numbers(table)? {
            if let Some(page) = self.page(table, n)? {
                for (key, row) in &page.rows {
                    f(*key, row);
                }
            }
        }
        Ok(())
    }

    fn find_by_primary_key(&self, table: &str, value: &Value) -> StoreResult<Option<ObjectKey>> {
        let schema = self.object_schema(table)?;
        let Some(col) = schema.primary_key_index() else {
            return Ok(None);
        };
        let mut found = None;
        self.scan(table, &mut |key, row| {
            if found.is_none() && row[col] == *value {
                found = Some(key);
            }
        })?;
        Ok(found)
    }

    /// The items of a list property.
    fn list(&self, table: &str, key: ObjectKey, property: &str) -> StoreResult<Vec<Value>> {
        match self.get_value(table, key, property)? {
            Value::List(items) => Ok(items),
            other => Err(StoreError::TypeMismatch {
                table: table.to_string(),
                property: property.to_string(),
                expected: "list".into(),
                actual: other.type_name().into(),
            }),
        }
    }

    /// Materialize every table into a [`RowState`].
    fn row_state(&self) -> StoreResult<RowState> {
        let mut state = RowState::new();
        for schema in &self.schema().tables {
            let mut rows = BTreeMap::new();
            self.scan(&schema.name, &mut |key, row| {
                rows.insert(key, row.to_vec());
            })?;
            state.tables.insert(
                schema.name.clone(),
                TableState {
                    schema: schema.clone(),
                    rows,
                },
            );
        }
        Ok(state)
    }
}

pub(crate) fn property_column(schema: &ObjectSchema, property: &str) -> StoreResult<usize> {
    schema
        .property_index(property)
        .ok_or_else(|| StoreError::NoSuchProperty {
            table: schema.name.clone(),
            property: property.to_string(),
        })
}

// ---------------------------------------------------------------------------
// ReadTransaction
// ---------------------------------------------------------------------------

/// A pinned, immutable view of one committed version.
///
/// The version's pages stay on disk for as long as any read transaction on
/// it is alive.
pub struct ReadTransaction {
    shared: Arc<Shared>,
    catalog: Arc<Catalog>,
    _pin: VersionPin,
}

impl ReadTransaction {
    pub(crate) fn new(shared: Arc<Shared>, catalog: Arc<Catalog>, pin: VersionPin) -> Self {
        Self {
            shared,
            catalog,
            _pin: pin,
        }
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.catalog.committed_at
    }

    pub(crate) fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }
}

impl Clone for ReadTransaction {
    fn clone(&self) -> Self {
        let pin = self.shared.pins.pin(Arc::clone(&self.catalog));
        Self::new(Arc::clone(&self.shared), Arc::clone(&self.catalog), pin)
    }
}

impl std::fmt::Debug for ReadTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadTransaction")
            .field("version", &self.catalog.version)
            .finish()
    }
}

impl Snapshot for ReadTransaction {
    fn version(&self) -> Version {
        self.catalog.version
    }

    fn schema(&self) -> &Schema {
        &self.catalog.schema
    }

    fn schema_version(&self) -> u64 {
        self.catalog.schema_version
    }

    fn page(&self, table: &str, page: u64) -> StoreResult<Option<Arc<Page>>> {
        let root = self
            .catalog
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
        match root.pages.get(&page) {
            Some(block) => Ok(Some(self.shared.load_page(*block)?)),
            None => Ok(None),
        }
    }

    fn page_numbers(&self, table: &str) -> StoreResult<Vec<u64>> {
        let root = self
            .catalog
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
        Ok(root.pages.keys().copied().collect())
    }

    fn len(&self, table: &str) -> StoreResult<usize> {
        self.catalog
            .tables
            .get(table)
            .map(|root| root.row_count as usize)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))
    }
}
