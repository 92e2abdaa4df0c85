//! The single write transaction of a store.
//!
//! Mutations go into an overlay of copied pages on top of the latest
//! version. Nothing reaches the file until [`WriteTransaction::commit`];
//! dropping or cancelling the transaction discards the overlay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tarn_changeset::{Instruction, LogBuilder, LogRecord, ReplayTarget};
use tarn_types::{ObjectKey, ObjectSchema, Property, PropertyType, Schema, Value, Version};
use tracing::debug;

use crate::catalog::{Catalog, TableRoot};
use crate::error::{StoreError, StoreResult};
use crate::format::BlockRef;
use crate::lock::WriteGuard;
use crate::page::{page_of, Page};
use crate::snapshot::{property_column, Snapshot};
use crate::store::Shared;

/// Everything a commit needs from a finished transaction.
pub(crate) struct PendingCommit {
    pub base: Arc<Catalog>,
    pub working: Catalog,
    pub dirty: BTreeMap<(String, u64), Arc<Page>>,
    pub released: Vec<BlockRef>,
    pub log: LogBuilder,
}

pub struct WriteTransaction {
    shared: Arc<Shared>,
    _guard: WriteGuard,
    base: Arc<Catalog>,
    working: Catalog,
    dirty: BTreeMap<(String, u64), Arc<Page>>,
    /// Blocks of tables removed in this transaction.
    released: Vec<BlockRef>,
    log: LogBuilder,
}

impl WriteTransaction {
    pub(crate) fn new(shared: Arc<Shared>, guard: WriteGuard, base: Arc<Catalog>) -> Self {
        let working = (*base).clone();
        Self {
            shared,
            _guard: guard,
            base,
            working,
            dirty: BTreeMap::new(),
            released: Vec::new(),
            log: LogBuilder::new(),
        }
    }

    /// The version this transaction started from.
    pub fn base_version(&self) -> Version {
        self.base.version
    }

    /// Records produced so far, in order.
    pub fn records(&self) -> &[LogRecord] {
        self.log.records()
    }

    /// Returns `true` if nothing was changed yet.
    pub fn is_empty(&self) -> bool {
        self.log.is_empty() && self.working.schema_version == self.base.schema_version
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Create an object with a fresh key.
    pub fn create_object(&mut self, table: &str, values: Vec<Value>) -> StoreResult<ObjectKey> {
        self.check_row(table, &values)?;
        let root = self.root_mut(table)?;
        let key = ObjectKey::new(root.next_key);
        root.next_key += 1;
        self.insert_row(table, key, values)?;
        Ok(key)
    }

    /// Create an object with a caller-chosen key. Later fresh keys are
    /// allocated above it.
    pub fn create_object_with_key(
        &mut self,
        table: &str,
        key: ObjectKey,
        values: Vec<Value>,
    ) -> StoreResult<()> {
        if self.contains(table, key)? {
            return Err(StoreError::ObjectExists {
                table: table.to_string(),
                key,
            });
        }
        self.check_row(table, &values)?;
        let root = self.root_mut(table)?;
        root.next_key = root.next_key.max(key.value() + 1);
        self.insert_row(table, key, values)
    }

    pub fn set(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        value: Value,
    ) -> StoreResult<()> {
        let schema = self.object_schema(table)?.clone();
        let col = property_column(&schema, property)?;
        self.check_value(&schema, &schema.properties[col], &value)?;

        let mut row = self.row(table, key)?;
        if schema.primary_key_index() == Some(col) && row[col] != value {
            self.check_unique_primary_key(&schema, &value)?;
        }
        let old = std::mem::replace(&mut row[col], value.clone());
        self.put_row(table, key, row)?;
        self.log.push(Instruction::Set {
            table: table.to_string(),
            key,
            property: property.to_string(),
            old,
            new: value,
        });
        Ok(())
    }

    /// Delete an object, first clearing every link that points at it.
    pub fn delete_object(&mut self, table: &str, key: ObjectKey) -> StoreResult<()> {
        self.row(table, key)?;
        self.unlink_incoming(table, key)?;

        let row = self.row(table, key)?;
        let page = self.page_mut(table, page_of(key))?;
        page.rows.remove(&key);
        self.root_mut(table)?.row_count -= 1;
        self.log.push(Instruction::EraseObject {
            table: table.to_string(),
            key,
            values: row,
        });
        Ok(())
    }

    fn unlink_incoming(&mut self, target: &str, key: ObjectKey) -> StoreResult<()> {
        let link = Value::Link(key);
        let mut singles = Vec::new();
        let mut in_lists = Vec::new();

        for table in &self.working.schema.tables {
            for property in &table.properties {
                if property.ty.link_target() != Some(target) {
                    continue;
                }
                let col = property_column(table, &property.name)?;
                let is_list = property.ty.is_list();
                self.scan(&table.name, &mut |source, row| {
                    if is_list {
                        if let Value::List(items) = &row[col] {
                            for (i, item) in items.iter().enumerate().rev() {
                                if *item == link {
                                    in_lists.push((table.name.clone(), source, property.name.clone(), i));
                                }
                            }
                        }
                    } else if row[col] == link {
                        singles.push((table.name.clone(), source, property.name.clone()));
                    }
                })?;
            }
        }

        for (table, source, property) in singles {
            self.set(&table, source, &property, Value::Null)?;
        }
        // Indices were collected back to front per list.
        for (table, source, property, index) in in_lists {
            self.list_remove(&table, source, &property, index)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lists
    // -----------------------------------------------------------------------

    pub fn list_push(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        value: Value,
    ) -> StoreResult<()> {
        let len = self.list(table, key, property)?.len();
        self.list_insert(table, key, property, len, value)
    }

    pub fn list_insert(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        index: usize,
        value: Value,
    ) -> StoreResult<()> {
        self.check_list_item(table, property, &value)?;
        self.edit_list(table, key, property, |items| {
            if index > items.len() {
                return Err(index);
            }
            items.insert(index, value.clone());
            Ok(())
        })?;
        self.log.push(Instruction::ListInsert {
            table: table.to_string(),
            key,
            property: property.to_string(),
            index,
            value,
        });
        Ok(())
    }

    pub fn list_set(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        index: usize,
        value: Value,
    ) -> StoreResult<()> {
        self.check_list_item(table, property, &value)?;
        let mut old = Value::Null;
        self.edit_list(table, key, property, |items| {
            let slot = items.get_mut(index).ok_or(index)?;
            old = std::mem::replace(slot, value.clone());
            Ok(())
        })?;
        self.log.push(Instruction::ListSet {
            table: table.to_string(),
            key,
            property: property.to_string(),
            index,
            old,
            new: value,
        });
        Ok(())
    }

    /// Remove and return the item at `index`.
    pub fn list_remove(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        index: usize,
    ) -> StoreResult<Value> {
        let mut old = Value::Null;
        self.edit_list(table, key, property, |items| {
            if index >= items.len() {
                return Err(index);
            }
            old = items.remove(index);
            Ok(())
        })?;
        self.log.push(Instruction::ListErase {
            table: table.to_string(),
            key,
            property: property.to_string(),
            index,
            old: old.clone(),
        });
        Ok(old)
    }

    pub fn list_move(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        from: usize,
        to: usize,
    ) -> StoreResult<()> {
        self.edit_list(table, key, property, |items| {
            if from >= items.len() {
                return Err(from);
            }
            if to >= items.len() {
                return Err(to);
            }
            let item = items.remove(from);
            items.insert(to, item);
            Ok(())
        })?;
        self.log.push(Instruction::ListMove {
            table: table.to_string(),
            key,
            property: property.to_string(),
            from,
            to,
        });
        Ok(())
    }

    pub fn list_clear(&mut self, table: &str, key: ObjectKey, property: &str) -> StoreResult<()> {
        let mut old = Vec::new();
        self.edit_list(table, key, property, |items| {
            old = std::mem::take(items);
            Ok(())
        })?;
        self.log.push(Instruction::ListClear {
            table: table.to_string(),
            key,
            property: property.to_string(),
            old,
        });
        Ok(())
    }

    fn edit_list(
        &mut self,
        table: &str,
        key: ObjectKey,
        property: &str,
        edit: impl FnOnce(&mut Vec<Value>) -> Result<(), usize>,
    ) -> StoreResult<()> {
        let col = property_column(self.object_schema(table)?, property)?;
        let mut row = self.row(table, key)?;
        let actual = row[col].type_name();
        let Value::List(items) = &mut row[col] else {
            return Err(StoreError::TypeMismatch {
                table: table.to_string(),
                property: property.to_string(),
                expected: "list".into(),
                actual: actual.into(),
            });
        };
        let len = items.len();
        edit(items).map_err(|index| StoreError::IndexOutOfBounds {
            property: property.to_string(),
            index,
            len,
        })?;
        self.put_row(table, key, row)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    pub fn add_table(&mut self, schema: ObjectSchema) -> StoreResult<()> {
        if self.has_table(&schema.name) {
            return Err(StoreError::TableExists(schema.name));
        }
        let mut next = self.working.schema.clone();
        next.tables.push(schema.clone());
        next.validate()?;

        self.working.schema = next;
        let next_key = self
            .working
            .retired_keys
            .remove(&schema.name)
            .unwrap_or(0);
        self.working.tables.insert(
            schema.name.clone(),
            TableRoot {
                next_key,
                ..TableRoot::default()
            },
        );
        debug!(table = %schema.name, "table added");
        self.log.push(Instruction::AddTable { schema });
        Ok(())
    }

    pub fn remove_table(&mut self, table: &str) -> StoreResult<()> {
        self.object_schema(table)?;
        let mut next = self.working.schema.clone();
        next.tables.retain(|t| t.name != table);
        next.validate()?;

        self.working.schema = next;
        if let Some(root) = self.working.tables.remove(table) {
            self.released.extend(root.pages.values().copied());
            self.working
                .retired_keys
                .insert(table.to_string(), root.next_key);
        }
        self.dirty.retain(|(t, _), _| t != table);
        debug!(table, "table removed");
        self.log.push(Instruction::RemoveTable {
            table: table.to_string(),
        });
        Ok(())
    }

    /// Append a property; existing objects get the type's default value.
    pub fn add_property(&mut self, table: &str, property: Property) -> StoreResult<()> {
        let default = Value::default_for(&property.ty, property.nullable);
        self.add_property_with_default(table, property, default)
    }

    fn add_property_with_default(
        &mut self,
        table: &str,
        property: Property,
        default: Value,
    ) -> StoreResult<()> {
        let next = self.schema_with(table, |t| t.properties.push(property.clone()))?;
        self.working.schema = next;
        self.rewrite_rows(table, |row| row.push(default.clone()))?;
        self.log.push(Instruction::AddProperty {
            table: table.to_string(),
            property,
            default,
        });
        Ok(())
    }

    pub fn remove_property(&mut self, table: &str, property: &str) -> StoreResult<()> {
        let col = property_column(self.object_schema(table)?, property)?;
        let next = self.schema_with(table, |t| {
            t.properties.remove(col);
            if t.primary_key.as_deref() == Some(property) {
                t.primary_key = None;
            }
        })?;
        self.working.schema = next;
        self.rewrite_rows(table, |row| {
            row.remove(col);
        })?;
        self.log.push(Instruction::RemoveProperty {
            table: table.to_string(),
            property: property.to_string(),
        });
        Ok(())
    }

    /// Change the primary key of a table. Existing values must be unique.
    pub fn set_primary_key(&mut self, table: &str, property: Option<&str>) -> StoreResult<()> {
        let next = self.schema_with(table, |t| t.primary_key = property.map(str::to_string))?;
        if let Some(col) = next.table(table).and_then(ObjectSchema::primary_key_index) {
            let mut seen = BTreeSet::new();
            let mut duplicate = None;
            self.scan(table, &mut |_, row| {
                let rendered = row[col].to_string();
                if !seen.insert(rendered.clone()) {
                    duplicate.get_or_insert(rendered);
                }
            })?;
            if let Some(value) = duplicate {
                return Err(StoreError::DuplicatePrimaryKey {
                    table: table.to_string(),
                    value,
                });
            }
        }
        self.working.schema = next;
        Ok(())
    }

    pub fn set_schema_version(&mut self, version: u64) {
        self.working.schema_version = version;
    }

    fn schema_with(
        &self,
        table: &str,
        edit: impl FnOnce(&mut ObjectSchema),
    ) -> StoreResult<Schema> {
        let mut next = self.working.schema.clone();
        let target = next
            .table_mut(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
        edit(target);
        next.validate()?;
        Ok(next)
    }

    fn rewrite_rows(&mut self, table: &str, mut edit: impl FnMut(&mut Vec<Value>)) -> StoreResult<()> {
        for n in self.page_numbers(table)? {
            let page = self.page_mut(table, n)?;
            for row in page.rows.values_mut() {
                edit(row);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Finishing
    // -----------------------------------------------------------------------

    /// Make the overlay durable as the next version.
    pub fn commit(self) -> StoreResult<Version> {
        let shared = Arc::clone(&self.shared);
        let pending = PendingCommit {
            base: self.base,
            working: self.working,
            dirty: self.dirty,
            released: self.released,
            log: self.log,
        };
        // Held until the new version is installed.
        let _guard = self._guard;
        shared.commit(pending)
    }

    /// Discard every change.
    pub fn cancel(self) {
        debug!(base = %self.base.version, "write transaction cancelled");
    }

    // -----------------------------------------------------------------------
    // Overlay plumbing
    // -----------------------------------------------------------------------

    fn root_mut(&mut self, table: &str) -> StoreResult<&mut TableRoot> {
        self.working
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))
    }

    /// Copy-on-write access to one page of the overlay.
    fn page_mut(&mut self, table: &str, n: u64) -> StoreResult<&mut Page> {
        let id = (table.to_string(), n);
        if !self.dirty.contains_key(&id) {
            let page = self.page(table, n)?.unwrap_or_default();
            self.dirty.insert(id.clone(), page);
        }
        let page = self
            .dirty
            .get_mut(&id)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
        Ok(Arc::make_mut(page))
    }

    fn row(&self, table: &str, key: ObjectKey) -> StoreResult<Vec<Value>> {
        self.get(table, key)?.ok_or_else(|| StoreError::NoSuchObject {
            table: table.to_string(),
            key,
        })
    }

    fn put_row(&mut self, table: &str, key: ObjectKey, row: Vec<Value>) -> StoreResult<()> {
        self.page_mut(table, page_of(key))?.rows.insert(key, row);
        Ok(())
    }

    fn insert_row(&mut self, table: &str, key: ObjectKey, values: Vec<Value>) -> StoreResult<()> {
        self.put_row(table, key, values.clone())?;
        self.root_mut(table)?.row_count += 1;
        self.log.push(Instruction::CreateObject {
            table: table.to_string(),
            key,
            values,
        });
        Ok(())
    }

    fn check_row(&self, table: &str, values: &[Value]) -> StoreResult<()> {
        let schema = self.object_schema(table)?;
        if values.len() != schema.properties.len() {
            return Err(StoreError::ArityMismatch {
                table: table.to_string(),
                expected: schema.properties.len(),
                actual: values.len(),
            });
        }
        for (property, value) in schema.properties.iter().zip(values) {
            self.check_value(schema, property, value)?;
        }
        if let Some(col) = schema.primary_key_index() {
            self.check_unique_primary_key(schema, &values[col])?;
        }
        Ok(())
    }

    fn check_value(&self, schema: &ObjectSchema, property: &Property, value: &Value) -> StoreResult<()> {
        if !value.conforms_to(&property.ty, property.nullable) {
            return Err(StoreError::TypeMismatch {
                table: schema.name.clone(),
                property: property.name.clone(),
                expected: property.ty.to_string(),
                actual: value.type_name().into(),
            });
        }
        if let Some(target) = property.ty.link_target() {
            let links: Vec<ObjectKey> = match value {
                Value::Link(key) => vec![*key],
                Value::List(items) => items.iter().filter_map(Value::as_link).collect(),
                _ => Vec::new(),
            };
            for key in links {
                if !self.contains(target, key)? {
                    return Err(StoreError::NoSuchObject {
                        table: target.to_string(),
                        key,
                    });
                }
            }
        }
        Ok(())
    }

    fn check_list_item(&self, table: &str, property: &str, value: &Value) -> StoreResult<()> {
        let schema = self.object_schema(table)?;
        let prop = schema
            .property(property)
            .ok_or_else(|| StoreError::NoSuchProperty {
                table: table.to_string(),
                property: property.to_string(),
            })?;
        let PropertyType::List(element) = &prop.ty else {
            return Err(StoreError::TypeMismatch {
                table: table.to_string(),
                property: property.to_string(),
                expected: "list".into(),
                actual: prop.ty.to_string(),
            });
        };
        let item = Property {
            name: prop.name.clone(),
            ty: (**element).clone(),
            nullable: false,
        };
        self.check_value(schema, &item, value)
    }

    fn check_unique_primary_key(&self, schema: &ObjectSchema, value: &Value) -> StoreResult<()> {
        if self.find_by_primary_key(&schema.name, value)?.is_some() {
            return Err(StoreError::DuplicatePrimaryKey {
                table: schema.name.clone(),
                value: value.to_string(),
            });
        }
        Ok(())
    }
}

impl Snapshot for WriteTransaction {
    fn version(&self) -> Version {
        self.base.version
    }

    fn schema(&self) -> &Schema {
        &self.working.schema
    }

    fn schema_version(&self) -> u64 {
        self.working.schema_version
    }

    fn page(&self, table: &str, n: u64) -> StoreResult<Option<Arc<Page>>> {
        if let Some(page) = self.dirty.get(&(table.to_string(), n)) {
            return Ok(Some(Arc::clone(page)));
        }
        let root = self
            .working
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
        match root.pages.get(&n) {
            Some(block) => Ok(Some(self.shared.load_page(*block)?)),
            None => Ok(None),
        }
    }

    fn page_numbers(&self, table: &str) -> StoreResult<Vec<u64>> {
        let root = self
            .working
            .tables
            .get(table)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))?;
        let mut numbers: BTreeSet<u64> = root.pages.keys().copied().collect();
        numbers.extend(
            self.dirty
                .keys()
                .filter(|(t, _)| t == table)
                .map(|(_, n)| *n),
        );
        Ok(numbers.into_iter().collect())
    }

    fn len(&self, table: &str) -> StoreResult<usize> {
        self.working
            .tables
            .get(table)
            .map(|root| root.row_count as usize)
            .ok_or_else(|| StoreError::NoSuchTable(table.to_string()))
    }
}

impl ReplayTarget for WriteTransaction {
    type Error = StoreError;

    fn apply(&mut self, instruction: &Instruction) -> StoreResult<()> {
        match instruction.clone() {
            Instruction::AddTable { schema } => self.add_table(schema),
            Instruction::RemoveTable { table } => self.remove_table(&table),
            Instruction::AddProperty {
                table,
                property,
                default,
            } => self.add_property_with_default(&table, property, default),
            Instruction::RemoveProperty { table, property } => {
                self.remove_property(&table, &property)
            }
            Instruction::CreateObject { table, key, values } => {
                self.create_object_with_key(&table, key, values)
            }
            Instruction::EraseObject { table, key, .. } => self.delete_object(&table, key),
            Instruction::Set {
                table,
                key,
                property,
                new,
                ..
            } => self.set(&table, key, &property, new),
            Instruction::ListInsert {
                table,
                key,
                property,
                index,
                value,
            } => self.list_insert(&table, key, &property, index, value),
            Instruction::ListSet {
                table,
                key,
                property,
                index,
                new,
                ..
            } => self.list_set(&table, key, &property, index, new),
            Instruction::ListErase {
                table,
                key,
                property,
                index,
                ..
            } => self.list_remove(&table, key, &property, index).map(|_| ()),
            Instruction::ListMove {
                table,
                key,
                property,
                from,
                to,
            } => self.list_move(&table, key, &property, from, to),
            Instruction::ListClear {
                table,
                key,
                property,
                ..
            } => self.list_clear(&table, key, &property),
        }
    }
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("base", &self.base.version)
            .field("records", &self.log.len())
            .finish()
    }
}
