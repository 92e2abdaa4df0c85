//! Low-level mutation records written by every committed transaction.
//!
//! Properties are addressed by name rather than position so that a log stays
//! meaningful across migrations that add or remove columns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tarn_types::{ObjectKey, ObjectSchema, Property, Value, Version};

use crate::error::{ChangesetError, ChangesetResult};

/// A single mutation performed inside a write transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    AddTable {
        schema: ObjectSchema,
    },
    RemoveTable {
        table: String,
    },
    /// Append a column; existing rows receive `default`.
    AddProperty {
        table: String,
        property: Property,
        default: Value,
    },
    RemoveProperty {
        table: String,
        property: String,
    },
    /// `values` are in the table's property order at the time of creation.
    CreateObject {
        table: String,
        key: ObjectKey,
        values: Vec<Value>,
    },
    /// `values` hold the row as it was just before erasure.
    EraseObject {
        table: String,
        key: ObjectKey,
        values: Vec<Value>,
    },
    Set {
        table: String,
        key: ObjectKey,
        property: String,
        old: Value,
        new: Value,
    },
    ListInsert {
        table: String,
        key: ObjectKey,
        property: String,
        index: usize,
        value: Value,
    },
    ListSet {
        table: String,
        key: ObjectKey,
        property: String,
        index: usize,
        old: Value,
        new: Value,
    },
    ListErase {
        table: String,
        key: ObjectKey,
        property: String,
        index: usize,
        old: Value,
    },
    ListMove {
        table: String,
        key: ObjectKey,
        property: String,
        from: usize,
        to: usize,
    },
    ListClear {
        table: String,
        key: ObjectKey,
        property: String,
        old: Vec<Value>,
    },
}

impl Instruction {
    /// The table this instruction applies to.
    pub fn table(&self) -> &str {
        match self {
            Self::AddTable { schema } => &schema.name,
            Self::RemoveTable { table }
            | Self::AddProperty { table, .. }
            | Self::RemoveProperty { table, .. }
            | Self::CreateObject { table, .. }
            | Self::EraseObject { table, .. }
            | Self::Set { table, .. }
            | Self::ListInsert { table, .. }
            | Self::ListSet { table, .. }
            | Self::ListErase { table, .. }
            | Self::ListMove { table, .. }
            | Self::ListClear { table, .. } => table,
        }
    }

    /// The object this instruction applies to, if it is object-level.
    pub fn object(&self) -> Option<ObjectKey> {
        match self {
            Self::CreateObject { key, .. }
            | Self::EraseObject { key, .. }
            | Self::Set { key, .. }
            | Self::ListInsert { key, .. }
            | Self::ListSet { key, .. }
            | Self::ListErase { key, .. }
            | Self::ListMove { key, .. }
            | Self::ListClear { key, .. } => Some(*key),
            _ => None,
        }
    }

    /// The property this instruction modifies, if it is a property mutation.
    pub fn property(&self) -> Option<&str> {
        match self {
            Self::Set { property, .. }
            | Self::ListInsert { property, .. }
            | Self::ListSet { property, .. }
            | Self::ListErase { property, .. }
            | Self::ListMove { property, .. }
            | Self::ListClear { property, .. } => Some(property),
            _ => None,
        }
    }

    /// Returns `true` for instructions that change table structure.
    pub fn is_schema_change(&self) -> bool {
        matches!(
            self,
            Self::AddTable { .. }
                | Self::RemoveTable { .. }
                | Self::AddProperty { .. }
                | Self::RemoveProperty { .. }
        )
    }
}

/// An instruction tagged with its commit-internal sequence number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u32,
    pub instruction: Instruction,
}

/// All records produced by one committed transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    /// The version this transaction produced.
    pub version: Version,
    pub committed_at: DateTime<Utc>,
    pub records: Vec<LogRecord>,
}

impl TransactionLog {
    pub fn new(version: Version, records: Vec<LogRecord>) -> Self {
        Self {
            version,
            committed_at: Utc::now(),
            records,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serialize with bincode for storage.
    pub fn encode(&self) -> ChangesetResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ChangesetError::Serialization(e.to_string()))
    }

    /// Decode a log previously produced by [`TransactionLog::encode`].
    pub fn decode(bytes: &[u8]) -> ChangesetResult<Self> {
        bincode::deserialize(bytes).map_err(|e| ChangesetError::Serialization(e.to_string()))
    }
}

/// Accumulates records for an in-progress transaction, assigning sequence
/// numbers in submission order.
#[derive(Clone, Debug, Default)]
pub struct LogBuilder {
    records: Vec<LogRecord>,
}

impl LogBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, instruction: Instruction) {
        let seq = self.records.len() as u32;
        self.records.push(LogRecord { seq, instruction });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    /// Seal the records into the log for `version`.
    pub fn finish(self, version: Version) -> TransactionLog {
        TransactionLog::new(version, self.records)
    }
}
