//! The per-version catalog: everything needed to reach a version's data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tarn_types::{Schema, Version};

use crate::format::BlockRef;

/// Root of one table at one version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRoot {
    /// Next key handed out by `create_object`. Keys are never reused.
    pub next_key: u64,
    pub pages: BTreeMap<u64, BlockRef>,
    pub row_count: u64,
}

/// A byte range no longer referenced by the newest version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeExtent {
    pub offset: u64,
    pub len: u64,
    /// First version that no longer references the range.
    pub freed_at: Version,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub version: Version,
    pub committed_at: DateTime<Utc>,
    pub schema: Schema,
    pub schema_version: u64,
    pub tables: BTreeMap<String, TableRoot>,
    /// Next key of each removed table, handed back if the table is added
    /// again so its keys stay unique.
    pub retired_keys: BTreeMap<String, u64>,
    /// Transaction log block of each retained version.
    pub history: BTreeMap<Version, BlockRef>,
    pub free: Vec<FreeExtent>,
}

impl Catalog {
    /// Catalog of a freshly created file.
    pub fn initial(schema: Schema, schema_version: u64) -> Self {
        let tables = schema
            .tables
            .iter()
            .map(|t| (t.name.clone(), TableRoot::default()))
            .collect();
        Self {
            version: Version::ZERO,
            committed_at: Utc::now(),
            schema,
            schema_version,
            tables,
            retired_keys: BTreeMap::new(),
            history: BTreeMap::new(),
            free: Vec::new(),
        }
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.iter().map(|e| e.len).sum()
    }

    /// Record `block` as unreferenced from `version` on.
    pub fn release(&mut self, block: BlockRef, version: Version) {
        self.free.push(FreeExtent {
            offset: block.offset,
            len: block.extent(),
            freed_at: version,
        });
    }

    /// Carve `size` bytes out of an extent freed no later than `horizon`.
    ///
    /// First fit; the remainder of a split extent stays free with its
    /// original tag.
    pub fn allocate(&mut self, size: u64, horizon: Option<Version>) -> Option<u64> {
        let horizon = horizon?;
        let idx = self
            .free
            .iter()
            .position(|e| e.freed_at <= horizon && e.len >= size)?;
        let extent = &mut self.free[idx];
        let offset = extent.offset;
        extent.offset += size;
        extent.len -= size;
        if extent.len == 0 {
            self.free.remove(idx);
        }
        Some(offset)
    }
}
