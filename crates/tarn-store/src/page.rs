use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tarn_types::{ObjectKey, Value};

/// Keys per page is `1 << PAGE_SHIFT`.
pub const PAGE_SHIFT: u32 = 8;

/// The page holding `key`.
pub fn page_of(key: ObjectKey) -> u64 {
    key.value() >> PAGE_SHIFT
}

/// A run of rows from one table. Pages are immutable once written; a commit
/// that touches a row writes a new copy of its page.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub rows: BTreeMap<ObjectKey, Vec<Value>>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
