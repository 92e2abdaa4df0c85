use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable identity of an object within a table.
///
/// Keys are allocated from a per-table counter that only ever grows, so a key
/// is never handed out twice for the lifetime of the file. Row position in
/// storage is *not* identity: all change tracking is addressed by key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey(u64);

impl ObjectKey {
    /// Create a key from its raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw key value.
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectKey({})", self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for ObjectKey {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
