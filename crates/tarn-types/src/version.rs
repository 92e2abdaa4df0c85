use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a committed snapshot of a store file.
///
/// Versions form a strict total order per file. Version 0 is the empty file
/// that exists before the first commit; every successful commit produces
/// exactly `previous.next()`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    /// The version of a freshly created, empty file.
    pub const ZERO: Version = Version(0);

    /// Create a version from its raw number.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw version number.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// The version that the next commit will produce.
    pub const fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The previous version, or `None` for [`Version::ZERO`].
    pub fn prev(&self) -> Option<Self> {
        self.0.checked_sub(1).map(Self)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.0)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_is_strictly_greater() {
        let v = Version::new(41);
        assert!(v.next() > v);
        assert_eq!(v.next().value(), 42);
    }

    #[test]
    fn zero_has_no_prev() {
        assert!(Version::ZERO.prev().is_none());
        assert_eq!(Version::new(3).prev(), Some(Version::new(2)));
    }

    #[test]
    fn display_format() {
        assert_eq!(Version::new(7).to_string(), "v7");
        assert_eq!(format!("{:?}", Version::new(7)), "Version(7)");
    }
}
