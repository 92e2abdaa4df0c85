use serde::{Deserialize, Serialize};

/// A sorted set of collection indices.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexSet(Vec<usize>);

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `index`. Returns `false` if it was already present.
    pub fn add(&mut self, index: usize) -> bool {
        match self.0.binary_search(&index) {
            Ok(_) => false,
            Err(pos) => {
                self.0.insert(pos, index);
                true
            }
        }
    }

    /// Add every index in `start..end`.
    pub fn add_range(&mut self, start: usize, end: usize) {
        for index in start..end {
            self.add(index);
        }
    }

    pub fn remove(&mut self, index: usize) -> bool {
        match self.0.binary_search(&index) {
            Ok(pos) => {
                self.0.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.binary_search(&index).is_ok()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// An element was inserted at `index`: every index at or after it moves
    /// up by one.
    pub fn shift_for_insert(&mut self, index: usize) {
        let start = self.0.partition_point(|&i| i < index);
        for i in &mut self.0[start..] {
            *i += 1;
        }
    }

    /// The element at `index` was removed: drop it and move every later
    /// index down by one. Returns whether `index` was in the set.
    pub fn erase_at(&mut self, index: usize) -> bool {
        let removed = self.remove(index);
        let start = self.0.partition_point(|&i| i < index);
        for i in &mut self.0[start..] {
            *i -= 1;
        }
        removed
    }
}

impl FromIterator<usize> for IndexSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut indices: Vec<usize> = iter.into_iter().collect();
        indices.sort_unstable();
        indices.dedup();
        Self(indices)
    }
}

impl<'a> IntoIterator for &'a IndexSet {
    type Item = usize;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, usize>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter().copied()
    }
}
