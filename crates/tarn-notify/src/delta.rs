//! Index-based change descriptions for ordered collections.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::Hash;

use serde::{Deserialize, Serialize};
use similar::{capture_diff_slices, Algorithm, DiffOp};

use crate::index_set::IndexSet;

/// An element that left at `from` and reappeared at `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Move {
    pub from: usize,
    pub to: usize,
}

/// How an ordered collection changed between two versions.
///
/// `deletions` and `modifications` are indices into the old collection,
/// `insertions` and `modifications_new` into the new one. Removing the
/// deletions from the old collection and then inserting the insertions in
/// ascending order reproduces the new collection. A moved element is always
/// reported as a deletion plus an insertion; `moves` only pairs them up.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDelta {
    pub deletions: IndexSet,
    pub insertions: IndexSet,
    pub modifications: IndexSet,
    pub modifications_new: IndexSet,
    pub moves: Vec<Move>,
}

impl CollectionDelta {
    pub fn is_empty(&self) -> bool {
        self.deletions.is_empty() && self.insertions.is_empty() && self.modifications.is_empty()
    }

    /// Everything in `old` deleted and everything in `new` inserted.
    pub fn replace_all(old_len: usize, new_len: usize) -> Self {
        let mut delta = Self::default();
        delta.deletions.add_range(0, old_len);
        delta.insertions.add_range(0, new_len);
        delta
    }

    /// Replay the delta onto `old`, taking inserted elements from `new`.
    ///
    /// Elements that survive come from `old`, so comparing the result with
    /// `new` checks that the delta really describes the transition.
    pub fn apply<T: Clone>(&self, old: &[T], new: &[T]) -> Vec<T> {
        let mut out = old.to_vec();
        for index in self.deletions.iter().rev() {
            if index < out.len() {
                out.remove(index);
            }
        }
        for index in self.insertions.iter() {
            if let Some(item) = new.get(index) {
                let at = index.min(out.len());
                out.insert(at, item.clone());
            }
        }
        out
    }
}

/// Diff two ordered sequences with Myers' algorithm.
///
/// Elements outside the common subsequence are deletions at their old index
/// and insertions at their new index. `is_modified(old_index, new_index)` is
/// asked about every element that stays.
pub fn calculate_ordered<T: Eq + Hash + Ord>(
    old: &[T],
    new: &[T],
    mut is_modified: impl FnMut(usize, usize) -> bool,
) -> CollectionDelta {
    let mut delta = CollectionDelta::default();
    for op in capture_diff_slices(Algorithm::Myers, old, new) {
        match op {
            DiffOp::Equal {
                old_index,
                new_index,
                len,
            } => {
                for i in 0..len {
                    if is_modified(old_index + i, new_index + i) {
                        delta.modifications.add(old_index + i);
                        delta.modifications_new.add(new_index + i);
                    }
                }
            }
            DiffOp::Delete {
                old_index, old_len, ..
            } => delta.deletions.add_range(old_index, old_index + old_len),
            DiffOp::Insert {
                new_index, new_len, ..
            } => delta.insertions.add_range(new_index, new_index + new_len),
            DiffOp::Replace {
                old_index,
                old_len,
                new_index,
                new_len,
            } => {
                delta.deletions.add_range(old_index, old_index + old_len);
                delta.insertions.add_range(new_index, new_index + new_len);
            }
        }
    }
    delta.moves = pair_moves(old, new, &delta);
    delta
}

/// Diff two sequences that are both sorted ascending, such as table-order
/// query results.
pub fn calculate_unordered<T: Ord>(
    old: &[T],
    new: &[T],
    mut is_modified: impl FnMut(usize, usize) -> bool,
) -> CollectionDelta {
    let mut delta = CollectionDelta::default();
    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        let order = match (old.get(i), new.get(j)) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, _) => Ordering::Greater,
        };
        match order {
            Ordering::Less => {
                delta.deletions.add(i);
                i += 1;
            }
            Ordering::Greater => {
                delta.insertions.add(j);
                j += 1;
            }
            Ordering::Equal => {
                if is_modified(i, j) {
                    delta.modifications.add(i);
                    delta.modifications_new.add(j);
                }
                i += 1;
                j += 1;
            }
        }
    }
    delta
}

fn pair_moves<T: Eq + Hash>(old: &[T], new: &[T], delta: &CollectionDelta) -> Vec<Move> {
    let mut inserted: HashMap<&T, Vec<usize>> = HashMap::new();
    for to in delta.insertions.iter().rev() {
        inserted.entry(&new[to]).or_default().push(to);
    }
    let mut moves = Vec::new();
    for from in delta.deletions.iter() {
        if let Some(to) = inserted.get_mut(&old[from]).and_then(Vec::pop) {
            moves.push(Move { from, to });
        }
    }
    moves
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn never(_: usize, _: usize) -> bool {
        false
    }

    #[test]
    fn insertion_into_empty() {
        let old: [u64; 0] = [];
        let delta = calculate_ordered(&old, &[7], never);
        assert_eq!(delta.insertions.as_slice(), &[0]);
        assert!(delta.deletions.is_empty());
    }

    #[test]
    fn moved_element_is_delete_plus_insert() {
        let old = ["a", "b", "c", "d"];
        let new = ["b", "c", "d", "a"];
        let delta = calculate_ordered(&old, &new, never);
        assert_eq!(delta.deletions.as_slice(), &[0]);
        assert_eq!(delta.insertions.as_slice(), &[3]);
        assert_eq!(delta.moves, vec![Move { from: 0, to: 3 }]);
        assert_eq!(delta.apply(&old, &new), new);
    }

    #[test]
    fn modifications_use_both_indices() {
        let old = [1, 2, 3];
        let new = [0, 1, 2, 3];
        let delta = calculate_ordered(&old, &new, |o, _| old[o] == 2);
        assert_eq!(delta.modifications.as_slice(), &[1]);
        assert_eq!(delta.modifications_new.as_slice(), &[2]);
        assert_eq!(delta.insertions.as_slice(), &[0]);
    }

    #[test]
    fn unordered_merges_sorted_keys() {
        let old = [1, 3, 5, 7];
        let new = [1, 2, 5, 8];
        let delta = calculate_unordered(&old, &new, |o, _| old[o] == 5);
        assert_eq!(delta.deletions.as_slice(), &[1, 3]);
        assert_eq!(delta.insertions.as_slice(), &[1, 3]);
        assert_eq!(delta.modifications.as_slice(), &[2]);
        assert_eq!(delta.apply(&old, &new), new);
    }

    #[test]
    fn replace_all_rebuilds() {
        let delta = CollectionDelta::replace_all(2, 3);
        assert_eq!(delta.apply(&[1, 2], &[4, 5, 6]), vec![4, 5, 6]);
    }

    proptest! {
        #[test]
        fn ordered_delta_reproduces_new(
            old in prop::collection::vec(0u8..12, 0..24),
            new in prop::collection::vec(0u8..12, 0..24),
        ) {
            let delta = calculate_ordered(&old, &new, never);
            prop_assert_eq!(delta.apply(&old, &new), new.clone());
            prop_assert_eq!(old.len() - delta.deletions.len() + delta.insertions.len(), new.len());
        }

        #[test]
        fn unordered_delta_reproduces_new(
            old in prop::collection::btree_set(0u16..64, 0..24),
            new in prop::collection::btree_set(0u16..64, 0..24),
        ) {
            let old: Vec<u16> = old.into_iter().collect();
            let new: Vec<u16> = new.into_iter().collect();
            let delta = calculate_unordered(&old, &new, never);
            prop_assert_eq!(delta.apply(&old, &new), new);
        }
    }
}
