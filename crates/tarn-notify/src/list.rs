//! Exact list deltas from replayed list instructions.

use tarn_changeset::Instruction;
use tarn_types::Value;

use crate::delta::{calculate_ordered, CollectionDelta};
use crate::index_set::IndexSet;

/// Replays the instructions applied to one list and reports the result as a
/// [`CollectionDelta`] against the list as it was before them.
///
/// Every current position remembers which old position it came from, if
/// any, so moves and repeated edits of the same slot collapse correctly.
#[derive(Clone, Debug)]
pub struct ListChangeBuilder {
    old_len: usize,
    /// Old index of the element now at each position, `None` if inserted.
    origins: Vec<Option<usize>>,
    /// Current positions whose value was replaced in place.
    replaced: IndexSet,
    /// The owning object or the property itself went away.
    invalidated: bool,
}

impl ListChangeBuilder {
    pub fn new(old_len: usize) -> Self {
        Self {
            old_len,
            origins: (0..old_len).map(Some).collect(),
            replaced: IndexSet::new(),
            invalidated: false,
        }
    }

    /// Returns `true` once the list stopped existing.
    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Current length after the instructions applied so far.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    /// Apply one instruction addressed to this list.
    pub fn apply(&mut self, instruction: &Instruction) {
        match instruction {
            Instruction::ListInsert { index, .. } => {
                let at = (*index).min(self.origins.len());
                self.origins.insert(at, None);
                self.replaced.shift_for_insert(at);
            }
            Instruction::ListSet { index, .. } => {
                if *index < self.origins.len() {
                    self.replaced.add(*index);
                }
            }
            Instruction::ListErase { index, .. } => {
                if *index < self.origins.len() {
                    self.origins.remove(*index);
                    self.replaced.erase_at(*index);
                }
            }
            Instruction::ListMove { from, to, .. } => {
                if *from < self.origins.len() && *to < self.origins.len() {
                    let origin = self.origins.remove(*from);
                    let was_replaced = self.replaced.erase_at(*from);
                    self.origins.insert(*to, origin);
                    self.replaced.shift_for_insert(*to);
                    if was_replaced {
                        self.replaced.add(*to);
                    }
                }
            }
            Instruction::ListClear { .. } => {
                self.origins.clear();
                self.replaced = IndexSet::new();
            }
            Instruction::Set { new, .. } => {
                // Whole-list assignment.
                let len = new.as_list().map_or(0, <[Value]>::len);
                self.origins = vec![None; len];
                self.replaced = IndexSet::new();
            }
            Instruction::EraseObject { .. } | Instruction::RemoveProperty { .. } => {
                self.invalidated = true;
            }
            _ => {}
        }
    }

    /// Build the delta. `is_modified(new_index)` reports elements whose
    /// target changed without the list itself changing; it is asked only
    /// about elements that kept their place.
    pub fn finish(self, mut is_modified: impl FnMut(usize) -> bool) -> CollectionDelta {
        // Inserted elements get ids past every old index so they never
        // match an old element.
        let old: Vec<usize> = (0..self.old_len).collect();
        let new: Vec<usize> = self
            .origins
            .iter()
            .enumerate()
            .map(|(i, origin)| origin.unwrap_or(self.old_len + i))
            .collect();
        let replaced = self.replaced;
        calculate_ordered(&old, &new, |_, new_index| {
            replaced.contains(new_index) || is_modified(new_index)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tarn_types::ObjectKey;

    fn insert(index: usize) -> Instruction {
        Instruction::ListInsert {
            table: "Person".into(),
            key: ObjectKey::new(0),
            property: "dogs".into(),
            index,
            value: Value::Null,
        }
    }

    fn erase(index: usize) -> Instruction {
        Instruction::ListErase {
            table: "Person".into(),
            key: ObjectKey::new(0),
            property: "dogs".into(),
            index,
            old: Value::Null,
        }
    }

    fn set(index: usize) -> Instruction {
        Instruction::ListSet {
            table: "Person".into(),
            key: ObjectKey::new(0),
            property: "dogs".into(),
            index,
            old: Value::Null,
            new: Value::Null,
        }
    }

    fn mv(from: usize, to: usize) -> Instruction {
        Instruction::ListMove {
            table: "Person".into(),
            key: ObjectKey::new(0),
            property: "dogs".into(),
            from,
            to,
        }
    }

    #[test]
    fn insert_then_erase_of_same_element_is_noop() {
        let mut builder = ListChangeBuilder::new(3);
        builder.apply(&insert(1));
        builder.apply(&erase(1));
        assert!(builder.finish(|_| false).is_empty());
    }

    #[test]
    fn erase_reports_old_index() {
        let mut builder = ListChangeBuilder::new(4);
        builder.apply(&erase(2));
        builder.apply(&insert(0));
        let delta = builder.finish(|_| false);
        assert_eq!(delta.deletions.as_slice(), &[2]);
        assert_eq!(delta.insertions.as_slice(), &[0]);
    }

    #[test]
    fn set_follows_element_through_insertions() {
        let mut builder = ListChangeBuilder::new(3);
        builder.apply(&set(1));
        builder.apply(&insert(0));
        let delta = builder.finish(|_| false);
        assert_eq!(delta.modifications.as_slice(), &[1]);
        assert_eq!(delta.modifications_new.as_slice(), &[2]);
    }

    #[test]
    fn move_is_delete_plus_insert() {
        let mut builder = ListChangeBuilder::new(3);
        builder.apply(&mv(0, 2));
        let delta = builder.finish(|_| false);
        assert_eq!(delta.deletions.as_slice(), &[0]);
        assert_eq!(delta.insertions.as_slice(), &[2]);
        assert_eq!(delta.moves.len(), 1);
    }

    #[test]
    fn clear_deletes_everything() {
        let mut builder = ListChangeBuilder::new(2);
        builder.apply(&Instruction::ListClear {
            table: "Person".into(),
            key: ObjectKey::new(0),
            property: "dogs".into(),
            old: vec![Value::Null, Value::Null],
        });
        builder.apply(&insert(0));
        let delta = builder.finish(|_| false);
        assert_eq!(delta.deletions.as_slice(), &[0, 1]);
        assert_eq!(delta.insertions.as_slice(), &[0]);
    }

    #[test]
    fn erasing_owner_invalidates() {
        let mut builder = ListChangeBuilder::new(1);
        builder.apply(&Instruction::EraseObject {
            table: "Person".into(),
            key: ObjectKey::new(0),
            values: vec![],
        });
        assert!(builder.is_invalidated());
    }
}
