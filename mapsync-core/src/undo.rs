//! Undo/redo log of reversible storage commands.
//!
//! Each [`Command`] owns the state it needs to run forwards and to produce
//! its exact inverse. Compound edits are [`Command::Batch`]es, which either
//! apply completely or roll back.

use log::{debug, warn};

use crate::{EditState, Element, ElementKind, ElementRef, Geometry, OsmId, RemoveMode, Storage};
use crate::{StorageError, Tags};

/// A self-contained, reversible storage mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Add an element.
    Insert(Element),
    /// Remove an element that no live element references.
    Remove(Element),
    /// Swap an element's tags.
    SetTags {
        /// Target element.
        key: ElementRef,
        /// Tags before the edit.
        before: Tags,
        /// Tags after the edit.
        after: Tags,
    },
    /// Swap an element's geometry.
    SetGeometry {
        /// Target element.
        key: ElementRef,
        /// Geometry before the edit.
        before: Geometry,
        /// Geometry after the edit.
        after: Geometry,
    },
    /// Transition an element's edit state.
    SetState {
        /// Target element.
        key: ElementRef,
        /// State before the edit.
        before: EditState,
        /// State after the edit.
        after: EditState,
    },
    /// Change an element's base version.
    SetVersion {
        /// Target element.
        key: ElementRef,
        /// Version before the edit.
        before: u64,
        /// Version after the edit.
        after: u64,
    },
    /// Several commands forming one logical edit.
    Batch {
        /// Label reported for the whole edit.
        label: &'static str,
        /// Commands in application order.
        commands: Vec<Command>,
    },
}

impl Command {
    /// Short label naming the logical operation.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Insert(_) => "add",
            Self::Remove(_) => "remove",
            Self::SetTags { .. } => "update-tags",
            Self::SetGeometry { .. } => "update-geometry",
            Self::SetState { .. } => "update-state",
            Self::SetVersion { .. } => "update-version",
            Self::Batch { label, .. } => *label,
        }
    }

    /// Apply the command to `storage`.
    ///
    /// Each command first checks that its target still holds the value it
    /// was recorded against and fails with [`StorageError::StaleEdit`]
    /// otherwise. A failing batch restores every command it had already
    /// applied.
    pub fn apply(&self, storage: &mut Storage) -> Result<(), StorageError> {
        match self {
            Self::Insert(element) => storage.insert(element.clone()),
            Self::Remove(element) => {
                let key = element.key();
                let referrers: Vec<ElementRef> = storage
                    .live_referrers(key)
                    .into_iter()
                    .filter(|referrer| *referrer != key)
                    .collect();
                if !referrers.is_empty() {
                    return Err(StorageError::DanglingReference {
                        target: key,
                        referrers,
                    });
                }
                ensure_current(storage, key, |current| current == element)?;
                storage
                    .remove(key, RemoveMode::Force)?
                    .map(|_| ())
                    .ok_or(StorageError::NotFound { key })
            }
            Self::SetTags { key, before, after } => {
                ensure_current(storage, *key, |current| current.tags == *before)?;
                storage
                    .update(*key, |element| element.tags.clone_from(after))
                    .map(|_| ())
            }
            Self::SetGeometry { key, before, after } => {
                ensure_current(storage, *key, |current| current.geometry == *before)?;
                storage
                    .update(*key, |element| element.geometry.clone_from(after))
                    .map(|_| ())
            }
            Self::SetState { key, before, after } => {
                ensure_current(storage, *key, |current| current.state == *before)?;
                storage
                    .update(*key, |element| element.state = *after)
                    .map(|_| ())
            }
            Self::SetVersion { key, before, after } => {
                ensure_current(storage, *key, |current| current.version == *before)?;
                storage
                    .update(*key, |element| element.version = *after)
                    .map(|_| ())
            }
            Self::Batch { commands, .. } => apply_batch(commands, storage),
        }
    }

    /// Keys of every element the command writes, sorted and deduplicated.
    #[must_use]
    pub fn targets(&self) -> Vec<ElementRef> {
        match self {
            Self::Insert(element) | Self::Remove(element) => vec![element.key()],
            Self::SetTags { key, .. }
            | Self::SetGeometry { key, .. }
            | Self::SetState { key, .. }
            | Self::SetVersion { key, .. } => vec![*key],
            Self::Batch { commands, .. } => {
                let mut keys: Vec<ElementRef> = commands.iter().flat_map(Self::targets).collect();
                keys.sort_unstable();
                keys.dedup();
                keys
            }
        }
    }

    /// The command undoing this one.
    #[must_use]
    pub fn inverse(&self) -> Self {
        match self {
            Self::Insert(element) => Self::Remove(element.clone()),
            Self::Remove(element) => Self::Insert(element.clone()),
            Self::SetTags { key, before, after } => Self::SetTags {
                key: *key,
                before: after.clone(),
                after: before.clone(),
            },
            Self::SetGeometry { key, before, after } => Self::SetGeometry {
                key: *key,
                before: after.clone(),
                after: before.clone(),
            },
            Self::SetState { key, before, after } => Self::SetState {
                key: *key,
                before: *after,
                after: *before,
            },
            Self::SetVersion { key, before, after } => Self::SetVersion {
                key: *key,
                before: *after,
                after: *before,
            },
            Self::Batch { label, commands } => Self::Batch {
                label: *label,
                commands: commands.iter().rev().map(Self::inverse).collect(),
            },
        }
    }

    /// Rewrite references to `(kind, old)` so the command targets `new`.
    pub(crate) fn remap(&mut self, kind: ElementKind, old: OsmId, new: OsmId) {
        let target = ElementRef::new(kind, old);
        match self {
            Self::Insert(element) | Self::Remove(element) => {
                if element.key() == target {
                    element.id = new;
                }
                element.remap_reference(target, new);
            }
            Self::SetTags { key, .. } | Self::SetState { key, .. } | Self::SetVersion { key, .. } => {
                remap_key(key, target, new);
            }
            Self::SetGeometry { key, before, after } => {
                remap_key(key, target, new);
                before.remap_reference(target, new);
                after.remap_reference(target, new);
            }
            Self::Batch { commands, .. } => {
                for command in commands {
                    command.remap(kind, old, new);
                }
            }
        }
    }

    fn is_empty_batch(&self) -> bool {
        matches!(self, Self::Batch { commands, .. } if commands.is_empty())
    }
}

fn ensure_current<F>(storage: &Storage, key: ElementRef, matches: F) -> Result<(), StorageError>
where
    F: FnOnce(&Element) -> bool,
{
    let current = storage.get(key).ok_or(StorageError::NotFound { key })?;
    if matches(current) {
        Ok(())
    } else {
        Err(StorageError::StaleEdit { key })
    }
}

fn remap_key(key: &mut ElementRef, target: ElementRef, new: OsmId) {
    if *key == target {
        key.id = new;
    }
}

fn apply_batch(commands: &[Command], storage: &mut Storage) -> Result<(), StorageError> {
    for (position, command) in commands.iter().enumerate() {
        if let Err(err) = command.apply(storage) {
            let applied = commands.get(..position).unwrap_or_default();
            for done in applied.iter().rev() {
                if let Err(rollback) = done.inverse().apply(storage) {
                    warn!("rolling back {} failed: {rollback}", done.label());
                }
            }
            return Err(err);
        }
    }
    Ok(())
}

/// Ordered history of local edits with a redo stack.
///
/// Recording a new edit discards anything that was undone.
#[derive(Debug, Default, Clone)]
pub struct UndoLog {
    done: Vec<Command>,
    undone: Vec<Command>,
}

impl UndoLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an already-applied command.
    pub fn record(&mut self, command: Command) {
        if command.is_empty_batch() {
            return;
        }
        self.done.push(command);
        self.undone.clear();
    }

    /// Revert the most recent edit.
    ///
    /// Returns the label of the reverted edit, or `None` when there is
    /// nothing to undo. A command that can no longer be inverted, because its
    /// target is gone or has moved on, is dropped and its error returned.
    pub fn undo(&mut self, storage: &mut Storage) -> Result<Option<&'static str>, StorageError> {
        let Some(command) = self.done.pop() else {
            return Ok(None);
        };
        if let Err(err) = command.inverse().apply(storage) {
            warn!("dropping {} from undo history: {err}", command.label());
            return Err(err);
        }
        let label = command.label();
        self.undone.push(command);
        Ok(Some(label))
    }

    /// Re-apply the most recently undone edit.
    pub fn redo(&mut self, storage: &mut Storage) -> Result<Option<&'static str>, StorageError> {
        let Some(command) = self.undone.pop() else {
            return Ok(None);
        };
        if let Err(err) = command.apply(storage) {
            warn!("dropping {} from redo history: {err}", command.label());
            return Err(err);
        }
        let label = command.label();
        self.done.push(command);
        Ok(Some(label))
    }

    /// Forget all history, e.g. after a successful upload.
    pub fn clear(&mut self) {
        self.done.clear();
        self.undone.clear();
    }

    /// Whether an undo is available.
    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.done.is_empty()
    }

    /// Whether a redo is available.
    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.undone.is_empty()
    }

    /// Labels of recorded edits, oldest first.
    pub fn labels(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.done.iter().map(Command::label)
    }

    /// Drop every recorded edit that writes `key`.
    ///
    /// Called when something other than a local edit rewrites the element,
    /// so neither undo nor redo can replay a value it no longer holds.
    /// Returns how many entries were dropped.
    pub fn forget(&mut self, key: ElementRef) -> usize {
        let before = self.done.len() + self.undone.len();
        self.done.retain(|command| !command.targets().contains(&key));
        self.undone.retain(|command| !command.targets().contains(&key));
        let dropped = before - self.done.len() - self.undone.len();
        if dropped > 0 {
            debug!("forgot {dropped} recorded edits of {key}");
        }
        dropped
    }

    /// The edit [`UndoLog::undo`] would revert next.
    #[must_use]
    pub(crate) fn next_undo(&self) -> Option<&Command> {
        self.done.last()
    }

    /// The edit [`UndoLog::redo`] would re-apply next.
    #[must_use]
    pub(crate) fn next_redo(&self) -> Option<&Command> {
        self.undone.last()
    }

    pub(crate) fn remap(&mut self, kind: ElementKind, old: OsmId, new: OsmId) {
        for command in self.done.iter_mut().chain(self.undone.iter_mut()) {
            command.remap(kind, old, new);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{id, node, storage_with, way};
    use rstest::rstest;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[rstest]
    fn inverse_of_inverse_is_identity() {
        let command = Command::Batch {
            label: "update-tags",
            commands: vec![
                Command::SetTags {
                    key: ElementRef::node(id(1)),
                    before: Tags::new(),
                    after: tags(&[("amenity", "cafe")]),
                },
                Command::SetState {
                    key: ElementRef::node(id(1)),
                    before: EditState::Unchanged,
                    after: EditState::Modified,
                },
            ],
        };
        assert_eq!(command.inverse().inverse(), command);
    }

    #[rstest]
    fn undo_and_redo_tag_edit() {
        let mut storage = storage_with([node(1, 1)]);
        let key = ElementRef::node(id(1));
        let command = Command::SetTags {
            key,
            before: Tags::new(),
            after: tags(&[("shop", "bakery")]),
        };
        command.apply(&mut storage).expect("apply");
        let mut log = UndoLog::new();
        log.record(command);

        assert_eq!(log.undo(&mut storage), Ok(Some("update-tags")));
        assert!(storage.get(key).is_some_and(|n| n.tags.is_empty()));
        assert_eq!(log.redo(&mut storage), Ok(Some("update-tags")));
        assert_eq!(
            storage.get(key).and_then(|n| n.tags.get("shop").cloned()),
            Some("bakery".to_owned())
        );
    }

    #[rstest]
    fn failing_batch_rolls_back() {
        let mut storage = storage_with([node(1, 1)]);
        let key = ElementRef::node(id(1));
        let command = Command::Batch {
            label: "update-tags",
            commands: vec![
                Command::SetTags {
                    key,
                    before: Tags::new(),
                    after: tags(&[("name", "x")]),
                },
                Command::SetTags {
                    key: ElementRef::node(id(2)),
                    before: Tags::new(),
                    after: Tags::new(),
                },
            ],
        };
        let err = command.apply(&mut storage).expect_err("node 2 is missing");
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(storage.get(key).is_some_and(|n| n.tags.is_empty()));
    }

    #[rstest]
    fn remove_refuses_live_referrers() {
        let mut storage = storage_with([node(1, 1), way(10, 1, &[1])]);
        let err = Command::Remove(node(1, 1))
            .apply(&mut storage)
            .expect_err("referenced");
        assert!(matches!(err, StorageError::DanglingReference { .. }));
    }

    #[rstest]
    fn undo_refuses_edit_overtaken_by_another_writer() {
        let mut storage = storage_with([node(1, 1)]);
        let key = ElementRef::node(id(1));
        let command = Command::SetTags {
            key,
            before: Tags::new(),
            after: tags(&[("amenity", "cafe")]),
        };
        command.apply(&mut storage).expect("apply");
        let mut log = UndoLog::new();
        log.record(command);
        storage
            .update(key, |n| n.tags = tags(&[("amenity", "bar")]))
            .expect("outside write");

        assert_eq!(log.undo(&mut storage), Err(StorageError::StaleEdit { key }));
        assert!(!log.can_undo() && !log.can_redo());
        assert_eq!(
            storage.get(key).and_then(|n| n.tags.get("amenity").cloned()),
            Some("bar".to_owned())
        );
    }

    #[rstest]
    fn forget_drops_every_entry_writing_the_key() {
        let mut storage = storage_with([node(1, 1), node(2, 1)]);
        let first = ElementRef::node(id(1));
        let second = ElementRef::node(id(2));
        let mut log = UndoLog::new();
        let both = Command::Batch {
            label: "update-state",
            commands: vec![
                Command::SetState {
                    key: second,
                    before: EditState::Unchanged,
                    after: EditState::Modified,
                },
                Command::SetState {
                    key: first,
                    before: EditState::Unchanged,
                    after: EditState::Modified,
                },
            ],
        };
        assert_eq!(both.targets(), vec![first, second]);
        both.apply(&mut storage).expect("apply");
        log.record(both);
        let retag = Command::SetTags {
            key: second,
            before: Tags::new(),
            after: tags(&[("a", "b")]),
        };
        retag.apply(&mut storage).expect("apply");
        log.record(retag);
        log.undo(&mut storage).expect("undo retag");

        assert_eq!(log.forget(first), 1);
        assert!(!log.can_undo());
        assert!(log.can_redo(), "redo of node 2 survives");
        assert_eq!(log.forget(second), 1);
        assert!(!log.can_redo());
    }

    #[rstest]
    fn recording_clears_redo_stack() {
        let mut storage = storage_with([]);
        let mut log = UndoLog::new();
        let insert = Command::Insert(node(-1, 0));
        insert.apply(&mut storage).expect("insert");
        log.record(insert);
        log.undo(&mut storage).expect("undo");
        assert!(log.can_redo());
        log.record(Command::Batch {
            label: "add",
            commands: vec![Command::Insert(node(-2, 0))],
        });
        assert!(!log.can_redo());
    }

    #[rstest]
    fn remap_rewrites_recorded_commands() {
        let mut log = UndoLog::new();
        log.record(Command::Insert(way(-5, 0, &[-1, 2])));
        log.record(Command::SetTags {
            key: ElementRef::node(id(-1)),
            before: Tags::new(),
            after: Tags::new(),
        });
        log.remap(ElementKind::Node, id(-1), id(40));
        let labels: Vec<_> = log.labels().collect();
        assert_eq!(labels, vec!["add", "update-tags"]);
        assert_eq!(
            log.done.first(),
            Some(&Command::Insert(way(-5, 0, &[40, 2])))
        );
        assert!(matches!(
            log.done.last(),
            Some(Command::SetTags { key, .. }) if key.id == id(40)
        ));
    }
}
