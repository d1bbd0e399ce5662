//! Dirty/API state tracking over [`Storage`].
//!
//! [`DirtyTracker`] owns the storage, the undo log of local edits and the
//! base copies that remember what the server last sent for every element
//! edited locally. Local edits flow through [`Command`]s so they can be
//! undone. Remote merges, conflict resolutions and upload acknowledgements
//! bypass the log and drop the recorded edits of every element they rewrite.

use std::collections::BTreeMap;

use geo::Coord;
use log::{debug, warn};
use thiserror::Error;

use crate::ordering::upload_order;
use crate::reconcile::{Conflict, ConflictKind};
use crate::undo::{Command, UndoLog};
use crate::{EditState, Element, ElementError, ElementKind, ElementRef, Geometry, Member, OsmId};
use crate::{RemoveMode, Storage, StorageError, Tags};

/// Errors raised by [`DirtyTracker`] operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrackerError {
    /// The underlying storage rejected the change.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An element or id failed validation.
    #[error(transparent)]
    Element(#[from] ElementError),
    /// Only elements with local ids can be marked as created.
    #[error("{key} has a server id and cannot be created locally")]
    NotLocal {
        /// Offending key.
        key: ElementRef,
    },
    /// No element exists under the key.
    #[error("{key} does not exist")]
    NotFound {
        /// Missing key.
        key: ElementRef,
    },
    /// The element is a local tombstone.
    #[error("{key} is already deleted")]
    AlreadyDeleted {
        /// Deleted key.
        key: ElementRef,
    },
    /// A geometry of another kind was supplied.
    #[error("{key} cannot take {found} geometry")]
    KindMismatch {
        /// Target key.
        key: ElementRef,
        /// Kind of the supplied geometry.
        found: ElementKind,
    },
    /// An upload acknowledgement assigned another local id.
    #[error("upload acknowledgement for {key} assigns local id {new_id}")]
    LocalAcknowledgement {
        /// Acknowledged key.
        key: ElementRef,
        /// The rejected id.
        new_id: OsmId,
    },
}

/// Per-element upload success reported by the upload client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UploadAck {
    /// Kind of the uploaded element.
    #[cfg_attr(feature = "serde", serde(rename = "type"))]
    pub kind: ElementKind,
    /// Id the element was uploaded under.
    pub old_id: OsmId,
    /// Id assigned by the server; equal to `old_id` for existing elements.
    pub new_id: OsmId,
    /// Version assigned by the server.
    pub new_version: u64,
}

/// How a reported [`Conflict`] should be settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Keep the local edit and rebase it onto the remote version.
    KeepLocal,
    /// Discard the local edit in favour of the remote snapshot.
    AcceptRemote,
}

/// Storage plus local edit bookkeeping.
#[derive(Debug, Default, Clone)]
pub struct DirtyTracker {
    pub(crate) storage: Storage,
    pub(crate) undo: UndoLog,
    pub(crate) base: BTreeMap<ElementRef, Element>,
}

impl DirtyTracker {
    /// Create a tracker over empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an already-populated storage, e.g. a parsed snapshot.
    #[must_use]
    pub fn from_storage(storage: Storage) -> Self {
        Self {
            storage,
            ..Self::default()
        }
    }

    /// Rebuild a tracker from persisted elements and base copies.
    ///
    /// Elements keep their saved state and version. Base copies for keys
    /// that are not stored are dropped.
    pub fn restore<E, B>(elements: E, bases: B) -> Result<Self, TrackerError>
    where
        E: IntoIterator<Item = Element>,
        B: IntoIterator<Item = Element>,
    {
        let mut storage = Storage::new();
        for element in elements {
            storage.insert(element)?;
        }
        let base = bases
            .into_iter()
            .filter(|element| storage.contains(element.key()))
            .map(|element| (element.key(), element))
            .collect();
        Ok(Self {
            storage,
            undo: UndoLog::new(),
            base,
        })
    }

    /// Read access to the tracked storage.
    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Read access to the undo history.
    #[must_use]
    pub const fn undo_log(&self) -> &UndoLog {
        &self.undo
    }

    /// The last server-known copy of a locally edited element.
    #[must_use]
    pub fn base(&self, key: ElementRef) -> Option<&Element> {
        self.base.get(&key)
    }

    /// Every base copy in key order.
    pub fn bases(&self) -> impl Iterator<Item = &Element> + '_ {
        self.base.values()
    }

    /// Add a locally created element.
    ///
    /// The element must carry a local id; its version is forced to `0`.
    pub fn mark_created(&mut self, mut element: Element) -> Result<ElementRef, TrackerError> {
        let key = element.key();
        if !element.is_local() {
            return Err(TrackerError::NotLocal { key });
        }
        element.version = 0;
        element.state = EditState::Created;
        self.run(Command::Insert(element))?;
        debug!("created {key}");
        Ok(key)
    }

    /// Create a node under a fresh local id.
    pub fn create_node(
        &mut self,
        location: Coord<f64>,
        tags: Tags,
    ) -> Result<ElementRef, TrackerError> {
        self.create(Geometry::Node(location), tags)
    }

    /// Create a way under a fresh local id.
    pub fn create_way(&mut self, nodes: Vec<OsmId>, tags: Tags) -> Result<ElementRef, TrackerError> {
        self.create(Geometry::Way(nodes), tags)
    }

    /// Create a relation under a fresh local id.
    pub fn create_relation(
        &mut self,
        members: Vec<Member>,
        tags: Tags,
    ) -> Result<ElementRef, TrackerError> {
        self.create(Geometry::Relation(members), tags)
    }

    fn create(&mut self, geometry: Geometry, tags: Tags) -> Result<ElementRef, TrackerError> {
        let id = self.storage.next_local_id()?;
        let mut element = Element::new(id, 0, geometry);
        element.tags = tags;
        self.mark_created(element)
    }

    /// Store a locally edited copy of an existing element.
    ///
    /// Created elements stay `Created`; anything else becomes `Modified`.
    /// The first edit of an unchanged element records its base copy.
    pub fn mark_modified(&mut self, element: Element) -> Result<(), TrackerError> {
        let key = element.key();
        let current = self.current(key)?;
        let label = match (
            current.tags != element.tags,
            current.geometry != element.geometry,
        ) {
            (true, false) => "update-tags",
            (false, true) => "update-geometry",
            (true, true) | (false, false) => "update",
        };
        let mut commands = Vec::new();
        if current.tags != element.tags {
            commands.push(Command::SetTags {
                key,
                before: current.tags.clone(),
                after: element.tags,
            });
        }
        if current.geometry != element.geometry {
            commands.push(Command::SetGeometry {
                key,
                before: current.geometry.clone(),
                after: element.geometry,
            });
        }
        if current.version != element.version {
            commands.push(Command::SetVersion {
                key,
                before: current.version,
                after: element.version,
            });
        }
        let state = if current.state == EditState::Created {
            EditState::Created
        } else {
            EditState::Modified
        };
        if current.state != state {
            commands.push(Command::SetState {
                key,
                before: current.state,
                after: state,
            });
        }
        self.run(Command::Batch { label, commands })?;
        if current.state == EditState::Unchanged {
            self.base.insert(key, current);
        }
        Ok(())
    }

    /// Replace an element's tags.
    pub fn set_tags(&mut self, key: ElementRef, tags: Tags) -> Result<(), TrackerError> {
        let mut element = self.current(key)?;
        element.tags = tags;
        self.mark_modified(element)
    }

    /// Replace an element's geometry with one of the same kind.
    pub fn set_geometry(&mut self, key: ElementRef, geometry: Geometry) -> Result<(), TrackerError> {
        if geometry.kind() != key.kind {
            return Err(TrackerError::KindMismatch {
                key,
                found: geometry.kind(),
            });
        }
        let mut element = self.current(key)?;
        element.geometry = geometry;
        self.mark_modified(element)
    }

    /// Delete an element locally.
    ///
    /// A `Created` element is removed outright; anything else becomes a
    /// tombstone awaiting upload. Fails while live elements refer to it.
    pub fn mark_deleted(&mut self, key: ElementRef) -> Result<(), TrackerError> {
        let current = self.current(key)?;
        let referrers: Vec<ElementRef> = self
            .storage
            .live_referrers(key)
            .into_iter()
            .filter(|referrer| *referrer != key)
            .collect();
        if !referrers.is_empty() {
            return Err(StorageError::DanglingReference {
                target: key,
                referrers,
            }
            .into());
        }
        if current.state == EditState::Created {
            self.run(Command::Remove(current))?;
        } else {
            self.run(Command::Batch {
                label: "remove",
                commands: vec![Command::SetState {
                    key,
                    before: current.state,
                    after: EditState::Deleted,
                }],
            })?;
            if current.state == EditState::Unchanged {
                self.base.insert(key, current);
            }
        }
        debug!("deleted {key}");
        Ok(())
    }

    /// Every dirty element, referenced elements before their referrers and
    /// deletions after all creations and modifications.
    #[must_use]
    pub fn pending_upload(&self) -> Vec<Element> {
        upload_order(&self.storage)
    }

    /// Whether the element under `key` awaits upload.
    #[must_use]
    pub fn is_dirty(&self, key: ElementRef) -> bool {
        self.storage
            .get(key)
            .is_some_and(|element| element.state.is_dirty())
    }

    /// Number of elements awaiting upload.
    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.storage
            .iter()
            .filter(|element| element.state.is_dirty())
            .count()
    }

    /// Revert the most recent local edit, returning its label.
    ///
    /// An element that ends up `Unchanged` loses its base copy. An edit whose
    /// target was rewritten since it was recorded is dropped and reported as
    /// [`StorageError::StaleEdit`].
    pub fn undo(&mut self) -> Result<Option<&'static str>, TrackerError> {
        let before = self.targets_of(self.undo.next_undo());
        let label = self.undo.undo(&mut self.storage)?;
        self.settle_bases(before);
        Ok(label)
    }

    /// Re-apply the most recently undone edit, returning its label.
    ///
    /// An element made dirty again gets its current copy as base.
    pub fn redo(&mut self) -> Result<Option<&'static str>, TrackerError> {
        let before = self.targets_of(self.undo.next_redo());
        let label = self.undo.redo(&mut self.storage)?;
        self.settle_bases(before);
        Ok(label)
    }

    /// Truncate the undo history, keeping storage and dirty state.
    pub fn checkpoint(&mut self) {
        self.undo.clear();
    }

    /// Discard every element, base copy and history entry.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Apply one per-element upload success.
    ///
    /// Deletions are purged. Creations move to their server id, with every
    /// referrer and recorded edit rewritten. The element ends `Unchanged` at
    /// the acknowledged version. Acknowledging a clean element is a no-op.
    pub fn apply_upload_ack(&mut self, ack: UploadAck) -> Result<(), TrackerError> {
        let key = ElementRef::new(ack.kind, ack.old_id);
        let current = self.current(key)?;
        match current.state {
            EditState::Unchanged => {
                debug!("{key} is already clean");
                return Ok(());
            }
            EditState::Deleted => {
                self.storage.remove(key, RemoveMode::Force)?;
                self.undo.forget(key);
                self.base.remove(&key);
                debug!("purged acknowledged deletion {key}");
                return Ok(());
            }
            EditState::Created | EditState::Modified => {}
        }
        if ack.new_id.is_local() {
            return Err(TrackerError::LocalAcknowledgement {
                key,
                new_id: ack.new_id,
            });
        }
        let new_key = ElementRef::new(ack.kind, ack.new_id);
        if ack.old_id != ack.new_id {
            self.storage.remap_id(ack.kind, ack.old_id, ack.new_id)?;
            self.undo.remap(ack.kind, ack.old_id, ack.new_id);
            debug!("{key} is now {new_key}");
        }
        self.storage.update(new_key, |element| {
            element.version = ack.new_version;
            element.state = EditState::Unchanged;
        })?;
        self.undo.forget(new_key);
        self.base.remove(&key);
        Ok(())
    }

    /// Finish an upload: apply every acknowledgement, then mark the rest of
    /// the dirty set clean.
    ///
    /// Tombstones are purged and modifications cleared. Creations without an
    /// acknowledgement keep their local id and stay `Created`. Base copies
    /// and the undo history are dropped. Returns how many elements changed.
    pub fn reset_dirty_state(&mut self, acks: &[UploadAck]) -> Result<usize, TrackerError> {
        for ack in acks {
            self.apply_upload_ack(*ack)?;
        }
        let dirty: Vec<(ElementRef, EditState)> = self
            .storage
            .iter()
            .filter(|element| element.state.is_dirty())
            .map(|element| (element.key(), element.state))
            .collect();
        let mut cleared = acks.len();
        for (key, state) in dirty {
            match state {
                EditState::Deleted => {
                    self.storage.remove(key, RemoveMode::Force)?;
                    cleared += 1;
                }
                EditState::Modified => {
                    self.storage
                        .update(key, |element| element.state = EditState::Unchanged)?;
                    cleared += 1;
                }
                EditState::Created => warn!("{key} was not acknowledged and stays local"),
                EditState::Unchanged => {}
            }
        }
        self.base.clear();
        self.undo.clear();
        Ok(cleared)
    }

    /// Settle a conflict reported by the reconciler.
    ///
    /// Recorded edits of a rewritten element are dropped from the history;
    /// a kept local edit is carried forward but can no longer be undone.
    pub fn resolve_conflict(
        &mut self,
        conflict: &Conflict,
        resolution: Resolution,
    ) -> Result<(), TrackerError> {
        let key = conflict.key;
        let current = self
            .storage
            .get(key)
            .cloned()
            .ok_or(TrackerError::NotFound { key })?;
        match (resolution, conflict.kind) {
            (Resolution::AcceptRemote, ConflictKind::LocalEditOfDeletedElement) => {
                let referrers = self.storage.live_referrers(key);
                if !referrers.is_empty() {
                    return Err(StorageError::DanglingReference {
                        target: key,
                        referrers,
                    }
                    .into());
                }
                self.storage.remove(key, RemoveMode::Force)?;
                self.undo.forget(key);
                self.base.remove(&key);
            }
            (Resolution::AcceptRemote, ConflictKind::Version | ConflictKind::Ambiguous) => {
                let mut remote = conflict.remote.clone();
                remote.state = if remote.is_local() {
                    EditState::Created
                } else {
                    EditState::Unchanged
                };
                self.storage.replace(remote)?;
                self.undo.forget(key);
                self.base.remove(&key);
            }
            (Resolution::KeepLocal, _) if current.state == EditState::Created => {}
            (Resolution::KeepLocal, ConflictKind::LocalEditOfDeletedElement) => {
                let local_id = self.storage.next_local_id()?;
                let local_key = ElementRef::new(key.kind, local_id);
                self.storage.remap_id(key.kind, key.id, local_id)?;
                self.undo.remap(key.kind, key.id, local_id);
                self.storage.update(local_key, |element| {
                    element.version = 0;
                    element.state = EditState::Created;
                })?;
                self.undo.forget(local_key);
                self.base.remove(&key);
                debug!("{key} was deleted remotely and is recreated as {local_id}");
            }
            (Resolution::KeepLocal, ConflictKind::Version | ConflictKind::Ambiguous) => {
                if current.state == EditState::Deleted {
                    self.storage
                        .update(key, |element| element.version = conflict.remote_version)?;
                } else {
                    let mut rebased = current;
                    rebased.version = conflict.remote_version;
                    self.mark_modified(rebased)?;
                }
                self.undo.forget(key);
                let mut base = conflict.remote.clone();
                base.state = EditState::Unchanged;
                self.base.insert(key, base);
            }
        }
        debug!("resolved conflict on {key} with {resolution:?}");
        Ok(())
    }

    fn current(&self, key: ElementRef) -> Result<Element, TrackerError> {
        let element = self
            .storage
            .get(key)
            .cloned()
            .ok_or(TrackerError::NotFound { key })?;
        if element.state == EditState::Deleted {
            return Err(TrackerError::AlreadyDeleted { key });
        }
        Ok(element)
    }

    fn targets_of(&self, command: Option<&Command>) -> Vec<(ElementRef, Option<Element>)> {
        command
            .map(Command::targets)
            .unwrap_or_default()
            .into_iter()
            .map(|key| (key, self.storage.get(key).cloned()))
            .collect()
    }

    /// Keep base copies in step with states changed by undo or redo.
    fn settle_bases(&mut self, before: Vec<(ElementRef, Option<Element>)>) {
        for (key, previous) in before {
            let state = self.storage.get(key).map(|element| element.state);
            if !matches!(state, Some(EditState::Modified | EditState::Deleted)) {
                self.base.remove(&key);
            } else if let Some(server) =
                previous.filter(|element| element.state == EditState::Unchanged)
            {
                self.base.entry(key).or_insert(server);
            }
        }
    }

    fn run(&mut self, command: Command) -> Result<(), TrackerError> {
        command.apply(&mut self.storage)?;
        self.undo.record(command);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{id, node, tracker_with, way};
    use crate::{ChangeDocument, Reconciler};
    use rstest::{fixture, rstest};

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[fixture]
    fn street() -> DirtyTracker {
        tracker_with([node(1, 1), node(2, 1), way(10, 3, &[1, 2])])
    }

    #[rstest]
    fn mark_created_requires_local_id(mut street: DirtyTracker) {
        let err = street.mark_created(node(7, 1)).expect_err("server id");
        assert_eq!(
            err,
            TrackerError::NotLocal {
                key: ElementRef::node(id(7))
            }
        );
    }

    #[rstest]
    fn created_ids_are_fresh(mut street: DirtyTracker) {
        let first = street
            .create_node(Coord { x: 1.0, y: 1.0 }, Tags::new())
            .expect("first");
        let second = street
            .create_node(Coord { x: 2.0, y: 1.0 }, Tags::new())
            .expect("second");
        assert_eq!(first.id, id(-1));
        assert_eq!(second.id, id(-2));
        let way = street
            .create_way(vec![first.id, second.id], tags(&[("highway", "path")]))
            .expect("way");
        assert_eq!(street.dirty_count(), 3);
        let order: Vec<_> = street.pending_upload().iter().map(Element::key).collect();
        assert_eq!(order.last(), Some(&way));
    }

    #[rstest]
    fn set_tags_records_base_and_undo(mut street: DirtyTracker) {
        let key = ElementRef::way(id(10));
        street
            .set_tags(key, tags(&[("highway", "residential")]))
            .expect("edit");
        assert!(street.is_dirty(key));
        assert_eq!(street.base(key), Some(&way(10, 3, &[1, 2])));
        assert_eq!(street.undo(), Ok(Some("update-tags")));
        let restored = street.storage().get(key).expect("way");
        assert_eq!(restored.state, EditState::Unchanged);
        assert!(restored.tags.is_empty());
        assert!(street.base(key).is_none(), "clean elements keep no base");
        assert_eq!(street.redo(), Ok(Some("update-tags")));
        assert!(street.is_dirty(key));
        assert_eq!(street.base(key), Some(&way(10, 3, &[1, 2])));
    }

    #[rstest]
    fn combined_edit_has_its_own_label(mut street: DirtyTracker) {
        let key = ElementRef::node(id(1));
        let mut moved = street.storage().get(key).cloned().expect("node");
        moved.tags = tags(&[("highway", "crossing")]);
        moved.geometry = Geometry::Node(Coord { x: 3.0, y: 4.0 });
        street.mark_modified(moved).expect("edit");
        assert_eq!(street.undo_log().labels().last(), Some("update"));
        assert_eq!(street.undo(), Ok(Some("update")));
        assert_eq!(street.storage().get(key), Some(&node(1, 1)));
    }

    #[rstest]
    fn undo_after_accepting_remote_changes_nothing() {
        let mut tracker = tracker_with([node(5, 3)]);
        let key = ElementRef::node(id(5));
        tracker
            .set_tags(key, tags(&[("amenity", "cafe")]))
            .expect("local edit");
        let report = Reconciler::new().apply(
            &mut tracker,
            &ChangeDocument::new().modify(node(5, 4).with_tags([("amenity", "bar")])),
        );
        let conflict = report.conflicts.first().expect("version conflict");
        tracker
            .resolve_conflict(conflict, Resolution::AcceptRemote)
            .expect("accept remote");

        assert_eq!(tracker.undo(), Ok(None));
        let stored = tracker.storage().get(key).expect("n5");
        assert_eq!(stored.version, 4);
        assert_eq!(stored.state, EditState::Unchanged);
        assert_eq!(stored.tags, tags(&[("amenity", "bar")]));
        assert!(tracker.base(key).is_none());
    }

    #[rstest]
    fn redo_after_remote_overwrite_changes_nothing() {
        let mut tracker = tracker_with([node(5, 1)]);
        let key = ElementRef::node(id(5));
        tracker
            .set_tags(key, tags(&[("amenity", "cafe")]))
            .expect("local edit");
        tracker.undo().expect("undo");
        let report = Reconciler::new().apply(
            &mut tracker,
            &ChangeDocument::new().modify(node(5, 2).with_tags([("amenity", "bar")])),
        );
        assert_eq!(report.applied, 1);

        assert_eq!(tracker.redo(), Ok(None));
        let stored = tracker.storage().get(key).expect("n5");
        assert_eq!((stored.version, stored.state), (2, EditState::Unchanged));
        assert_eq!(stored.tags, tags(&[("amenity", "bar")]));
        assert!(tracker.base(key).is_none());
    }

    #[rstest]
    fn keeping_local_edit_rebases_without_undo_history() {
        let mut tracker = tracker_with([node(5, 3)]);
        let key = ElementRef::node(id(5));
        tracker
            .set_tags(key, tags(&[("amenity", "cafe")]))
            .expect("local edit");
        let report = Reconciler::new().apply(
            &mut tracker,
            &ChangeDocument::new().modify(node(5, 4).with_tags([("amenity", "bar")])),
        );
        let conflict = report.conflicts.first().expect("version conflict");
        tracker
            .resolve_conflict(conflict, Resolution::KeepLocal)
            .expect("keep local");

        assert!(!tracker.undo_log().can_undo());
        let stored = tracker.storage().get(key).expect("n5");
        assert_eq!((stored.version, stored.state), (4, EditState::Modified));
        assert_eq!(
            tracker.base(key).map(|base| base.version),
            Some(4),
            "base follows the remote copy"
        );
    }

    #[rstest]
    fn set_geometry_checks_kind(mut street: DirtyTracker) {
        let err = street
            .set_geometry(ElementRef::node(id(1)), Geometry::Way(vec![id(2)]))
            .expect_err("kind");
        assert!(matches!(err, TrackerError::KindMismatch { .. }));
        street
            .set_geometry(
                ElementRef::node(id(1)),
                Geometry::Node(Coord { x: 3.0, y: 4.0 }),
            )
            .expect("move node");
        assert_eq!(street.undo_log().labels().last(), Some("update-geometry"));
    }

    #[rstest]
    fn deleting_referenced_node_fails(mut street: DirtyTracker) {
        let err = street
            .mark_deleted(ElementRef::node(id(1)))
            .expect_err("referenced");
        assert!(matches!(
            err,
            TrackerError::Storage(StorageError::DanglingReference { .. })
        ));
    }

    #[rstest]
    fn deleting_server_element_leaves_tombstone(mut street: DirtyTracker) {
        let key = ElementRef::way(id(10));
        street.mark_deleted(key).expect("delete way");
        assert_eq!(
            street.storage().get(key).map(|w| w.state),
            Some(EditState::Deleted)
        );
        street
            .mark_deleted(ElementRef::node(id(1)))
            .expect("node no longer has live referrers");
        assert_eq!(
            street.mark_deleted(key),
            Err(TrackerError::AlreadyDeleted { key })
        );
    }

    #[rstest]
    fn deleting_created_element_removes_it(mut street: DirtyTracker) {
        let key = street
            .create_node(Coord { x: 0.5, y: 0.5 }, Tags::new())
            .expect("create");
        street.mark_deleted(key).expect("delete");
        assert!(!street.storage().contains(key));
        assert_eq!(street.undo(), Ok(Some("remove")));
        assert!(street.storage().contains(key));
    }

    #[rstest]
    fn upload_ack_remaps_created_ids(mut street: DirtyTracker) {
        let a = street
            .create_node(Coord { x: 1.0, y: 1.0 }, Tags::new())
            .expect("node");
        let w = street
            .create_way(vec![a.id, id(2)], Tags::new())
            .expect("way");
        street
            .apply_upload_ack(UploadAck {
                kind: ElementKind::Node,
                old_id: a.id,
                new_id: id(500),
                new_version: 1,
            })
            .expect("ack");
        let way = street.storage().get(w).expect("way");
        assert_eq!(way.node_refs(), Some(&[id(500), id(2)][..]));
        let uploaded = street.storage().get_by(ElementKind::Node, id(500)).expect("node");
        assert_eq!(uploaded.state, EditState::Unchanged);
        assert_eq!(uploaded.version, 1);
    }

    #[rstest]
    fn upload_ack_refuses_local_target(mut street: DirtyTracker) {
        let a = street
            .create_node(Coord { x: 1.0, y: 1.0 }, Tags::new())
            .expect("node");
        let err = street
            .apply_upload_ack(UploadAck {
                kind: ElementKind::Node,
                old_id: a.id,
                new_id: id(-40),
                new_version: 1,
            })
            .expect_err("local id");
        assert!(matches!(err, TrackerError::LocalAcknowledgement { .. }));
    }

    #[rstest]
    fn reset_dirty_state_clears_everything_acknowledged(mut street: DirtyTracker) {
        street
            .set_tags(ElementRef::node(id(2)), tags(&[("barrier", "gate")]))
            .expect("edit");
        street.mark_deleted(ElementRef::way(id(10))).expect("delete");
        let orphan = street
            .create_node(Coord { x: 9.0, y: 9.0 }, Tags::new())
            .expect("create");
        let cleared = street.reset_dirty_state(&[]).expect("reset");
        assert_eq!(cleared, 2);
        assert!(!street.storage().contains(ElementRef::way(id(10))));
        assert!(!street.is_dirty(ElementRef::node(id(2))));
        assert!(street.is_dirty(orphan), "unacknowledged creation stays");
        assert!(!street.undo_log().can_undo());
        assert_eq!(street.bases().count(), 0);
    }

    #[rstest]
    fn restore_keeps_state_and_advances_allocator() {
        let mut tracker = DirtyTracker::restore(
            [node(-4, 0), node(3, 2).with_state(EditState::Modified)],
            [node(3, 1), node(99, 1)],
        )
        .expect("restore");
        assert_eq!(tracker.dirty_count(), 2);
        assert_eq!(tracker.bases().count(), 1);
        let next = tracker
            .create_node(Coord { x: 0.0, y: 0.0 }, Tags::new())
            .expect("create");
        assert_eq!(next.id, id(-5));
    }

    #[rstest]
    fn reset_discards_everything(mut street: DirtyTracker) {
        street
            .set_tags(ElementRef::node(id(1)), tags(&[("a", "b")]))
            .expect("edit");
        street.reset();
        assert!(street.storage().is_empty());
        assert!(!street.undo_log().can_undo());
    }
}
