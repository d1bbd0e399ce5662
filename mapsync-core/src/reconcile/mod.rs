//! Applying change documents to tracked storage.
//!
//! [`Reconciler::apply`] walks a [`ChangeDocument`] in order and never stops
//! on a bad entry: structural failures become [`EntryError`]s, diverging
//! local edits become [`Conflict`]s, and everything else commits. Deletes of
//! still-referenced elements are retried after the pass until no further
//! progress is made, so a document may delete a node before the way using
//! it.
//!
//! # Examples
//! ```
//! use geo::Coord;
//! use mapsync_core::{ChangeDocument, DirtyTracker, Element, OsmId, Reconciler};
//!
//! # fn main() -> Result<(), mapsync_core::ElementError> {
//! let (a, b) = (OsmId::from_raw(1)?, OsmId::from_raw(2)?);
//! let node = Element::node(a, 1, Coord { x: 0.0, y: 0.0 });
//! let way = Element::way(OsmId::from_raw(10)?, 1, vec![a, b]);
//! let mut tracker = DirtyTracker::new();
//! let snapshot = ChangeDocument::new()
//!     .create(node.clone())
//!     .create(Element::node(b, 1, Coord { x: 1.0, y: 0.0 }))
//!     .create(way.clone());
//! assert_eq!(Reconciler::new().apply(&mut tracker, &snapshot).applied, 3);
//!
//! let document = ChangeDocument::new().delete(node).delete(way);
//! let report = Reconciler::new().apply(&mut tracker, &document);
//! assert_eq!(report.applied, 2);
//! assert!(report.errors.is_empty());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use thiserror::Error;

use crate::storage::RefList;
use crate::{ChangeAction, ChangeDocument, DirtyTracker, EditState, Element, ElementRef};
use crate::{EntryPayload, IntegrityReport, RemoveMode, StorageError};

mod merge;

pub use merge::{
    ConflictOnDivergence, MergeDecision, MergePolicy, MergeStrategy, PreferLocal, ThreeWayMerge,
    UnknownStrategy,
};

/// Shared flag requesting that a running reconciliation stop.
///
/// The reconciler checks it between whole entries, so storage always
/// reflects a prefix of the document.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why a local element and a remote snapshot could not be merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case")
)]
pub enum ConflictKind {
    /// The remote version moved past the version the local edit is based on.
    Version,
    /// The remote side deleted an element that was edited locally.
    LocalEditOfDeletedElement,
    /// Both sides changed the same version and the merge policy declined.
    Ambiguous,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Version => "version conflict",
            Self::LocalEditOfDeletedElement => "local edit of deleted element",
            Self::Ambiguous => "ambiguous concurrent edit",
        })
    }
}

/// A diverging local edit left untouched for explicit resolution.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Conflict {
    /// Position of the entry in the document.
    pub index: usize,
    /// Affected element.
    pub key: ElementRef,
    /// Kind of divergence.
    pub kind: ConflictKind,
    /// Version the local edit is based on.
    pub local_version: u64,
    /// Version carried by the remote snapshot.
    pub remote_version: u64,
    /// The remote snapshot, so the conflict can be settled by accepting it.
    pub remote: Element,
}

/// Structural reason an entry was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "kebab-case", tag = "reason")
)]
pub enum EntryErrorKind {
    /// CREATE of an element that already exists.
    #[error("element already exists")]
    DuplicateCreate,
    /// MODIFY of an element that does not exist.
    #[error("element does not exist")]
    MissingTarget,
    /// DELETE of an element that live elements still reference.
    #[error("element is still referenced by {}", RefList(.referrers))]
    DanglingReference {
        /// Live referrers at the end of the pass.
        referrers: Vec<ElementRef>,
    },
    /// The snapshot violates the element invariants.
    #[error("invalid element: {message}")]
    InvalidElement {
        /// Validation failure.
        message: String,
    },
    /// The parser could not build a snapshot.
    #[error("malformed record: {message}")]
    Malformed {
        /// Parser diagnostic.
        message: String,
    },
}

/// A skipped entry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[error("entry {index} ({action}): {kind}")]
pub struct EntryError {
    /// Position of the entry in the document.
    pub index: usize,
    /// Operation of the entry.
    pub action: ChangeAction,
    /// Affected element, when known.
    pub key: Option<ElementRef>,
    /// What went wrong.
    #[source]
    pub kind: EntryErrorKind,
}

/// Aggregate outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ReconcileReport {
    /// Entries committed to storage.
    pub applied: usize,
    /// MODIFY entries merged into dirty local elements.
    pub merged: usize,
    /// Entries that were stale or already reflected in storage.
    pub already_applied: usize,
    /// Diverging local edits left for resolution.
    pub conflicts: Vec<Conflict>,
    /// Skipped entries.
    pub errors: Vec<EntryError>,
    /// Entries visited before the pass ended.
    pub processed: usize,
    /// Whether the pass stopped on a cancellation request.
    pub cancelled: bool,
    /// Deferred DELETE entries dropped because of cancellation.
    pub abandoned: Vec<usize>,
    /// Structural state of storage after the pass.
    pub integrity: IntegrityReport,
}

impl ReconcileReport {
    /// Whether every entry applied without conflicts, errors or
    /// cancellation.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
            && self.errors.is_empty()
            && self.abandoned.is_empty()
            && !self.cancelled
    }
}

/// Applies change documents using a configurable [`MergePolicy`].
#[derive(Debug)]
pub struct Reconciler {
    policy: Box<dyn MergePolicy>,
    cancel: CancelFlag,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            policy: Box::new(ThreeWayMerge),
            cancel: CancelFlag::new(),
        }
    }
}

/// A DELETE waiting for its referrers to disappear.
struct PendingDelete {
    index: usize,
    key: ElementRef,
}

impl Reconciler {
    /// Reconciler using [`ThreeWayMerge`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `policy` for same-version edits.
    #[must_use]
    pub fn with_policy(mut self, policy: impl MergePolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Use the policy selected by `strategy`.
    #[must_use]
    pub fn with_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.policy = strategy.into_policy();
        self
    }

    /// Observe `flag` between entries.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: CancelFlag) -> Self {
        self.cancel = flag;
        self
    }

    /// Apply `document` to `tracker`.
    ///
    /// Never fails as a whole; inspect the report for per-entry outcomes.
    /// Merged changes are not recorded in the undo log, and recorded local
    /// edits of every element the document rewrites are dropped from it.
    #[must_use]
    pub fn apply(&self, tracker: &mut DirtyTracker, document: &ChangeDocument) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut deferred = Vec::new();
        for (index, entry) in document.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match &entry.payload {
                EntryPayload::Malformed { key, reason } => {
                    report.errors.push(EntryError {
                        index,
                        action: entry.action,
                        key: *key,
                        kind: EntryErrorKind::Malformed {
                            message: reason.clone(),
                        },
                    });
                }
                EntryPayload::Element(remote) => match entry.action {
                    ChangeAction::Create => create(tracker, index, remote, &mut report),
                    ChangeAction::Modify => {
                        self.modify(tracker, index, remote, &mut report);
                    }
                    ChangeAction::Delete => {
                        if let Some(pending) = delete(tracker, index, remote, &mut report) {
                            deferred.push(pending);
                        }
                    }
                },
            }
            report.processed += 1;
            debug!("entry {index}: {} {:?}", entry.action, entry.key());
        }
        self.resolve_deferred(tracker, deferred, &mut report);
        report.integrity = tracker.storage.integrity_report();
        info!(
            "reconciled {} entries: {} applied, {} merged, {} already applied, {} conflicts, {} errors{}",
            report.processed,
            report.applied,
            report.merged,
            report.already_applied,
            report.conflicts.len(),
            report.errors.len(),
            if report.cancelled { " (cancelled)" } else { "" },
        );
        report
    }

    fn modify(
        &self,
        tracker: &mut DirtyTracker,
        index: usize,
        snapshot: &Element,
        report: &mut ReconcileReport,
    ) {
        let key = snapshot.key();
        let Some(local) = tracker.storage.get(key).cloned() else {
            report.errors.push(entry_error(
                index,
                ChangeAction::Modify,
                key,
                EntryErrorKind::MissingTarget,
            ));
            return;
        };
        let remote = normalized(snapshot.clone());
        if let Err(err) = remote.validate() {
            report.errors.push(entry_error(
                index,
                ChangeAction::Modify,
                key,
                EntryErrorKind::InvalidElement {
                    message: err.to_string(),
                },
            ));
            return;
        }
        if local.state == EditState::Unchanged {
            if remote.version < local.version
                || (remote.version == local.version && local.same_content(&remote))
            {
                report.already_applied += 1;
                return;
            }
            let replaced = tracker.storage.replace(remote);
            if replaced.is_ok() {
                tracker.undo.forget(key);
            }
            commit(replaced, index, ChangeAction::Modify, key, report);
            return;
        }
        if remote.version > local.version {
            report.conflicts.push(conflict(index, ConflictKind::Version, &local, remote));
            return;
        }
        if remote.version < local.version {
            debug!("{key}: remote version {} is stale", remote.version);
            report.already_applied += 1;
            return;
        }
        if local.state == EditState::Deleted {
            if local.same_content(&remote) {
                report.already_applied += 1;
            } else {
                report
                    .conflicts
                    .push(conflict(index, ConflictKind::Ambiguous, &local, remote));
            }
            return;
        }
        match self.policy.merge(&local, &remote, tracker.base.get(&key)) {
            MergeDecision::KeepLocal => report.already_applied += 1,
            MergeDecision::Merged { tags, geometry } => {
                let result = tracker.storage.update(key, |element| {
                    element.tags = tags;
                    element.geometry = geometry;
                });
                if result.is_ok() {
                    report.merged += 1;
                    tracker.undo.forget(key);
                    tracker.base.insert(key, remote);
                } else {
                    commit(result, index, ChangeAction::Modify, key, report);
                }
            }
            MergeDecision::Conflict => {
                report
                    .conflicts
                    .push(conflict(index, ConflictKind::Ambiguous, &local, remote));
            }
        }
    }

    fn resolve_deferred(
        &self,
        tracker: &mut DirtyTracker,
        mut pending: Vec<PendingDelete>,
        report: &mut ReconcileReport,
    ) {
        loop {
            if report.cancelled || self.cancel.is_cancelled() {
                report.cancelled = true;
                report.abandoned = pending.iter().map(|delete| delete.index).collect();
                return;
            }
            let before = pending.len();
            let mut blocked = Vec::with_capacity(before);
            for delete in pending {
                if !tracker.storage.contains(delete.key) {
                    report.already_applied += 1;
                } else if live_referrers(tracker, delete.key).is_empty() {
                    let removed = tracker.storage.remove(delete.key, RemoveMode::Force);
                    tracker.undo.forget(delete.key);
                    commit(removed, delete.index, ChangeAction::Delete, delete.key, report);
                } else {
                    blocked.push(delete);
                }
            }
            pending = blocked;
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for delete in pending {
            let referrers = live_referrers(tracker, delete.key);
            warn!(
                "cannot delete {}: still referenced by {}",
                delete.key,
                RefList(&referrers)
            );
            report.errors.push(entry_error(
                delete.index,
                ChangeAction::Delete,
                delete.key,
                EntryErrorKind::DanglingReference { referrers },
            ));
        }
    }
}

fn create(tracker: &mut DirtyTracker, index: usize, remote: &Element, report: &mut ReconcileReport) {
    let key = remote.key();
    if tracker.storage.contains(key) {
        report.errors.push(entry_error(
            index,
            ChangeAction::Create,
            key,
            EntryErrorKind::DuplicateCreate,
        ));
        return;
    }
    let element = normalized(remote.clone());
    commit(tracker.storage.insert(element), index, ChangeAction::Create, key, report);
}

fn delete(
    tracker: &mut DirtyTracker,
    index: usize,
    snapshot: &Element,
    report: &mut ReconcileReport,
) -> Option<PendingDelete> {
    let key = snapshot.key();
    let Some(local) = tracker.storage.get(key).cloned() else {
        debug!("{key} is already gone");
        report.already_applied += 1;
        return None;
    };
    match local.state {
        EditState::Deleted => {
            let removed = tracker.storage.remove(key, RemoveMode::Force);
            commit(removed, index, ChangeAction::Delete, key, report);
            tracker.undo.forget(key);
            tracker.base.remove(&key);
            None
        }
        EditState::Created | EditState::Modified => {
            report.conflicts.push(conflict(
                index,
                ConflictKind::LocalEditOfDeletedElement,
                &local,
                normalized(snapshot.clone()),
            ));
            None
        }
        EditState::Unchanged if live_referrers(tracker, key).is_empty() => {
            let removed = tracker.storage.remove(key, RemoveMode::Force);
            commit(removed, index, ChangeAction::Delete, key, report);
            tracker.undo.forget(key);
            None
        }
        EditState::Unchanged => {
            debug!("deferring delete of referenced {key}");
            Some(PendingDelete { index, key })
        }
    }
}

/// Live elements other than `key` itself that refer to it.
fn live_referrers(tracker: &DirtyTracker, key: ElementRef) -> Vec<ElementRef> {
    tracker
        .storage
        .live_referrers(key)
        .into_iter()
        .filter(|referrer| *referrer != key)
        .collect()
}

/// Derive the state of a remote snapshot from its id space.
fn normalized(mut element: Element) -> Element {
    if element.is_local() {
        element.state = EditState::Created;
        element.version = 0;
    } else {
        element.state = EditState::Unchanged;
    }
    element
}

fn conflict(index: usize, kind: ConflictKind, local: &Element, remote: Element) -> Conflict {
    debug!("{}: {kind}", local.key());
    Conflict {
        index,
        key: local.key(),
        kind,
        local_version: local.version,
        remote_version: remote.version,
        remote,
    }
}

const fn entry_error(
    index: usize,
    action: ChangeAction,
    key: ElementRef,
    kind: EntryErrorKind,
) -> EntryError {
    EntryError {
        index,
        action,
        key: Some(key),
        kind,
    }
}

/// Count a storage mutation as applied or record why it failed.
fn commit<T>(
    result: Result<T, StorageError>,
    index: usize,
    action: ChangeAction,
    key: ElementRef,
    report: &mut ReconcileReport,
) {
    let kind = match result {
        Ok(_) => {
            report.applied += 1;
            return;
        }
        Err(StorageError::DuplicateId { .. }) => EntryErrorKind::DuplicateCreate,
        Err(StorageError::NotFound { .. }) => EntryErrorKind::MissingTarget,
        Err(StorageError::DanglingReference { referrers, .. }) => {
            EntryErrorKind::DanglingReference { referrers }
        }
        Err(StorageError::InvalidElement(err)) => EntryErrorKind::InvalidElement {
            message: err.to_string(),
        },
        Err(err @ StorageError::StaleEdit { .. }) => EntryErrorKind::InvalidElement {
            message: err.to_string(),
        },
    };
    report.errors.push(entry_error(index, action, key, kind));
}
