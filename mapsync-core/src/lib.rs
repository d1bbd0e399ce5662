//! Element storage and change reconciliation for offline map editing.
//!
//! Elements live in a [`Storage`] that keeps a reverse-reference index in
//! lockstep with every mutation. A [`DirtyTracker`] wraps the storage with
//! local edit bookkeeping and undo history, and a [`Reconciler`] merges
//! externally produced [`ChangeDocument`]s into it, reporting conflicts and
//! structural errors per entry instead of failing the batch.
//!
//! # Examples
//!
//! ```
//! use geo::Coord;
//! use mapsync_core::{ChangeDocument, DirtyTracker, Element, OsmId, Reconciler, Tags};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut tracker = DirtyTracker::new();
//! let snapshot = ChangeDocument::new()
//!     .create(Element::node(OsmId::from_raw(1)?, 1, Coord { x: 0.0, y: 0.0 }))
//!     .create(Element::node(OsmId::from_raw(2)?, 1, Coord { x: 1.0, y: 0.0 }));
//! let report = Reconciler::new().apply(&mut tracker, &snapshot);
//! assert_eq!(report.applied, 2);
//!
//! let way = tracker.create_way(
//!     vec![OsmId::from_raw(1)?, OsmId::from_raw(2)?],
//!     Tags::from([("highway".to_owned(), "path".to_owned())]),
//! )?;
//! assert!(way.id.is_local());
//! assert_eq!(tracker.pending_upload().len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

mod change;
mod element;
mod ordering;
pub mod reconcile;
pub mod storage;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
mod tracker;
mod undo;

pub use change::{ChangeAction, ChangeDocument, ChangeEntry, EntryPayload, UnknownAction};
pub use element::{
    EditState, Element, ElementError, ElementKind, ElementRef, Geometry, Member, OsmId, Tags,
};
pub use reconcile::{
    CancelFlag, Conflict, ConflictKind, EntryError, EntryErrorKind, MergeDecision, MergePolicy,
    MergeStrategy, ReconcileReport, Reconciler,
};
pub use storage::{
    DanglingMember, IncompleteWay, IntegrityReport, RemoveMode, Snapshot, Storage, StorageError,
};
pub use tracker::{DirtyTracker, Resolution, TrackerError, UploadAck};
pub use undo::{Command, UndoLog};
