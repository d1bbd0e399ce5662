//! Facade crate for the mapsync offline editing engine.
//!
//! This crate re-exports the core element store and reconciliation types and
//! exposes session persistence and JSON document loading behind the
//! `store-sqlite` feature.

#![forbid(unsafe_code)]

pub use mapsync_core::{
    CancelFlag, ChangeAction, ChangeDocument, ChangeEntry, Conflict, ConflictKind, DirtyTracker,
    EditState, Element, ElementError, ElementKind, ElementRef, EntryError, EntryErrorKind,
    Geometry, IntegrityReport, Member, MergePolicy, MergeStrategy, OsmId, ReconcileReport,
    Reconciler, RemoveMode, Resolution, Storage, StorageError, Tags, TrackerError, UploadAck,
};

#[cfg(feature = "store-sqlite")]
pub use mapsync_data::{
    LoadDocumentError, PersistSessionError, RestoreSessionError, load_acks, load_change_document,
    load_snapshot, persist_session, render_pending, restore_session,
};
