//! File formats and persistence for map editing sessions.
//!
//! Responsibilities:
//! - Parse JSON change files, snapshots and upload acknowledgements into
//!   core types, surfacing bad records as malformed entries.
//! - Render the pending upload as a change file.
//! - Checkpoint and restore a tracker through SQLite.
//!
//! Boundaries:
//! - Do not encode reconciliation rules (live in `mapsync-core`).

#![forbid(unsafe_code)]

pub mod fs;
mod load;
mod records;
mod sqlite;

pub use load::{
    LoadDocumentError, load_acks, load_change_document, load_snapshot, parse_acks,
    parse_change_document, parse_snapshot, render_acks, render_pending,
};
pub use records::{
    ChangeRecord, ChangeRecordError, ElementRecord, MemberRecord, change_entry, snapshot_entry,
};
pub use sqlite::{PersistSessionError, RestoreSessionError, persist_session, restore_session};
