//! Loading change files, snapshots and upload acknowledgements from disk.
//!
//! All three documents are JSON objects wrapping a single array:
//!
//! - change files: `{"changes": [{"action": "modify", "element": {..}}, ..]}`
//! - snapshots: `{"elements": [{..}, ..]}`
//! - acknowledgements: `{"acks": [{"type": "node", "old_id": -1, ..}, ..]}`
//!
//! Individual element records that fail to convert become malformed entries;
//! only a document that is not valid JSON of the right outer shape fails.
//! Other top-level keys, such as a `notes` array exported next to the
//! changes, are ignored: notes are not map elements.

use camino::{Utf8Path, Utf8PathBuf};
use log::{debug, warn};
use mapsync_core::{ChangeDocument, DirtyTracker, UploadAck};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::fs;
use crate::records::{ChangeRecord, change_entry, snapshot_entry};

/// Errors raised when loading a document from disk.
#[derive(Debug, Error)]
pub enum LoadDocumentError {
    /// The document does not exist.
    #[error("document not found at {path}")]
    MissingFile {
        /// Requested path.
        path: Utf8PathBuf,
    },
    /// Reading the document failed.
    #[error("failed to read document at {path}")]
    Read {
        /// Requested path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid JSON of the expected outer shape.
    #[error("document at {path} is not valid JSON")]
    Syntax {
        /// Requested path.
        path: Utf8PathBuf,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
struct RawChangeFile {
    changes: Vec<Value>,
}

#[derive(Deserialize)]
struct RawSnapshotFile {
    elements: Vec<Value>,
}

#[derive(Serialize, Deserialize)]
struct AckFile {
    acks: Vec<UploadAck>,
}

#[derive(Serialize)]
struct PendingFile {
    changes: Vec<ChangeRecord>,
}

/// Parse a change file into a change document.
///
/// Records without a usable action are skipped with a warning; every other
/// record yields exactly one entry, in file order.
///
/// # Examples
/// ```
/// use mapsync_data::parse_change_document;
///
/// # fn main() -> Result<(), serde_json::Error> {
/// let document = parse_change_document(
///     r#"{"changes": [
///         {"action": "create", "element": {"type": "node", "id": -1, "lat": 1.0, "lon": 2.0}},
///         {"action": "delete", "element": {"type": "way", "id": 7}}
///     ]}"#,
/// )?;
/// assert_eq!(document.len(), 2);
/// # Ok(())
/// # }
/// ```
pub fn parse_change_document(text: &str) -> Result<ChangeDocument, serde_json::Error> {
    let raw: RawChangeFile = serde_json::from_str(text)?;
    let mut document = ChangeDocument::new();
    for (position, value) in raw.changes.iter().enumerate() {
        match change_entry(value) {
            Ok(entry) => document.push(entry),
            Err(error) => warn!("Skipped change record {position}: {error}"),
        }
    }
    debug!("Parsed change document with {} entries", document.len());
    Ok(document)
}

/// Parse a snapshot into a document of CREATE entries.
pub fn parse_snapshot(text: &str) -> Result<ChangeDocument, serde_json::Error> {
    let raw: RawSnapshotFile = serde_json::from_str(text)?;
    Ok(raw.elements.iter().map(snapshot_entry).collect())
}

/// Parse an acknowledgement file.
pub fn parse_acks(text: &str) -> Result<Vec<UploadAck>, serde_json::Error> {
    let file: AckFile = serde_json::from_str(text)?;
    Ok(file.acks)
}

/// Render the tracker's pending upload as a change file, in upload order.
pub fn render_pending(tracker: &DirtyTracker) -> Result<String, serde_json::Error> {
    let changes = tracker
        .pending_upload()
        .iter()
        .filter_map(ChangeRecord::pending)
        .collect();
    serde_json::to_string_pretty(&PendingFile { changes })
}

/// Render acknowledgements in the layout [`parse_acks`] reads.
pub fn render_acks(acks: &[UploadAck]) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&AckFile {
        acks: acks.to_vec(),
    })
}

/// Load a change file from disk.
pub fn load_change_document(path: &Utf8Path) -> Result<ChangeDocument, LoadDocumentError> {
    load_with(path, parse_change_document)
}

/// Load a snapshot from disk.
pub fn load_snapshot(path: &Utf8Path) -> Result<ChangeDocument, LoadDocumentError> {
    load_with(path, parse_snapshot)
}

/// Load an acknowledgement file from disk.
pub fn load_acks(path: &Utf8Path) -> Result<Vec<UploadAck>, LoadDocumentError> {
    load_with(path, parse_acks)
}

fn load_with<T>(
    path: &Utf8Path,
    parse: fn(&str) -> Result<T, serde_json::Error>,
) -> Result<T, LoadDocumentError> {
    let exists = fs::is_existing_file(path).map_err(|source| LoadDocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    if !exists {
        return Err(LoadDocumentError::MissingFile {
            path: path.to_path_buf(),
        });
    }
    let text = fs::read_to_string(path).map_err(|source| LoadDocumentError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text).map_err(|source| LoadDocumentError::Syntax {
        path: path.to_path_buf(),
        source,
    })
}
