//! Fixture documents and filesystem helpers for CLI tests.

use super::*;
use camino::{Utf8Path, Utf8PathBuf};
use mapsync_core::{ElementRef, OsmId, Tags};
use std::fs;
use tempfile::TempDir;

pub(super) const STREET: &str = r#"{"elements": [
    {"type": "node", "id": 1, "version": 1, "lat": 51.50, "lon": -0.12},
    {"type": "node", "id": 2, "version": 1, "lat": 51.51, "lon": -0.12},
    {"type": "way", "id": 10, "version": 2, "nodes": [1, 2], "tags": {"highway": "residential"}}
]}"#;

pub(super) const REMOTE_RENAME: &str = r#"{"changes": [
    {"action": "modify", "element": {"type": "way", "id": 10, "version": 3, "nodes": [1, 2],
     "tags": {"highway": "residential", "name": "Remote Road"}}}
]}"#;

pub(super) const WAY_TEN_ACK: &str =
    r#"{"acks": [{"type": "way", "old_id": 10, "new_id": 10, "new_version": 3}]}"#;

pub(super) fn write_utf8(path: &Utf8Path, contents: &[u8]) {
    fs::write(path.as_std_path(), contents).expect("write fixture file");
}

pub(super) fn workspace() -> (TempDir, Utf8PathBuf) {
    let tmp = TempDir::new().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf-8 workspace");
    (tmp, root)
}

pub(super) fn way_ten() -> ElementRef {
    ElementRef::way(OsmId::from_raw(10).expect("non-zero id"))
}

/// Retag way 10 in the saved session, standing in for an editor.
pub(super) fn retag_way_ten(database: &Utf8Path, name: &str) {
    let mut tracker = open_session(database).expect("session restores");
    let mut tags = Tags::new();
    tags.insert("highway".to_owned(), "residential".to_owned());
    tags.insert("name".to_owned(), name.to_owned());
    tracker.set_tags(way_ten(), tags).expect("way 10 is editable");
    save_session(database, &tracker).expect("session persists");
}

/// Import [`STREET`] into `session.db` under `root` and return the database path.
pub(super) fn import_street(root: &Utf8Path) -> Utf8PathBuf {
    let snapshot = root.join("snapshot.json");
    let database = root.join("session.db");
    write_utf8(&snapshot, STREET.as_bytes());
    let args = crate::import::ImportArgs {
        snapshot: Some(snapshot),
        database: Some(database.clone()),
    };
    dispatch(Command::Import(args), &mut Vec::new()).expect("import succeeds");
    database
}
