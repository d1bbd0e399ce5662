//! SQLite persistence for editing sessions.
//!
//! A session is the tracker's element set plus the base copies of dirty
//! elements. Each checkpoint replaces the previous one inside a single
//! transaction. Undo history is not persisted.

use camino::{Utf8Path, Utf8PathBuf};
use log::info;
use mapsync_core::{DirtyTracker, Element, ElementRef, TrackerError};
use rusqlite::{Connection, Error as SqliteError, OpenFlags, Transaction};
use thiserror::Error;

use crate::fs;

/// Errors raised when persisting a session to SQLite.
#[derive(Debug, Error)]
pub enum PersistSessionError {
    /// Failed to create the parent directory for the database.
    #[error("failed to create parent directory for {path}")]
    CreateDirectory {
        /// Database path whose parent could not be created.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the SQLite database failed.
    #[error("failed to open SQLite database at {path}")]
    Open {
        /// Destination database path.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Enabling SQLite foreign keys failed.
    #[error("failed to enable SQLite foreign keys")]
    ForeignKeys {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Beginning the transaction failed.
    #[error("failed to begin session transaction")]
    BeginTransaction {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Creating the session tables failed.
    #[error("failed to create session tables")]
    CreateSchema {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Clearing the previous checkpoint failed.
    #[error("failed to clear previous session")]
    ClearRows {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// An element version could not be represented as an SQLite integer.
    #[error("{key} version {version} exceeds SQLite i64 range")]
    VersionOutOfRange {
        /// Offending element.
        key: ElementRef,
        /// Version that failed the conversion.
        version: u64,
    },
    /// Serializing an element body to JSON failed.
    #[error("failed to serialize {key}")]
    SerializeElement {
        /// Offending element.
        key: ElementRef,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// Preparing an insert statement failed.
    #[error("failed to prepare session insert statement")]
    PrepareInsert {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Writing an element row failed.
    #[error("failed to persist {key}")]
    PersistRow {
        /// Element being persisted.
        key: ElementRef,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Committing the transaction failed.
    #[error("failed to commit session transaction")]
    Commit {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
}

/// Errors raised when restoring a session from SQLite.
#[derive(Debug, Error)]
pub enum RestoreSessionError {
    /// No database exists at the path.
    #[error("no session database at {path}")]
    MissingDatabase {
        /// Requested database path.
        path: Utf8PathBuf,
    },
    /// Opening the SQLite database failed.
    #[error("failed to open SQLite database at {path}")]
    Open {
        /// Requested database path.
        path: Utf8PathBuf,
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// Reading rows failed, e.g. because the tables are missing.
    #[error("failed to read session rows")]
    Query {
        /// Source error returned by `rusqlite`.
        #[source]
        source: SqliteError,
    },
    /// A stored element body is not valid JSON for an element.
    #[error("failed to decode stored {kind} {id}")]
    DecodeElement {
        /// Stored kind column.
        kind: String,
        /// Stored id column.
        id: i64,
        /// Source error produced by `serde_json`.
        #[source]
        source: serde_json::Error,
    },
    /// The stored elements do not form a valid storage.
    #[error("stored session is inconsistent")]
    Restore {
        /// Error raised while rebuilding the tracker.
        #[source]
        source: TrackerError,
    },
}

/// Write the tracker's elements and base copies to a SQLite database.
///
/// The previous checkpoint in the database is replaced. Parent directories
/// are created automatically and the tables are initialised if missing.
///
/// # Examples
/// ```no_run
/// use camino::Utf8Path;
/// use mapsync_core::DirtyTracker;
/// use mapsync_data::{persist_session, restore_session};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let path = Utf8Path::new("session.db");
/// persist_session(path, &DirtyTracker::new())?;
/// let tracker = restore_session(path)?;
/// assert_eq!(tracker.storage().len(), 0);
/// # Ok(())
/// # }
/// ```
pub fn persist_session(path: &Utf8Path, tracker: &DirtyTracker) -> Result<(), PersistSessionError> {
    fs::ensure_parent_dir(path).map_err(|source| PersistSessionError::CreateDirectory {
        path: path.to_path_buf(),
        source,
    })?;
    let mut connection =
        Connection::open(path.as_std_path()).map_err(|source| PersistSessionError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    connection
        .pragma_update(None, "foreign_keys", true)
        .map_err(|source| PersistSessionError::ForeignKeys { source })?;

    let transaction = connection
        .transaction()
        .map_err(|source| PersistSessionError::BeginTransaction { source })?;

    create_schema(&transaction)?;
    clear_rows(&transaction)?;
    persist_rows(&transaction, Table::Elements, tracker.storage().iter())?;
    persist_rows(&transaction, Table::Bases, tracker.bases())?;

    transaction
        .commit()
        .map_err(|source| PersistSessionError::Commit { source })?;
    info!(
        "Persisted {} elements ({} dirty) to {path}",
        tracker.storage().len(),
        tracker.dirty_count()
    );
    Ok(())
}

/// Rebuild a tracker from the last checkpoint written by [`persist_session`].
///
/// Elements keep their saved state and version. The undo history starts
/// empty.
pub fn restore_session(path: &Utf8Path) -> Result<DirtyTracker, RestoreSessionError> {
    if !matches!(fs::file_is_file(path), Ok(true)) {
        return Err(RestoreSessionError::MissingDatabase {
            path: path.to_path_buf(),
        });
    }
    let connection =
        Connection::open_with_flags(path.as_std_path(), OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|source| RestoreSessionError::Open {
                path: path.to_path_buf(),
                source,
            })?;

    let elements = read_rows(&connection, Table::Elements)?;
    let bases = read_rows(&connection, Table::Bases)?;
    let tracker = DirtyTracker::restore(elements, bases)
        .map_err(|source| RestoreSessionError::Restore { source })?;
    info!(
        "Restored {} elements ({} dirty) from {path}",
        tracker.storage().len(),
        tracker.dirty_count()
    );
    Ok(tracker)
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Elements,
    Bases,
}

impl Table {
    const fn insert(self) -> &'static str {
        match self {
            Self::Elements => {
                "INSERT INTO elements (kind, id, version, state, body) VALUES (?1, ?2, ?3, ?4, ?5)"
            }
            Self::Bases => {
                "INSERT INTO bases (kind, id, version, state, body) VALUES (?1, ?2, ?3, ?4, ?5)"
            }
        }
    }

    const fn select(self) -> &'static str {
        match self {
            Self::Elements => "SELECT kind, id, body FROM elements ORDER BY kind, id",
            Self::Bases => "SELECT kind, id, body FROM bases ORDER BY kind, id",
        }
    }
}

fn create_schema(transaction: &Transaction<'_>) -> Result<(), PersistSessionError> {
    transaction
        .execute_batch(
            "CREATE TABLE IF NOT EXISTS elements (
                kind TEXT NOT NULL,
                id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (kind, id)
            );
            CREATE TABLE IF NOT EXISTS bases (
                kind TEXT NOT NULL,
                id INTEGER NOT NULL,
                version INTEGER NOT NULL,
                state TEXT NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (kind, id),
                FOREIGN KEY (kind, id) REFERENCES elements (kind, id) ON DELETE CASCADE
            );",
        )
        .map_err(|source| PersistSessionError::CreateSchema { source })
}

fn clear_rows(transaction: &Transaction<'_>) -> Result<(), PersistSessionError> {
    transaction
        .execute_batch("DELETE FROM bases; DELETE FROM elements;")
        .map_err(|source| PersistSessionError::ClearRows { source })
}

fn persist_rows<'a, I>(
    transaction: &Transaction<'_>,
    table: Table,
    elements: I,
) -> Result<(), PersistSessionError>
where
    I: IntoIterator<Item = &'a Element>,
{
    let mut statement = transaction
        .prepare(table.insert())
        .map_err(|source| PersistSessionError::PrepareInsert { source })?;

    for element in elements {
        let key = element.key();
        let version = i64::try_from(element.version).map_err(|_| {
            PersistSessionError::VersionOutOfRange {
                key,
                version: element.version,
            }
        })?;
        let body = serde_json::to_string(element)
            .map_err(|source| PersistSessionError::SerializeElement { key, source })?;
        statement
            .execute((
                key.kind.as_str(),
                key.id.raw(),
                version,
                element.state.as_str(),
                body,
            ))
            .map_err(|source| PersistSessionError::PersistRow { key, source })?;
    }

    Ok(())
}

fn read_rows(connection: &Connection, table: Table) -> Result<Vec<Element>, RestoreSessionError> {
    let mut statement = connection
        .prepare(table.select())
        .map_err(|source| RestoreSessionError::Query { source })?;
    let rows = statement
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|source| RestoreSessionError::Query { source })?;

    let mut elements = Vec::new();
    for row in rows {
        let (kind, id, body) = row.map_err(|source| RestoreSessionError::Query { source })?;
        let element = serde_json::from_str(&body)
            .map_err(|source| RestoreSessionError::DecodeElement { kind, id, source })?;
        elements.push(element);
    }
    Ok(elements)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;
    use mapsync_core::test_support::{id, node, tracker_with, way};
    use mapsync_core::{EditState, Tags};
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    #[fixture]
    fn temp_dir() -> TempDir {
        TempDir::new().expect("create temp dir")
    }

    #[fixture]
    fn edited() -> DirtyTracker {
        let mut tracker = tracker_with([node(1, 1), node(2, 1), node(3, 4), way(10, 2, &[1, 2])]);
        tracker
            .set_tags(
                ElementRef::way(id(10)),
                Tags::from([("highway".into(), "track".into())]),
            )
            .expect("modify way");
        tracker
            .mark_deleted(ElementRef::node(id(3)))
            .expect("delete node");
        tracker
            .create_node(Coord { x: 4.0, y: 5.0 }, Tags::new())
            .expect("create node");
        tracker
    }

    fn db_path(dir: &TempDir, relative: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().join(relative)).expect("utf-8 path")
    }

    #[rstest]
    fn restores_saved_session(temp_dir: TempDir, edited: DirtyTracker) {
        let path = db_path(&temp_dir, "session.db");
        persist_session(&path, &edited).expect("persist session");

        let restored = restore_session(&path).expect("restore session");
        let saved: Vec<_> = edited.storage().iter().cloned().collect();
        let loaded: Vec<_> = restored.storage().iter().cloned().collect();
        assert_eq!(loaded, saved);
        assert_eq!(restored.pending_upload(), edited.pending_upload());
        assert_eq!(
            restored.base(ElementRef::way(id(10))),
            edited.base(ElementRef::way(id(10)))
        );
        assert!(!restored.undo_log().can_undo());
    }

    #[rstest]
    fn restored_allocator_skips_saved_local_ids(temp_dir: TempDir, edited: DirtyTracker) {
        let path = db_path(&temp_dir, "session.db");
        persist_session(&path, &edited).expect("persist session");

        let mut restored = restore_session(&path).expect("restore session");
        let created = restored
            .create_node(Coord { x: 0.0, y: 0.0 }, Tags::new())
            .expect("create node");
        assert_eq!(created.id, id(-2));
    }

    #[rstest]
    fn checkpoints_replace_previous_rows(temp_dir: TempDir, edited: DirtyTracker) {
        let path = db_path(&temp_dir, "session.db");
        persist_session(&path, &edited).expect("first checkpoint");
        persist_session(&path, &tracker_with([node(7, 1)])).expect("second checkpoint");

        let conn = Connection::open(path.as_std_path()).expect("open database");
        let rows: (i64, i64) = conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM elements), (SELECT COUNT(*) FROM bases)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .expect("count rows");
        assert_eq!(rows, (1, 0));
        let state: String = conn
            .query_row("SELECT state FROM elements WHERE id = 7", [], |row| row.get(0))
            .expect("read state");
        assert_eq!(state, EditState::Unchanged.as_str());
    }

    #[rstest]
    fn creates_parent_directory(temp_dir: TempDir) {
        let nested = db_path(&temp_dir, "nested/session.db");
        persist_session(&nested, &DirtyTracker::new()).expect("persist into nested path");
        assert!(nested.exists(), "database should be created at nested path");
    }

    #[rstest]
    fn restoring_missing_database_fails(temp_dir: TempDir) {
        let path = db_path(&temp_dir, "absent.db");
        let err = restore_session(&path).expect_err("missing database");
        assert!(matches!(err, RestoreSessionError::MissingDatabase { .. }));
        assert!(!path.exists(), "restore must not create a database");
    }

    #[rstest]
    fn corrupt_bodies_are_reported(temp_dir: TempDir) {
        let path = db_path(&temp_dir, "session.db");
        persist_session(&path, &tracker_with([node(1, 1)])).expect("persist session");
        let conn = Connection::open(path.as_std_path()).expect("open database");
        conn.execute("UPDATE elements SET body = '{}'", [])
            .expect("corrupt body");

        let err = restore_session(&path).expect_err("corrupt body");
        match err {
            RestoreSessionError::DecodeElement { kind, id, .. } => {
                assert_eq!((kind.as_str(), id), ("node", 1));
            }
            other => panic!("expected decode error, got {other:?}"),
        }
    }
}
