//! Error types emitted by the mapsync CLI.
//!
//! Keep this error type reasonably small, as every command helper returns
//! `Result<_, CliError>` and the workspace enables `clippy::result_large_err`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use mapsync_core::TrackerError;
use mapsync_data::{LoadDocumentError, PersistSessionError, RestoreSessionError};
use thiserror::Error;

/// Errors emitted by the mapsync CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        /// Flag name of the option.
        field: &'static str,
        /// Environment variable that can supply it.
        env: &'static str,
    },
    /// A referenced input path does not exist on disk.
    #[error("{field} path {path} does not exist")]
    MissingSourceFile {
        /// Flag name of the option.
        field: &'static str,
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// A referenced input path exists but is not a file.
    #[error("{field} path {path} exists but is not a file")]
    SourcePathNotFile {
        /// Flag name of the option.
        field: &'static str,
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// A referenced input path could not be inspected.
    #[error("failed to inspect {field} path {path}: {source}")]
    InspectSourcePath {
        /// Flag name of the option.
        field: &'static str,
        /// Offending path.
        path: Utf8PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Installing the logger failed.
    #[error("failed to install logger: {0}")]
    InstallLogger(#[source] log::SetLoggerError),
    /// Loading a change file, snapshot or acknowledgement file failed.
    #[error(transparent)]
    LoadDocument(#[from] LoadDocumentError),
    /// Restoring the session database failed.
    #[error("failed to restore session from {path}: {source}")]
    RestoreSession {
        /// Session database path.
        path: Utf8PathBuf,
        /// Error raised while restoring.
        #[source]
        source: RestoreSessionError,
    },
    /// Checkpointing the session database failed.
    #[error("failed to persist session to {path}: {source}")]
    PersistSession {
        /// Session database path.
        path: Utf8PathBuf,
        /// Error raised while persisting.
        #[source]
        source: Box<PersistSessionError>,
    },
    /// An upload acknowledgement did not match the session.
    #[error("failed to apply upload acknowledgement: {source}")]
    Acknowledge {
        /// Error raised by the tracker.
        #[source]
        source: TrackerError,
    },
    /// Serializing command output failed.
    #[error("failed to serialize command output: {0}")]
    SerializeOutput(#[source] serde_json::Error),
    /// Writing command output failed.
    #[error("failed to write command output: {0}")]
    WriteOutput(#[source] std::io::Error),
}
