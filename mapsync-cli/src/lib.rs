//! Command-line interface for offline map editing sessions.
//!
//! Every command works on a session database written by `mapsync-data`:
//! `import` seeds it from a snapshot, `apply` merges a change file into it,
//! `pending` prints the upload it owes the server and `ack` records what the
//! server accepted.
#![forbid(unsafe_code)]

use std::io::{self, Write};

use camino::Utf8Path;
use clap::{Parser, Subcommand};
use log::LevelFilter;
use mapsync_core::DirtyTracker;
use mapsync_data::{persist_session, restore_session};
use serde::Serialize;
use structured_logger::{Builder, json::new_writer};

mod apply;
mod error;
mod import;
mod upload;

pub use error::CliError;

use apply::{ApplyArgs, run_apply};
use import::{ImportArgs, run_import};
use upload::{AckArgs, PendingArgs, run_ack, run_pending};

const ARG_DATABASE: &str = "database";
const ARG_SNAPSHOT: &str = "snapshot";
const ARG_CHANGE: &str = "change";
const ARG_MERGE_STRATEGY: &str = "merge-strategy";
const ARG_ACKS: &str = "acks";
const ARG_FINISH: &str = "finish";
const ENV_IMPORT_SNAPSHOT: &str = "MAPSYNC_CMDS_IMPORT_SNAPSHOT";
const ENV_IMPORT_DATABASE: &str = "MAPSYNC_CMDS_IMPORT_DATABASE";
const ENV_APPLY_CHANGE: &str = "MAPSYNC_CMDS_APPLY_CHANGE";
const ENV_APPLY_DATABASE: &str = "MAPSYNC_CMDS_APPLY_DATABASE";
const ENV_PENDING_DATABASE: &str = "MAPSYNC_CMDS_PENDING_DATABASE";
const ENV_ACK_ACKS: &str = "MAPSYNC_CMDS_ACK_ACKS";
const ENV_ACK_DATABASE: &str = "MAPSYNC_CMDS_ACK_DATABASE";

/// Run the mapsync CLI with the current process arguments and environment.
pub fn run() -> Result<(), CliError> {
    let cli = Cli::try_parse().map_err(CliError::ArgumentParsing)?;
    install_logger(cli.log_level)?;
    let mut stdout = io::stdout().lock();
    dispatch(cli.command, &mut stdout)
}

fn dispatch(command: Command, writer: &mut dyn Write) -> Result<(), CliError> {
    match command {
        Command::Import(args) => run_import(args, writer).map(drop),
        Command::Apply(args) => run_apply(args, writer).map(drop),
        Command::Pending(args) => run_pending(args, writer),
        Command::Ack(args) => run_ack(args, writer).map(drop),
    }
}

fn install_logger(level: LevelFilter) -> Result<(), CliError> {
    Builder::with_level(level.as_str())
        .with_target_writer("*", new_writer(io::stderr()))
        .try_init()
        .map_err(CliError::InstallLogger)
}

#[derive(Debug, Parser)]
#[command(
    name = "mapsync",
    about = "Reconcile offline map edits with server change files",
    version
)]
struct Cli {
    /// Maximum level of the JSON log lines written to stderr.
    #[arg(
        long = "log-level",
        global = true,
        value_name = "level",
        env = "MAPSYNC_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: LevelFilter,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session from a snapshot of server data.
    Import(ImportArgs),
    /// Merge a change file into the session.
    Apply(ApplyArgs),
    /// Print the pending upload as a change file.
    Pending(PendingArgs),
    /// Record the server's acknowledgement of an upload.
    Ack(AckArgs),
}

fn require<T>(value: Option<T>, field: &'static str, env: &'static str) -> Result<T, CliError> {
    value.ok_or(CliError::MissingArgument { field, env })
}

fn require_existing(path: &Utf8Path, field: &'static str) -> Result<(), CliError> {
    match mapsync_data::fs::file_is_file(path) {
        Ok(true) => Ok(()),
        Ok(false) => Err(CliError::SourcePathNotFile {
            field,
            path: path.to_path_buf(),
        }),
        Err(source) if source.kind() == io::ErrorKind::NotFound => {
            Err(CliError::MissingSourceFile {
                field,
                path: path.to_path_buf(),
            })
        }
        Err(source) => Err(CliError::InspectSourcePath {
            field,
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn open_session(database: &Utf8Path) -> Result<DirtyTracker, CliError> {
    restore_session(database).map_err(|source| CliError::RestoreSession {
        path: database.to_path_buf(),
        source,
    })
}

fn save_session(database: &Utf8Path, tracker: &DirtyTracker) -> Result<(), CliError> {
    persist_session(database, tracker).map_err(|source| CliError::PersistSession {
        path: database.to_path_buf(),
        source: Box::new(source),
    })
}

fn write_json<T: Serialize>(writer: &mut dyn Write, value: &T) -> Result<(), CliError> {
    let payload = serde_json::to_string_pretty(value).map_err(CliError::SerializeOutput)?;
    write_text(writer, &payload)
}

fn write_text(writer: &mut dyn Write, payload: &str) -> Result<(), CliError> {
    writer
        .write_all(payload.as_bytes())
        .map_err(CliError::WriteOutput)?;
    writer.write_all(b"\n").map_err(CliError::WriteOutput)?;
    Ok(())
}

#[cfg(test)]
mod tests;
