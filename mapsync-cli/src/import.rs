//! Import command implementation for the mapsync CLI.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use mapsync_core::{DirtyTracker, ReconcileReport, Reconciler};
use mapsync_data::load_snapshot;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_DATABASE, ARG_SNAPSHOT, CliError, ENV_IMPORT_DATABASE, ENV_IMPORT_SNAPSHOT, require,
    require_existing, save_session, write_json,
};

/// CLI arguments for the `import` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "import",
    long_about = "Start a fresh session from a JSON snapshot of server data. \
                 Any session already stored in the database is replaced.",
    about = "Start a session from a snapshot"
)]
#[ortho_config(prefix = "MAPSYNC")]
pub(crate) struct ImportArgs {
    /// Path to the JSON snapshot (`{"elements": [...]}`).
    #[arg(value_name = "path")]
    #[serde(default)]
    pub(crate) snapshot: Option<Utf8PathBuf>,
    /// Path to the session database.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
}

impl ImportArgs {
    pub(crate) fn into_config(self) -> Result<ImportConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ImportConfig::try_from(merged)
    }
}

/// Resolved `import` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportConfig {
    pub(crate) snapshot: Utf8PathBuf,
    pub(crate) database: Utf8PathBuf,
}

impl TryFrom<ImportArgs> for ImportConfig {
    type Error = CliError;

    fn try_from(args: ImportArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            snapshot: require(args.snapshot, ARG_SNAPSHOT, ENV_IMPORT_SNAPSHOT)?,
            database: require(args.database, ARG_DATABASE, ENV_IMPORT_DATABASE)?,
        })
    }
}

pub(crate) fn run_import(
    args: ImportArgs,
    writer: &mut dyn Write,
) -> Result<ReconcileReport, CliError> {
    let config = args.into_config()?;
    require_existing(&config.snapshot, ARG_SNAPSHOT)?;
    let report = import_snapshot(&config)?;
    write_json(writer, &report)?;
    Ok(report)
}

fn import_snapshot(config: &ImportConfig) -> Result<ReconcileReport, CliError> {
    let document = load_snapshot(&config.snapshot)?;
    let mut tracker = DirtyTracker::new();
    let report = Reconciler::new().apply(&mut tracker, &document);
    save_session(&config.database, &tracker)?;
    info!(
        "Imported {} elements from {} into {}",
        tracker.storage().len(),
        config.snapshot,
        config.database
    );
    Ok(report)
}
