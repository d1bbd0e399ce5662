//! Upload bookkeeping commands: `pending` and `ack`.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use log::info;
use mapsync_data::{load_acks, render_pending};
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_ACKS, ARG_DATABASE, ARG_FINISH, CliError, ENV_ACK_ACKS, ENV_ACK_DATABASE,
    ENV_PENDING_DATABASE, open_session, require, require_existing, save_session, write_json,
    write_text,
};

/// CLI arguments for the `pending` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "pending",
    long_about = "Print every locally created, modified or deleted element \
                 as a JSON change file, ordered so that referenced elements \
                 precede the elements that use them.",
    about = "Print the pending upload"
)]
#[ortho_config(prefix = "MAPSYNC")]
pub(crate) struct PendingArgs {
    /// Path to the session database.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
}

impl PendingArgs {
    pub(crate) fn into_config(self) -> Result<PendingConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        PendingConfig::try_from(merged)
    }
}

/// Resolved `pending` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PendingConfig {
    pub(crate) database: Utf8PathBuf,
}

impl TryFrom<PendingArgs> for PendingConfig {
    type Error = CliError;

    fn try_from(args: PendingArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            database: require(args.database, ARG_DATABASE, ENV_PENDING_DATABASE)?,
        })
    }
}

/// CLI arguments for the `ack` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "ack",
    long_about = "Record the elements the server accepted: local ids are \
                 replaced by server ids, versions are updated and \
                 acknowledged deletions are purged. Elements without an \
                 acknowledgement stay pending unless --finish is given.",
    about = "Record an upload acknowledgement"
)]
#[ortho_config(prefix = "MAPSYNC")]
pub(crate) struct AckArgs {
    /// Path to the JSON acknowledgement file (`{"acks": [...]}`).
    #[arg(value_name = "path")]
    #[serde(default)]
    pub(crate) acks: Option<Utf8PathBuf>,
    /// Path to the session database.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Close the upload: clear every remaining modification and deletion.
    /// Unacknowledged creations keep their local ids.
    #[arg(long = ARG_FINISH)]
    #[serde(default)]
    pub(crate) finish: bool,
}

impl AckArgs {
    pub(crate) fn into_config(self) -> Result<AckConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        AckConfig::try_from(merged)
    }
}

/// Resolved `ack` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckConfig {
    pub(crate) acks: Utf8PathBuf,
    pub(crate) database: Utf8PathBuf,
    pub(crate) finish: bool,
}

impl TryFrom<AckArgs> for AckConfig {
    type Error = CliError;

    fn try_from(args: AckArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            acks: require(args.acks, ARG_ACKS, ENV_ACK_ACKS)?,
            database: require(args.database, ARG_DATABASE, ENV_ACK_DATABASE)?,
            finish: args.finish,
        })
    }
}

/// Counts printed by the `ack` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AckSummary {
    /// Acknowledgements applied.
    pub(crate) acknowledged: usize,
    /// Elements still waiting for upload.
    pub(crate) pending: usize,
}

pub(crate) fn run_pending(args: PendingArgs, writer: &mut dyn Write) -> Result<(), CliError> {
    let config = args.into_config()?;
    require_existing(&config.database, ARG_DATABASE)?;
    let tracker = open_session(&config.database)?;
    let payload = render_pending(&tracker).map_err(CliError::SerializeOutput)?;
    write_text(writer, &payload)
}

pub(crate) fn run_ack(args: AckArgs, writer: &mut dyn Write) -> Result<AckSummary, CliError> {
    let config = args.into_config()?;
    require_existing(&config.acks, ARG_ACKS)?;
    require_existing(&config.database, ARG_DATABASE)?;

    let acks = load_acks(&config.acks)?;
    let mut tracker = open_session(&config.database)?;
    if config.finish {
        let cleared = tracker
            .reset_dirty_state(&acks)
            .map_err(|source| CliError::Acknowledge { source })?;
        info!("Upload finished; {cleared} elements cleared");
    } else {
        for ack in &acks {
            tracker
                .apply_upload_ack(*ack)
                .map_err(|source| CliError::Acknowledge { source })?;
        }
    }
    save_session(&config.database, &tracker)?;

    let summary = AckSummary {
        acknowledged: acks.len(),
        pending: tracker.dirty_count(),
    };
    info!(
        "Acknowledged {} elements; {} still pending",
        summary.acknowledged, summary.pending
    );
    write_json(writer, &summary)?;
    Ok(summary)
}
