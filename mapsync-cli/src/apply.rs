//! Apply command implementation for the mapsync CLI.

use std::io::Write;

use camino::Utf8PathBuf;
use clap::Parser;
use log::warn;
use mapsync_core::{MergeStrategy, ReconcileReport, Reconciler};
use mapsync_data::load_change_document;
use ortho_config::{OrthoConfig, SubcmdConfigMerge};
use serde::{Deserialize, Serialize};

use crate::{
    ARG_CHANGE, ARG_DATABASE, ARG_MERGE_STRATEGY, CliError, ENV_APPLY_CHANGE, ENV_APPLY_DATABASE,
    open_session, require, require_existing, save_session, write_json,
};

/// CLI arguments for the `apply` subcommand.
#[derive(Debug, Clone, Parser, Deserialize, Serialize, OrthoConfig, Default)]
#[command(
    name = "apply",
    long_about = "Merge a JSON change file into the session and checkpoint \
                 the result. Conflicts and rejected entries are reported \
                 as JSON on stdout and leave the affected elements as they \
                 were.",
    about = "Merge a change file into the session"
)]
#[ortho_config(prefix = "MAPSYNC")]
pub(crate) struct ApplyArgs {
    /// Path to the JSON change file (`{"changes": [...]}`).
    #[arg(long = ARG_CHANGE, value_name = "path")]
    #[serde(default)]
    pub(crate) change: Option<Utf8PathBuf>,
    /// Path to the session database.
    #[arg(long = ARG_DATABASE, value_name = "path")]
    #[serde(default)]
    pub(crate) database: Option<Utf8PathBuf>,
    /// Policy for remote edits of locally modified elements
    /// (`three-way`, `conflict-on-divergence` or `prefer-local`).
    #[arg(long = ARG_MERGE_STRATEGY, value_name = "strategy")]
    #[serde(default)]
    pub(crate) merge_strategy: Option<MergeStrategy>,
}

impl ApplyArgs {
    pub(crate) fn into_config(self) -> Result<ApplyConfig, CliError> {
        let merged = self.load_and_merge().map_err(CliError::Configuration)?;
        ApplyConfig::try_from(merged)
    }
}

/// Resolved `apply` command configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ApplyConfig {
    pub(crate) change: Utf8PathBuf,
    pub(crate) database: Utf8PathBuf,
    pub(crate) merge_strategy: MergeStrategy,
}

impl ApplyConfig {
    pub(crate) fn validate_sources(&self) -> Result<(), CliError> {
        require_existing(&self.change, ARG_CHANGE)?;
        require_existing(&self.database, ARG_DATABASE)?;
        Ok(())
    }
}

impl TryFrom<ApplyArgs> for ApplyConfig {
    type Error = CliError;

    fn try_from(args: ApplyArgs) -> Result<Self, Self::Error> {
        Ok(Self {
            change: require(args.change, ARG_CHANGE, ENV_APPLY_CHANGE)?,
            database: require(args.database, ARG_DATABASE, ENV_APPLY_DATABASE)?,
            merge_strategy: args.merge_strategy.unwrap_or_default(),
        })
    }
}

pub(crate) fn run_apply(
    args: ApplyArgs,
    writer: &mut dyn Write,
) -> Result<ReconcileReport, CliError> {
    let config = args.into_config()?;
    config.validate_sources()?;
    let report = apply_change(&config)?;
    write_json(writer, &report)?;
    Ok(report)
}

fn apply_change(config: &ApplyConfig) -> Result<ReconcileReport, CliError> {
    let document = load_change_document(&config.change)?;
    let mut tracker = open_session(&config.database)?;
    let report = Reconciler::new()
        .with_strategy(config.merge_strategy)
        .apply(&mut tracker, &document);
    if !report.is_clean() {
        warn!(
            "{} left {} conflicts and {} rejected entries",
            config.change,
            report.conflicts.len(),
            report.errors.len()
        );
    }
    save_session(&config.database, &tracker)?;
    Ok(report)
}

#[cfg(test)]
pub(crate) fn config_from_layers_for_test(
    layers: Vec<ortho_config::MergeLayer<'static>>,
) -> Result<ApplyConfig, CliError> {
    let merged = ApplyArgs::merge_from_layers(layers).map_err(CliError::from)?;
    ApplyConfig::try_from(merged)
}
