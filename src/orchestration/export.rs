//! Wide-table export and import commands.

use super::processor::PipelineError;
use crate::config::Config;
use crate::export::{export_wide_tables, import_wide_tables, WideExportStats};
use crate::feed::NewDomainFeed;
use crate::state::{RankBackend, RedbBackend, SaveStats};
use std::path::Path;

/// Write the store under `data_dir` as wide CSV shards into `out_dir`.
#[tracing::instrument]
pub fn run_export(data_dir: &Path, out_dir: &Path, shard_size: usize) -> Result<WideExportStats, PipelineError> {
    let store = RedbBackend::open(data_dir.join(Config::STORE_FILE))?.load()?;
    Ok(export_wide_tables(&store, out_dir, shard_size)?)
}

/// Load wide CSV shards from `in_dir` into the store under `data_dir`.
///
/// Imported cells overwrite stored ones for the same date. The new-domain
/// feed is rewritten for every imported date.
#[tracing::instrument]
pub fn run_import(data_dir: &Path, in_dir: &Path) -> Result<SaveStats, PipelineError> {
    let mut imported = import_wide_tables(in_dir)?;
    let backend = RedbBackend::open(data_dir.join(Config::STORE_FILE))?;

    let mut combined = backend.load()?;
    let dates = imported.dates().clone();
    imported.fill_absences();
    combined.absorb(imported);
    combined.fill_absences();

    let stats = backend.save(&combined, None)?;
    NewDomainFeed::new(data_dir.join(Config::FEED_DIR)).write_dates(&combined, &dates)?;
    tracing::info!(
        domains = combined.len(),
        cells = stats.cells_written,
        "imported {} dates",
        dates.len()
    );
    Ok(stats)
}
