//! Wires a chunk processor together from a pipeline config.

use super::processor::{ChunkProcessor, PipelineError};
use crate::checkpoint::CheckpointManager;
use crate::config::{PipelineConfig, SourceConfig};
use crate::metrics::PipelineMetrics;
use crate::network::HttpClient;
use crate::source::{DirectorySource, ManifestSource, SnapshotSource};
use crate::state::{RankBackend, RedbBackend};
use std::sync::Arc;

pub fn build_source(config: &PipelineConfig) -> Result<Arc<dyn SnapshotSource>, PipelineError> {
    let source: Arc<dyn SnapshotSource> = match &config.source {
        SourceConfig::Directory(root) => Arc::new(DirectorySource::new(root.clone())),
        SourceConfig::Manifest(path) => {
            let http = HttpClient::new(&config.user_agent, config.fetch_timeout_secs)?;
            Arc::new(ManifestSource::new(path.clone(), http))
        }
    };
    Ok(source)
}

/// Open the store and checkpoint for `config`.
///
/// An unreadable checkpoint is an error unless `rebuild_checkpoint` is set, in
/// which case it is reconstructed from the store's committed dates.
#[tracing::instrument(skip(config), fields(data_dir = %config.data_dir.display()))]
pub async fn build_processor(config: PipelineConfig) -> Result<ChunkProcessor, PipelineError> {
    let source = build_source(&config)?;
    let backend = Arc::new(RedbBackend::open(config.store_path())?);

    let checkpoint = if config.rebuild_checkpoint {
        let queue: Vec<_> = source
            .list()
            .await?
            .into_iter()
            .filter(|snapshot| config.includes(snapshot.date))
            .collect();
        CheckpointManager::rebuild(config.checkpoint_path(), &backend.dates()?, &queue)?
    } else {
        CheckpointManager::open(config.checkpoint_path())?
    };

    match backend.uncommitted_dates() {
        Ok(stale) if !stale.is_empty() => {
            tracing::warn!("{} dates were registered by an unfinished save and are ignored", stale.len());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("could not read unfinished date registrations: {}", e),
    }

    Ok(ChunkProcessor::new(
        backend,
        source,
        checkpoint,
        config,
        PipelineMetrics::shared(),
    ))
}
