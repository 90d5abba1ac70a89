//! Reduction of isolated chunk runs into the main store.

use super::processor::PipelineError;
use crate::checkpoint::CheckpointManager;
use crate::config::{partial_checkpoint_path, Config};
use crate::feed::NewDomainFeed;
use crate::state::{RankBackend, RedbBackend};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergePartialsSummary {
    pub partials: usize,
    pub domains: usize,
    pub dates: usize,
    pub absences_filled: usize,
    pub cells_written: usize,
}

/// `partials/chunk_N.redb` files ordered by chunk number.
pub fn partial_stores(data_dir: &Path) -> Result<Vec<(usize, PathBuf)>, PipelineError> {
    let dir = data_dir.join(Config::PARTIALS_DIR);
    let mut partials = Vec::new();
    if !dir.exists() {
        return Ok(partials);
    }
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let chunk = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix("chunk_"))
            .and_then(|rest| rest.strip_suffix(".redb"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(chunk) = chunk {
            partials.push((chunk, path));
        }
    }
    partials.sort();
    Ok(partials)
}

/// Fold every partial store into the main store, single-threaded.
///
/// Partials are applied in chunk order on top of the main store, so for a
/// date written twice the later chunk's rank stands. First-seen dates take the
/// minimum. Absence cells are then filled so the result matches a sequential
/// run, and the new-domain feed is regenerated for every date.
#[tracing::instrument]
pub fn merge_partials(data_dir: &Path) -> Result<MergePartialsSummary, PipelineError> {
    let partials = partial_stores(data_dir)?;
    let mut summary = MergePartialsSummary {
        partials: partials.len(),
        ..MergePartialsSummary::default()
    };
    if partials.is_empty() {
        tracing::warn!("no partial stores under {}", data_dir.join(Config::PARTIALS_DIR).display());
        return Ok(summary);
    }

    let main = RedbBackend::open(data_dir.join(Config::STORE_FILE))?;
    let mut combined = main.load()?;
    let mut checkpoint = CheckpointManager::open(data_dir.join(Config::CHECKPOINT_FILE))?;

    for (chunk, path) in &partials {
        let partial = RedbBackend::open(path)?.load()?;
        tracing::info!(
            chunk,
            domains = partial.len(),
            dates = partial.dates().len(),
            "absorbing partial store"
        );
        combined.absorb(partial);

        let partial_checkpoint = partial_checkpoint_path(data_dir, *chunk);
        if partial_checkpoint.exists() {
            let progress = CheckpointManager::open(&partial_checkpoint)?;
            checkpoint.absorb(progress.checkpoint());
        } else {
            tracing::warn!("chunk {} has no checkpoint, its snapshots stay pending", chunk);
        }
    }

    summary.absences_filled = combined.fill_absences();
    let stats = main.save(&combined, None)?;
    summary.cells_written = stats.cells_written;
    summary.domains = combined.len();
    summary.dates = combined.dates().len();

    NewDomainFeed::new(data_dir.join(Config::FEED_DIR)).write_dates(&combined, combined.dates())?;
    checkpoint.save()?;

    tracing::info!(
        partials = summary.partials,
        domains = summary.domains,
        dates = summary.dates,
        absences_filled = summary.absences_filled,
        "merged partial stores"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::models::RankEntry;
    use crate::rank_store::RankStore;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn test_partial_stores_sorted_by_chunk() {
        let dir = TempDir::new().unwrap();
        let partials = dir.path().join("partials");
        std::fs::create_dir_all(&partials).unwrap();
        for name in ["chunk_10.redb", "chunk_2.redb", "chunk_2.checkpoint.json", "notes.txt"] {
            std::fs::write(partials.join(name), b"").unwrap();
        }
        let found: Vec<usize> = partial_stores(dir.path())
            .unwrap()
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect();
        assert_eq!(found, vec![2, 10]);
    }

    #[test]
    fn test_merge_partials_fills_absences() {
        let dir = TempDir::new().unwrap();

        let mut first = RankStore::new();
        merge(&mut first, day(7), &[RankEntry::new(1, "a.com"), RankEntry::new(2, "b.com")]);
        let mut second = RankStore::new();
        merge(&mut second, day(8), &[RankEntry::new(1, "b.com"), RankEntry::new(2, "c.com")]);

        RedbBackend::open(dir.path().join("partials/chunk_0.redb"))
            .unwrap()
            .save(&first, None)
            .unwrap();
        RedbBackend::open(dir.path().join("partials/chunk_1.redb"))
            .unwrap()
            .save(&second, None)
            .unwrap();

        let summary = merge_partials(dir.path()).unwrap();
        assert_eq!(summary.partials, 2);
        assert_eq!(summary.domains, 3);
        assert_eq!(summary.absences_filled, 1);

        let mut sequential = RankStore::new();
        merge(&mut sequential, day(7), &[RankEntry::new(1, "a.com"), RankEntry::new(2, "b.com")]);
        merge(&mut sequential, day(8), &[RankEntry::new(1, "b.com"), RankEntry::new(2, "c.com")]);

        let merged = RedbBackend::open(dir.path().join("rank_store.redb"))
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(merged, sequential);

        let feed = NewDomainFeed::new(dir.path().join("new_domains"));
        assert_eq!(feed.read(day(8)).unwrap(), vec!["c.com"]);
    }
}
