//! Durable ingestion progress.
//!
//! The checkpoint is a small pretty-printed JSON file, rewritten temp-then-rename
//! after every committed chunk. An unreadable checkpoint is never silently
//! replaced: callers get [`CheckpointError::Corrupt`] and must rebuild it
//! explicitly from the store's committed dates.

use crate::models::SnapshotRef;
use crate::table_writer::write_atomic;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checkpoint {path} is unreadable ({reason}); rerun with --rebuild-checkpoint to reconstruct it from the store")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Pending,
    InProgress,
    Committed,
    CommittedWithFailure,
}

impl SnapshotState {
    pub fn is_settled(self) -> bool {
        matches!(self, SnapshotState::Committed | SnapshotState::CommittedWithFailure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkState {
    ChunkPending,
    ChunkCommitted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub date: NaiveDate,
    pub state: SnapshotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
}

impl SnapshotEntry {
    fn pending(date: NaiveDate) -> Self {
        Self {
            date,
            state: SnapshotState::Pending,
            error: None,
            failures: 0,
            settled_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub snapshots: BTreeMap<String, SnapshotEntry>,
    #[serde(default)]
    pub chunks: BTreeMap<usize, ChunkState>,
    pub last_committed_chunk: Option<usize>,
    pub last_committed_date: Option<NaiveDate>,
    pub total_domains_updated: u64,
    pub updated_at: DateTime<Utc>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            snapshots: BTreeMap::new(),
            chunks: BTreeMap::new(),
            last_committed_chunk: None,
            last_committed_date: None,
            total_domains_updated: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Result of one snapshot within a chunk, applied when the chunk commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedResult {
    Merged,
    PermanentFailure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedSnapshot {
    pub id: String,
    pub date: NaiveDate,
    pub result: StagedResult,
}

pub struct CheckpointManager {
    path: PathBuf,
    checkpoint: Checkpoint,
}

impl CheckpointManager {
    /// Read the checkpoint at `path`, or start fresh if there is none.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let checkpoint = match std::fs::read(&path) {
            Ok(bytes) => Self::decode(&path, &bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Checkpoint::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, checkpoint })
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<Checkpoint, CheckpointError> {
        let checkpoint: Checkpoint =
            serde_json::from_slice(bytes).map_err(|e| CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        if checkpoint.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Corrupt {
                path: path.to_path_buf(),
                reason: format!("unsupported version {}", checkpoint.version),
            });
        }
        Ok(checkpoint)
    }

    /// Reconstruct progress from the dates the store has committed.
    ///
    /// A queued snapshot counts as committed only when its date is committed
    /// and no other queued snapshot shares that date. Everything else starts
    /// pending and is merged again. Any existing file is kept as `<name>.corrupt`.
    pub fn rebuild<P: AsRef<Path>>(
        path: P,
        committed_dates: &BTreeSet<NaiveDate>,
        queue: &[SnapshotRef],
    ) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            let mut backup = path.clone().into_os_string();
            backup.push(".corrupt");
            std::fs::rename(&path, &backup)?;
            tracing::warn!("moved unreadable checkpoint to {}", PathBuf::from(backup).display());
        }

        let mut per_date: HashMap<NaiveDate, usize> = HashMap::new();
        for snapshot in queue {
            *per_date.entry(snapshot.date).or_default() += 1;
        }

        let mut checkpoint = Checkpoint::default();
        let now = Utc::now();
        for snapshot in queue {
            let mut entry = SnapshotEntry::pending(snapshot.date);
            if committed_dates.contains(&snapshot.date) && per_date.get(&snapshot.date) == Some(&1) {
                entry.state = SnapshotState::Committed;
                entry.settled_at = Some(now);
                checkpoint.last_committed_date = checkpoint.last_committed_date.max(Some(snapshot.date));
            }
            checkpoint.snapshots.insert(snapshot.id.clone(), entry);
        }

        let recovered = checkpoint
            .snapshots
            .values()
            .filter(|entry| entry.state == SnapshotState::Committed)
            .count();
        tracing::warn!(
            recovered,
            queued = queue.len(),
            "rebuilt checkpoint from store catalog"
        );

        let manager = Self { path, checkpoint };
        manager.save()?;
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn state(&self, id: &str) -> SnapshotState {
        self.checkpoint
            .snapshots
            .get(id)
            .map_or(SnapshotState::Pending, |entry| entry.state)
    }

    /// Whether `id` still needs work. Failed snapshots are re-queued only on request.
    pub fn needs_work(&self, id: &str, retry_failed: bool) -> bool {
        match self.state(id) {
            SnapshotState::Committed => false,
            SnapshotState::CommittedWithFailure => retry_failed,
            SnapshotState::Pending | SnapshotState::InProgress => true,
        }
    }

    /// Make sure every queued snapshot has an entry.
    pub fn register(&mut self, queue: &[SnapshotRef]) {
        for snapshot in queue {
            self.checkpoint
                .snapshots
                .entry(snapshot.id.clone())
                .or_insert_with(|| SnapshotEntry::pending(snapshot.date));
        }
    }

    pub fn mark_in_progress(&mut self, snapshot: &SnapshotRef) {
        let entry = self
            .checkpoint
            .snapshots
            .entry(snapshot.id.clone())
            .or_insert_with(|| SnapshotEntry::pending(snapshot.date));
        entry.state = SnapshotState::InProgress;
    }

    /// A transient failure: the snapshot goes back to pending with the error noted.
    pub fn record_transient_failure(&mut self, snapshot: &SnapshotRef, error: &str) {
        let entry = self
            .checkpoint
            .snapshots
            .entry(snapshot.id.clone())
            .or_insert_with(|| SnapshotEntry::pending(snapshot.date));
        entry.state = SnapshotState::Pending;
        entry.error = Some(error.to_string());
        entry.failures += 1;
    }

    /// Put staged snapshots back to pending after a failed flush.
    pub fn revert(&mut self, staged: &[StagedSnapshot], error: &str) {
        for snapshot in staged {
            if let Some(entry) = self.checkpoint.snapshots.get_mut(&snapshot.id) {
                entry.state = SnapshotState::Pending;
                entry.error = Some(error.to_string());
                entry.failures += 1;
            }
        }
    }

    /// Apply a flushed chunk's results and persist the checkpoint.
    pub fn commit_chunk(
        &mut self,
        chunk_index: usize,
        members: &[SnapshotRef],
        staged: &[StagedSnapshot],
        domains_updated: u64,
    ) -> Result<(), CheckpointError> {
        let now = Utc::now();
        for snapshot in staged {
            let entry = self
                .checkpoint
                .snapshots
                .entry(snapshot.id.clone())
                .or_insert_with(|| SnapshotEntry::pending(snapshot.date));
            entry.settled_at = Some(now);
            match &snapshot.result {
                StagedResult::Merged => {
                    entry.state = SnapshotState::Committed;
                    entry.error = None;
                    self.checkpoint.last_committed_date =
                        self.checkpoint.last_committed_date.max(Some(snapshot.date));
                }
                StagedResult::PermanentFailure(reason) => {
                    entry.state = SnapshotState::CommittedWithFailure;
                    entry.error = Some(reason.clone());
                    entry.failures += 1;
                }
            }
        }

        let all_settled = members.iter().all(|member| self.state(&member.id).is_settled());
        let chunk_state = if all_settled {
            ChunkState::ChunkCommitted
        } else {
            ChunkState::ChunkPending
        };
        self.checkpoint.chunks.insert(chunk_index, chunk_state);
        if all_settled {
            self.checkpoint.last_committed_chunk = self.checkpoint.last_committed_chunk.max(Some(chunk_index));
        }
        self.checkpoint.total_domains_updated += domains_updated;
        self.save()
    }

    /// Fold a partial run's settled snapshots into this checkpoint.
    pub fn absorb(&mut self, other: &Checkpoint) {
        for (id, incoming) in &other.snapshots {
            if !incoming.state.is_settled() {
                continue;
            }
            let replace = self
                .checkpoint
                .snapshots
                .get(id)
                .map_or(true, |existing| !existing.state.is_settled()
                    || (existing.state == SnapshotState::CommittedWithFailure
                        && incoming.state == SnapshotState::Committed));
            if replace {
                self.checkpoint.snapshots.insert(id.clone(), incoming.clone());
                if incoming.state == SnapshotState::Committed {
                    self.checkpoint.last_committed_date =
                        self.checkpoint.last_committed_date.max(Some(incoming.date));
                }
            }
        }
        for (chunk, state) in &other.chunks {
            if *state == ChunkState::ChunkCommitted {
                self.checkpoint.chunks.insert(*chunk, *state);
                self.checkpoint.last_committed_chunk = self.checkpoint.last_committed_chunk.max(Some(*chunk));
            }
        }
        self.checkpoint.total_domains_updated += other.total_domains_updated;
    }

    pub fn save(&self) -> Result<(), CheckpointError> {
        let mut checkpoint = self.checkpoint.clone();
        checkpoint.updated_at = Utc::now();
        let json = serde_json::to_vec_pretty(&checkpoint)?;
        write_atomic(&self.path, &json)?;
        Ok(())
    }

    pub fn count(&self, state: SnapshotState) -> usize {
        self.checkpoint
            .snapshots
            .values()
            .filter(|entry| entry.state == state)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn snapshot(d: u32) -> SnapshotRef {
        let date = day(d);
        SnapshotRef::new(date.to_string(), date, format!("/src/{}.csv", date))
    }

    #[test]
    fn test_missing_checkpoint_starts_fresh() {
        let dir = TempDir::new().unwrap();
        let manager = CheckpointManager::open(dir.path().join("cp.json")).unwrap();
        assert!(manager.checkpoint().snapshots.is_empty());
        assert_eq!(manager.state("2024-06-07"), SnapshotState::Pending);
    }

    #[test]
    fn test_commit_chunk_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        let queue = vec![snapshot(7), snapshot(8)];

        let mut manager = CheckpointManager::open(&path).unwrap();
        manager.register(&queue);
        manager.mark_in_progress(&queue[0]);
        manager.mark_in_progress(&queue[1]);
        manager
            .commit_chunk(
                0,
                &queue,
                &[
                    StagedSnapshot { id: queue[0].id.clone(), date: day(7), result: StagedResult::Merged },
                    StagedSnapshot {
                        id: queue[1].id.clone(),
                        date: day(8),
                        result: StagedResult::PermanentFailure("not found".into()),
                    },
                ],
                42,
            )
            .unwrap();

        let reopened = CheckpointManager::open(&path).unwrap();
        let checkpoint = reopened.checkpoint();
        assert_eq!(reopened.state("2024-06-07"), SnapshotState::Committed);
        assert_eq!(reopened.state("2024-06-08"), SnapshotState::CommittedWithFailure);
        assert_eq!(checkpoint.last_committed_chunk, Some(0));
        assert_eq!(checkpoint.last_committed_date, Some(day(7)));
        assert_eq!(checkpoint.total_domains_updated, 42);
        assert_eq!(checkpoint.chunks.get(&0), Some(&ChunkState::ChunkCommitted));

        assert!(!reopened.needs_work("2024-06-08", false));
        assert!(reopened.needs_work("2024-06-08", true));
    }

    #[test]
    fn test_partially_settled_chunk_stays_pending() {
        let dir = TempDir::new().unwrap();
        let queue = vec![snapshot(7), snapshot(8)];
        let mut manager = CheckpointManager::open(dir.path().join("cp.json")).unwrap();
        manager.register(&queue);
        manager.record_transient_failure(&queue[1], "timeout");
        manager
            .commit_chunk(
                3,
                &queue,
                &[StagedSnapshot { id: queue[0].id.clone(), date: day(7), result: StagedResult::Merged }],
                1,
            )
            .unwrap();

        let checkpoint = manager.checkpoint();
        assert_eq!(checkpoint.chunks.get(&3), Some(&ChunkState::ChunkPending));
        assert_eq!(checkpoint.last_committed_chunk, None);
        assert_eq!(manager.state("2024-06-08"), SnapshotState::Pending);
        assert_eq!(checkpoint.snapshots["2024-06-08"].failures, 1);
    }

    #[test]
    fn test_corrupt_checkpoint_is_refused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = CheckpointManager::open(&path).err().unwrap();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
        // The file is left for the operator.
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_rebuild_is_conservative() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        std::fs::write(&path, "garbage").unwrap();

        let mut queue = vec![snapshot(7), snapshot(8), snapshot(9)];
        queue.push(SnapshotRef::new("other-commit", day(8), "/src/other.csv"));
        let committed: BTreeSet<NaiveDate> = [day(7), day(8)].into_iter().collect();

        let manager = CheckpointManager::rebuild(&path, &committed, &queue).unwrap();
        assert_eq!(manager.state("2024-06-07"), SnapshotState::Committed);
        // Two snapshots share 2024-06-08, so neither is assumed committed.
        assert_eq!(manager.state("2024-06-08"), SnapshotState::Pending);
        assert_eq!(manager.state("other-commit"), SnapshotState::Pending);
        assert_eq!(manager.state("2024-06-09"), SnapshotState::Pending);
        assert!(dir.path().join("cp.json.corrupt").exists());

        let reopened = CheckpointManager::open(&path).unwrap();
        assert_eq!(reopened.checkpoint().last_committed_date, Some(day(7)));
    }

    #[test]
    fn test_revert_returns_to_pending() {
        let dir = TempDir::new().unwrap();
        let queue = vec![snapshot(7)];
        let mut manager = CheckpointManager::open(dir.path().join("cp.json")).unwrap();
        manager.mark_in_progress(&queue[0]);
        manager.revert(
            &[StagedSnapshot { id: queue[0].id.clone(), date: day(7), result: StagedResult::Merged }],
            "disk full",
        );
        assert_eq!(manager.state("2024-06-07"), SnapshotState::Pending);
        assert!(!dir.path().join("cp.json").exists());
    }

    #[test]
    fn test_absorb_partial_checkpoint() {
        let mut main = Checkpoint::default();
        main.snapshots.insert("a".into(), SnapshotEntry::pending(day(7)));

        let mut partial = Checkpoint::default();
        let mut done = SnapshotEntry::pending(day(7));
        done.state = SnapshotState::Committed;
        partial.snapshots.insert("a".into(), done);
        partial.chunks.insert(2, ChunkState::ChunkCommitted);
        partial.total_domains_updated = 10;

        let dir = TempDir::new().unwrap();
        let mut manager = CheckpointManager { path: dir.path().join("cp.json"), checkpoint: main };
        manager.absorb(&partial);

        assert_eq!(manager.state("a"), SnapshotState::Committed);
        assert_eq!(manager.checkpoint().last_committed_chunk, Some(2));
        assert_eq!(manager.checkpoint().total_domains_updated, 10);
    }
}
