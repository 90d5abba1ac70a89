//! Where snapshots come from: a local extract directory or an HTTP manifest.

use crate::config::Config;
use crate::models::{parse_date, SnapshotRef};
use crate::network::{FetchError, HttpClient};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Every snapshot this source knows about, ordered by date then id.
    async fn list(&self) -> Result<Vec<SnapshotRef>, FetchError>;

    /// Raw bytes of one snapshot. A single attempt; retries live in the caller.
    async fn fetch(&self, snapshot: &SnapshotRef) -> Result<Vec<u8>, FetchError>;
}

/// Reads `<root>/YYYY-MM-DD/top-1m.csv` or `<root>/YYYY-MM-DD.csv`.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, entry: &Path) -> Option<SnapshotRef> {
        let name = entry.file_name()?.to_str()?;
        if entry.is_dir() {
            let date = parse_date(name)?;
            let file = entry.join(Config::SNAPSHOT_FILE_NAME);
            return Some(SnapshotRef::new(name, date, file.to_string_lossy()));
        }
        let stem = name.strip_suffix(".csv")?;
        let date = parse_date(stem)?;
        Some(SnapshotRef::new(stem, date, entry.to_string_lossy()))
    }
}

#[async_trait]
impl SnapshotSource for DirectorySource {
    async fn list(&self) -> Result<Vec<SnapshotRef>, FetchError> {
        let mut snapshots = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            match self.resolve(&entry.path()) {
                Some(snapshot) => snapshots.push(snapshot),
                None => tracing::debug!("ignoring {}", entry.path().display()),
            }
        }
        sort_queue(&mut snapshots);
        Ok(snapshots)
    }

    async fn fetch(&self, snapshot: &SnapshotRef) -> Result<Vec<u8>, FetchError> {
        Ok(tokio::fs::read(&snapshot.location).await?)
    }
}

/// Queue described by a JSON manifest (`[{"id", "date", "url"}]`), fetched over HTTP.
pub struct ManifestSource {
    manifest: PathBuf,
    http: HttpClient,
}

impl ManifestSource {
    pub fn new(manifest: impl Into<PathBuf>, http: HttpClient) -> Self {
        Self {
            manifest: manifest.into(),
            http,
        }
    }
}

#[async_trait]
impl SnapshotSource for ManifestSource {
    async fn list(&self) -> Result<Vec<SnapshotRef>, FetchError> {
        let raw = tokio::fs::read(&self.manifest).await?;
        let mut snapshots: Vec<SnapshotRef> = serde_json::from_slice(&raw)
            .map_err(|e| FetchError::Manifest(format!("{}: {}", self.manifest.display(), e)))?;
        for snapshot in &snapshots {
            url::Url::parse(&snapshot.location)
                .map_err(|e| FetchError::Manifest(format!("{}: {}", snapshot.id, e)))?;
        }
        sort_queue(&mut snapshots);
        Ok(snapshots)
    }

    async fn fetch(&self, snapshot: &SnapshotRef) -> Result<Vec<u8>, FetchError> {
        self.http.fetch_bytes(&snapshot.location).await
    }
}

fn sort_queue(snapshots: &mut [SnapshotRef]) {
    snapshots.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));
}
