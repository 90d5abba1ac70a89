pub mod analyzer;
pub mod backoff;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod enrich;
pub mod export;
pub mod feed;
pub mod keywords;
pub mod logging;
pub mod merge;
pub mod metrics;
pub mod models;
pub mod network;
pub mod orchestration;
pub mod parser;
pub mod rank_store;
pub mod source;
pub mod state;
pub mod table_writer;

// Re-export main types for library usage
pub use analyzer::{ChangeAnalyzer, ChangeKind, ChangeReport, RankChange};
pub use checkpoint::{CheckpointManager, SnapshotState};
pub use config::{Config, PipelineConfig, SourceConfig};
pub use merge::{merge, MergeOutcome};
pub use models::{Rank, RankEntry, SnapshotRef, UNRANKED};
pub use network::{FetchError, HttpClient};
pub use parser::{parse_snapshot, ParsedSnapshot};
pub use rank_store::{DomainRecord, RankStore};
pub use state::{RankBackend, RedbBackend, StoreError};
