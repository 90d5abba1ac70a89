// Global configuration constants - single source of truth

use chrono::NaiveDate;
use std::path::{Path, PathBuf};

pub struct Config;

impl Config {
    // Ingestion
    pub const CHUNK_SIZE: usize = 10;
    pub const MAX_LOGGED_PARSE_ISSUES: usize = 20;
    pub const SNAPSHOT_FILE_NAME: &'static str = "top-1m.csv";

    // HTTP/Network config
    pub const USER_AGENT: &'static str = "RankTracker/1.0";
    pub const FETCH_TIMEOUT_SECS: u64 = 60;
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;
    pub const MAX_SNAPSHOT_BYTES: usize = 256 * 1024 * 1024; // 256MB
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const RETRY_BACKOFF_MS: u64 = 500;
    pub const RETRY_BACKOFF_MAX_MS: u64 = 30_000;

    // Reports
    pub const TOP_N: usize = 100;
    pub const TOP_MOVERS: usize = 50;
    pub const BAND_SIZE: usize = 1_000_000;
    pub const WEEKLY_DAYS: i64 = 7;
    pub const MONTHLY_DAYS: i64 = 30;

    // Wide-table export
    pub const SHARD_SIZE: usize = 1_000_000;

    // Enrichment
    pub const ENRICH_CONCURRENCY: usize = 100;
    pub const ENRICH_TIMEOUT_SECS: u64 = 20;
    pub const ENRICH_ATTEMPTS: u32 = 3;
    pub const ENRICH_RETRY_DELAY_MS: u64 = 1_000;
    pub const RDAP_BASE_URL: &'static str = "https://rdap.org/";

    // On-disk layout under the data directory
    pub const STORE_FILE: &'static str = "rank_store.redb";
    pub const CHECKPOINT_FILE: &'static str = "import_checkpoint.json";
    pub const FEED_DIR: &'static str = "new_domains";
    pub const PARTIALS_DIR: &'static str = "partials";
    pub const REPORTS_DIR: &'static str = "reports";
    pub const ENRICH_DIR: &'static str = "borndate_results";
}

/// Where the snapshot queue comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    /// `<root>/YYYY-MM-DD/top-1m.csv` or `<root>/YYYY-MM-DD.csv`.
    Directory(PathBuf),
    /// JSON list of `{id, date, url}` fetched over HTTP.
    Manifest(PathBuf),
}

/// Settings for one ingestion run, built from CLI arguments.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub source: SourceConfig,
    pub chunk_size: usize,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub chunk_id: Option<usize>,
    pub isolated: bool,
    pub retry_failed: bool,
    pub rebuild_checkpoint: bool,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            source: SourceConfig::Directory(PathBuf::from("./historical_extracts")),
            chunk_size: Config::CHUNK_SIZE,
            start_date: None,
            end_date: None,
            chunk_id: None,
            isolated: false,
            retry_failed: false,
            rebuild_checkpoint: false,
            max_attempts: Config::MAX_ATTEMPTS,
            retry_backoff_ms: Config::RETRY_BACKOFF_MS,
            fetch_timeout_secs: Config::FETCH_TIMEOUT_SECS,
            user_agent: Config::USER_AGENT.to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn in_dir(data_dir: impl Into<PathBuf>, source: SourceConfig) -> Self {
        Self {
            data_dir: data_dir.into(),
            source,
            ..Self::default()
        }
    }

    /// Store written by this run. Isolated chunk runs get their own partial store.
    pub fn store_path(&self) -> PathBuf {
        match (self.isolated, self.chunk_id) {
            (true, Some(chunk)) => partial_store_path(&self.data_dir, chunk),
            _ => self.data_dir.join(Config::STORE_FILE),
        }
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        match (self.isolated, self.chunk_id) {
            (true, Some(chunk)) => partial_checkpoint_path(&self.data_dir, chunk),
            _ => self.data_dir.join(Config::CHECKPOINT_FILE),
        }
    }

    /// Partial stores lack other chunks' history, so they publish no feed.
    pub fn feed_dir(&self) -> Option<PathBuf> {
        if self.isolated && self.chunk_id.is_some() {
            None
        } else {
            Some(self.data_dir.join(Config::FEED_DIR))
        }
    }

    pub fn includes(&self, date: NaiveDate) -> bool {
        self.start_date.map_or(true, |start| date >= start)
            && self.end_date.map_or(true, |end| date <= end)
    }
}

/// Settings for change reports.
#[derive(Debug, Clone)]
pub struct ReportConfig {
    pub data_dir: PathBuf,
    pub top_n: usize,
    pub top_movers: usize,
    pub band_size: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            top_n: Config::TOP_N,
            top_movers: Config::TOP_MOVERS,
            band_size: Config::BAND_SIZE,
        }
    }
}

impl ReportConfig {
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(Config::STORE_FILE)
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.data_dir.join(Config::REPORTS_DIR)
    }
}

/// Settings for registration-date lookups.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub data_dir: PathBuf,
    pub concurrency: usize,
    pub timeout_secs: u64,
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub rdap_base_url: String,
    pub user_agent: String,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            concurrency: Config::ENRICH_CONCURRENCY,
            timeout_secs: Config::ENRICH_TIMEOUT_SECS,
            attempts: Config::ENRICH_ATTEMPTS,
            retry_delay_ms: Config::ENRICH_RETRY_DELAY_MS,
            rdap_base_url: Config::RDAP_BASE_URL.to_string(),
            user_agent: Config::USER_AGENT.to_string(),
        }
    }
}

impl EnrichConfig {
    pub fn feed_dir(&self) -> PathBuf {
        self.data_dir.join(Config::FEED_DIR)
    }

    pub fn results_path(&self, date: NaiveDate) -> PathBuf {
        self.data_dir
            .join(Config::ENRICH_DIR)
            .join(format!("{}.csv", date.format("%Y-%m-%d")))
    }
}

pub fn partial_store_path(data_dir: &Path, chunk: usize) -> PathBuf {
    data_dir
        .join(Config::PARTIALS_DIR)
        .join(format!("chunk_{}.redb", chunk))
}

pub fn partial_checkpoint_path(data_dir: &Path, chunk: usize) -> PathBuf {
    data_dir
        .join(Config::PARTIALS_DIR)
        .join(format!("chunk_{}.checkpoint.json", chunk))
}
