use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// 1-based popularity position. Smaller is more popular.
pub type Rank = u32;

/// Cell value for a known domain that was not ranked on a merged date.
pub const UNRANKED: Rank = 0;

/// One validated (rank, domain) pair from a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankEntry {
    pub rank: Rank,
    pub domain: String,
}

impl RankEntry {
    pub fn new(rank: Rank, domain: impl Into<String>) -> Self {
        Self {
            rank,
            domain: domain.into(),
        }
    }
}

/// A queued snapshot: where to fetch it and which date it describes.
///
/// `id` is the date string for directory sources or a content-addressed
/// commit id for remote manifests. Two ids may share one date.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SnapshotRef {
    pub id: String,
    pub date: NaiveDate,
    #[serde(alias = "url", alias = "path")]
    pub location: String,
}

impl SnapshotRef {
    pub fn new(id: impl Into<String>, date: NaiveDate, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date,
            location: location.into(),
        }
    }
}

/// Day number used as the storage key for a calendar date.
pub fn day_number(date: NaiveDate) -> i32 {
    date.num_days_from_ce()
}

pub fn date_from_day(day: i32) -> Option<NaiveDate> {
    NaiveDate::from_num_days_from_ce_opt(day)
}

/// Parse `YYYY-MM-DD`, the only date format used in file names and CSV headers.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}
