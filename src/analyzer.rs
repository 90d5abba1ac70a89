//! Rank changes between two dates of a loaded store. Read-only.

use crate::config::Config;
use crate::models::{Rank, UNRANKED};
use crate::rank_store::RankStore;
use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use thiserror::Error;

/// Sort key for a domain that became ranked. Never used in arithmetic.
pub const NEW_ENTRANT_SENTINEL: i64 = 1_000_000;
/// Sort key for a domain that lost its rank. Never used in arithmetic.
pub const DROPPED_OUT_SENTINEL: i64 = -1_000_000;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AnalyzeError {
    #[error("No snapshot on or before {0}")]
    NoDateOnOrBefore(NaiveDate),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Ranked,
    NewEntrant,
    DroppedOut,
    Unchanged,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Ranked => "RANKED",
            ChangeKind::NewEntrant => "NEW_ENTRANT",
            ChangeKind::DroppedOut => "DROPPED_OUT",
            ChangeKind::Unchanged => "UNCHANGED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankChange {
    pub domain: String,
    pub start_rank: Rank,
    pub end_rank: Rank,
    pub kind: ChangeKind,
    /// `start - end` for ranked rows (positive = improved), `0` for unchanged,
    /// `None` for entrants and dropouts.
    pub rank_change: Option<i64>,
    pub change_percent: Option<f64>,
}

impl RankChange {
    pub fn classify(domain: impl Into<String>, start_rank: Rank, end_rank: Rank) -> Self {
        let (kind, rank_change, change_percent) = match (start_rank, end_rank) {
            (UNRANKED, UNRANKED) => (ChangeKind::Unchanged, Some(0), None),
            (UNRANKED, _) => (ChangeKind::NewEntrant, None, None),
            (_, UNRANKED) => (ChangeKind::DroppedOut, None, None),
            (start, end) => {
                let delta = i64::from(start) - i64::from(end);
                let percent = delta as f64 / f64::from(start) * 100.0;
                (ChangeKind::Ranked, Some(delta), Some(percent))
            }
        };
        Self {
            domain: domain.into(),
            start_rank,
            end_rank,
            kind,
            rank_change,
            change_percent,
        }
    }

    /// Ordering key: the real delta, or a sentinel for entrants and dropouts.
    pub fn sort_key(&self) -> i64 {
        match self.kind {
            ChangeKind::NewEntrant => NEW_ENTRANT_SENTINEL,
            ChangeKind::DroppedOut => DROPPED_OUT_SENTINEL,
            ChangeKind::Ranked | ChangeKind::Unchanged => self.rank_change.unwrap_or(0),
        }
    }
}

/// Largest key first, then domain name.
fn by_key_desc(a: &RankChange, b: &RankChange) -> Ordering {
    b.sort_key()
        .cmp(&a.sort_key())
        .then_with(|| a.domain.cmp(&b.domain))
}

#[derive(Debug, Clone)]
pub struct ChangeReport {
    pub requested_start: NaiveDate,
    pub requested_end: NaiveDate,
    pub start: NaiveDate,
    pub end: NaiveDate,
    /// Every known domain, largest improvement first.
    pub changes: Vec<RankChange>,
    pub top_movers: Vec<RankChange>,
    pub top_risers: Vec<RankChange>,
    pub top_fallers: Vec<RankChange>,
}

impl ChangeReport {
    /// The full change list cut into bands of at most `band_size` rows.
    pub fn bands(&self, band_size: usize) -> std::slice::Chunks<'_, RankChange> {
        self.changes.chunks(band_size.max(1))
    }

    pub fn count(&self, kind: ChangeKind) -> usize {
        self.changes.iter().filter(|change| change.kind == kind).count()
    }
}

pub struct ChangeAnalyzer {
    top_n: usize,
    top_movers: usize,
}

impl Default for ChangeAnalyzer {
    fn default() -> Self {
        Self::new(Config::TOP_N, Config::TOP_MOVERS)
    }
}

impl ChangeAnalyzer {
    pub fn new(top_n: usize, top_movers: usize) -> Self {
        Self { top_n, top_movers }
    }

    /// Compare every known domain between `start` and `end`.
    ///
    /// Dates without a snapshot fall back to the nearest earlier one. A start
    /// after the end is swapped.
    pub fn analyze(
        &self,
        store: &RankStore,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ChangeReport, AnalyzeError> {
        let (start, end) = if start > end {
            tracing::warn!("start {} is after end {}, swapping", start, end);
            (end, start)
        } else {
            (start, end)
        };
        let resolved_start = resolve_date(store.dates(), start)?;
        let resolved_end = resolve_date(store.dates(), end)?;

        let mut changes: Vec<RankChange> = store
            .records()
            .map(|(domain, record)| {
                RankChange::classify(
                    domain.as_str(),
                    record.rank_on(resolved_start),
                    record.rank_on(resolved_end),
                )
            })
            .collect();
        changes.sort_by(by_key_desc);

        let mut top_movers: Vec<RankChange> = changes
            .iter()
            .filter(|change| change.sort_key() != 0)
            .cloned()
            .collect();
        top_movers.sort_by(|a, b| {
            b.sort_key()
                .abs()
                .cmp(&a.sort_key().abs())
                .then_with(|| a.domain.cmp(&b.domain))
        });
        top_movers.truncate(self.top_n);

        let top_risers: Vec<RankChange> = changes
            .iter()
            .filter(|change| change.sort_key() > 0)
            .take(self.top_movers)
            .cloned()
            .collect();

        let mut top_fallers: Vec<RankChange> = changes
            .iter()
            .rev()
            .filter(|change| change.sort_key() < 0)
            .take(self.top_movers)
            .cloned()
            .collect();
        top_fallers.sort_by(|a, b| {
            a.sort_key()
                .cmp(&b.sort_key())
                .then_with(|| a.domain.cmp(&b.domain))
        });

        tracing::info!(
            start = %resolved_start,
            end = %resolved_end,
            domains = changes.len(),
            "computed rank changes"
        );

        Ok(ChangeReport {
            requested_start: start,
            requested_end: end,
            start: resolved_start,
            end: resolved_end,
            changes,
            top_movers,
            top_risers,
            top_fallers,
        })
    }
}

/// `requested` if it has a snapshot, otherwise the nearest earlier date.
pub fn resolve_date(dates: &BTreeSet<NaiveDate>, requested: NaiveDate) -> Result<NaiveDate, AnalyzeError> {
    let resolved = dates
        .range(..=requested)
        .next_back()
        .copied()
        .ok_or(AnalyzeError::NoDateOnOrBefore(requested))?;
    if resolved != requested {
        tracing::info!("no snapshot for {}, using {}", requested, resolved);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::models::RankEntry;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn test_classification_table() {
        let entrant = RankChange::classify("a", 0, 500);
        assert_eq!(entrant.kind, ChangeKind::NewEntrant);
        assert_eq!(entrant.rank_change, None);
        assert_eq!(entrant.sort_key(), NEW_ENTRANT_SENTINEL);

        let dropped = RankChange::classify("b", 500, 0);
        assert_eq!(dropped.kind, ChangeKind::DroppedOut);
        assert_eq!(dropped.sort_key(), DROPPED_OUT_SENTINEL);

        let improved = RankChange::classify("c", 10, 5);
        assert_eq!(improved.kind, ChangeKind::Ranked);
        assert_eq!(improved.rank_change, Some(5));
        assert_eq!(improved.change_percent, Some(50.0));

        let unchanged = RankChange::classify("d", 0, 0);
        assert_eq!(unchanged.kind, ChangeKind::Unchanged);
        assert_eq!(unchanged.rank_change, Some(0));
    }

    #[test]
    fn test_resolve_date_falls_back() {
        let dates: BTreeSet<NaiveDate> = [day(1), day(5)].into_iter().collect();
        assert_eq!(resolve_date(&dates, day(5)), Ok(day(5)));
        assert_eq!(resolve_date(&dates, day(9)), Ok(day(5)));
        assert_eq!(resolve_date(&dates, day(4)), Ok(day(1)));
        let too_early = NaiveDate::from_ymd_opt(2024, 5, 31).unwrap();
        assert_eq!(
            resolve_date(&dates, too_early),
            Err(AnalyzeError::NoDateOnOrBefore(too_early))
        );
    }

    fn sample_store() -> RankStore {
        let mut store = RankStore::new();
        merge(
            &mut store,
            day(1),
            &[
                RankEntry::new(1, "steady.com"),
                RankEntry::new(50, "riser.com"),
                RankEntry::new(3, "faller.com"),
                RankEntry::new(4, "gone.com"),
            ],
        );
        merge(
            &mut store,
            day(8),
            &[
                RankEntry::new(1, "steady.com"),
                RankEntry::new(10, "riser.com"),
                RankEntry::new(30, "faller.com"),
                RankEntry::new(2, "fresh.com"),
            ],
        );
        store
    }

    #[test]
    fn test_analyze_report_lists() {
        let report = ChangeAnalyzer::new(100, 50)
            .analyze(&sample_store(), day(1), day(10))
            .unwrap();

        assert_eq!(report.end, day(8));
        assert_eq!(report.requested_end, day(10));
        assert_eq!(report.changes.len(), 5);

        let order: Vec<&str> = report.changes.iter().map(|c| c.domain.as_str()).collect();
        assert_eq!(
            order,
            vec!["fresh.com", "riser.com", "steady.com", "faller.com", "gone.com"]
        );

        let movers: Vec<&str> = report.top_movers.iter().map(|c| c.domain.as_str()).collect();
        assert_eq!(movers, vec!["fresh.com", "gone.com", "riser.com", "faller.com"]);

        let risers: Vec<&str> = report.top_risers.iter().map(|c| c.domain.as_str()).collect();
        assert_eq!(risers, vec!["fresh.com", "riser.com"]);

        let fallers: Vec<&str> = report.top_fallers.iter().map(|c| c.domain.as_str()).collect();
        assert_eq!(fallers, vec!["gone.com", "faller.com"]);

        assert_eq!(report.count(ChangeKind::Ranked), 3);
        assert_eq!(report.count(ChangeKind::NewEntrant), 1);
        assert_eq!(report.count(ChangeKind::DroppedOut), 1);
    }

    #[test]
    fn test_top_lists_are_truncated() {
        let report = ChangeAnalyzer::new(1, 1)
            .analyze(&sample_store(), day(1), day(8))
            .unwrap();
        assert_eq!(report.top_movers.len(), 1);
        assert_eq!(report.top_risers[0].domain, "fresh.com");
        assert_eq!(report.top_fallers[0].domain, "gone.com");
    }

    #[test]
    fn test_bands_cover_full_list() {
        let report = ChangeAnalyzer::default()
            .analyze(&sample_store(), day(1), day(8))
            .unwrap();
        let bands: Vec<usize> = report.bands(2).map(|band| band.len()).collect();
        assert_eq!(bands, vec![2, 2, 1]);
    }

    #[test]
    fn test_reversed_range_is_swapped() {
        let report = ChangeAnalyzer::default()
            .analyze(&sample_store(), day(8), day(1))
            .unwrap();
        assert_eq!(report.start, day(1));
        assert_eq!(report.end, day(8));
        assert_eq!(report.top_risers[0].domain, "fresh.com");
    }

    #[test]
    fn test_analysis_does_not_mutate_store() {
        let store = sample_store();
        let before = store.clone();
        ChangeAnalyzer::default().analyze(&store, day(1), day(8)).unwrap();
        assert_eq!(store, before);
    }
}
