//! Folds one dated snapshot into a [`RankStore`].

use crate::models::{RankEntry, UNRANKED};
use crate::rank_store::{DomainRecord, RankStore};
use chrono::NaiveDate;
use std::collections::HashSet;
use std::ops::Bound::{Excluded, Unbounded};

/// What a single merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Cells written: ranked domains plus absence cells added.
    pub domains_updated: usize,
    /// Domains created by this merge.
    pub new_domains: Vec<String>,
    /// Domains whose first-seen moved earlier, with the date it moved from.
    pub lowered: Vec<(String, NaiveDate)>,
}

/// Merge `entries` for `date` into `store`.
///
/// Re-applying the same `(date, entries)` leaves the store unchanged, and
/// merging several dates gives the same store whatever order they arrive in.
/// Entries for an already-merged date overwrite the ranks they carry; cells
/// of domains they omit are kept.
pub fn merge(store: &mut RankStore, date: NaiveDate, entries: &[RankEntry]) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut present: HashSet<&str> = HashSet::with_capacity(entries.len());

    // Dates merged after this one. A domain created or moved earlier here
    // needs a 0 cell on each of them.
    let later_dates: Vec<NaiveDate> = store
        .dates()
        .range((Excluded(date), Unbounded))
        .copied()
        .collect();

    for entry in entries {
        if !present.insert(entry.domain.as_str()) {
            continue;
        }

        match store.record_mut(&entry.domain) {
            Some(record) => {
                if date < record.first_seen {
                    let previous = record.first_seen;
                    for later in later_dates.iter().filter(|d| **d < previous) {
                        record.history.entry(*later).or_insert(UNRANKED);
                    }
                    record.first_seen = date;
                    outcome.lowered.push((entry.domain.clone(), previous));
                }
                record.history.insert(date, entry.rank);
            }
            None => {
                let mut record = DomainRecord::new(date);
                for later in &later_dates {
                    record.history.insert(*later, UNRANKED);
                }
                record.history.insert(date, entry.rank);
                store.insert_record(entry.domain.clone(), record);
                outcome.new_domains.push(entry.domain.clone());
            }
        }
        outcome.domains_updated += 1;
    }

    for (domain, record) in store.records_mut() {
        if record.first_seen <= date && !present.contains(domain.as_str()) {
            if let std::collections::btree_map::Entry::Vacant(cell) = record.history.entry(date) {
                cell.insert(UNRANKED);
                outcome.domains_updated += 1;
            }
        }
    }

    store.register_date(date);
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn entries(rows: &[(u32, &str)]) -> Vec<RankEntry> {
        rows.iter().map(|(rank, domain)| RankEntry::new(*rank, *domain)).collect()
    }

    fn history(store: &RankStore, domain: &str) -> Vec<(NaiveDate, u32)> {
        store
            .get(domain)
            .map(|record| record.history.iter().map(|(d, r)| (*d, *r)).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_two_day_scenario() {
        let mut store = RankStore::new();
        merge(&mut store, day(7), &entries(&[(1, "a.com"), (2, "b.com")]));
        merge(&mut store, day(8), &entries(&[(1, "b.com"), (3, "c.com")]));

        assert_eq!(history(&store, "a.com"), vec![(day(7), 1), (day(8), 0)]);
        assert_eq!(history(&store, "b.com"), vec![(day(7), 2), (day(8), 1)]);
        assert_eq!(history(&store, "c.com"), vec![(day(8), 3)]);
        assert_eq!(store.first_seen("a.com"), Some(day(7)));
        assert_eq!(store.first_seen("b.com"), Some(day(7)));
        assert_eq!(store.first_seen("c.com"), Some(day(8)));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let snapshot = entries(&[(1, "a.com"), (2, "b.com")]);
        let mut once = RankStore::new();
        merge(&mut once, day(7), &snapshot);

        let mut thrice = RankStore::new();
        let first = merge(&mut thrice, day(7), &snapshot);
        let second = merge(&mut thrice, day(7), &snapshot);
        merge(&mut thrice, day(7), &snapshot);

        assert_eq!(once, thrice);
        assert_eq!(first.new_domains, vec!["a.com", "b.com"]);
        assert!(second.new_domains.is_empty());
    }

    #[test]
    fn test_merge_order_does_not_matter() {
        let d1 = entries(&[(1, "a.com"), (2, "b.com")]);
        let d2 = entries(&[(1, "b.com"), (3, "c.com")]);

        let mut forward = RankStore::new();
        merge(&mut forward, day(7), &d1);
        merge(&mut forward, day(8), &d2);

        let mut backward = RankStore::new();
        merge(&mut backward, day(8), &d2);
        let outcome = merge(&mut backward, day(7), &d1);

        assert_eq!(forward, backward);
        assert_eq!(outcome.lowered, vec![("b.com".to_string(), day(8))]);
        assert_eq!(outcome.new_domains, vec!["a.com"]);
    }

    #[test]
    fn test_backfill_into_gap_fills_intermediate_dates() {
        let mut store = RankStore::new();
        merge(&mut store, day(1), &entries(&[(1, "a.com")]));
        merge(&mut store, day(5), &entries(&[(1, "a.com"), (2, "x.com")]));
        merge(&mut store, day(9), &entries(&[(1, "x.com")]));
        // x.com now turns out to exist on day 1 as well.
        merge(&mut store, day(1), &entries(&[(1, "a.com"), (2, "x.com")]));

        assert_eq!(store.first_seen("x.com"), Some(day(1)));
        assert_eq!(
            history(&store, "x.com"),
            vec![(day(1), 2), (day(5), 2), (day(9), 1)]
        );
        assert!(store.completeness_violations().is_empty());
    }

    #[test]
    fn test_absence_cell_does_not_overwrite_existing() {
        let mut store = RankStore::new();
        merge(&mut store, day(7), &entries(&[(1, "a.com"), (2, "b.com")]));
        // A second snapshot for the same date that omits b.com keeps its rank.
        merge(&mut store, day(7), &entries(&[(4, "a.com")]));

        assert_eq!(store.rank("a.com", day(7)), 4);
        assert_eq!(store.rank("b.com", day(7)), 2);
    }

    #[test]
    fn test_reappearing_domain_gets_fresh_rank() {
        let mut store = RankStore::new();
        merge(&mut store, day(1), &entries(&[(1, "a.com")]));
        merge(&mut store, day(2), &entries(&[(1, "b.com")]));
        merge(&mut store, day(3), &entries(&[(7, "a.com")]));

        assert_eq!(
            history(&store, "a.com"),
            vec![(day(1), 1), (day(2), 0), (day(3), 7)]
        );
    }

    #[test]
    fn test_duplicate_entries_keep_first() {
        let mut store = RankStore::new();
        let outcome = merge(&mut store, day(1), &entries(&[(1, "a.com"), (9, "a.com")]));
        assert_eq!(store.rank("a.com", day(1)), 1);
        assert_eq!(outcome.domains_updated, 1);
    }

    #[test]
    fn test_empty_snapshot_zeroes_known_domains() {
        let mut store = RankStore::new();
        merge(&mut store, day(1), &entries(&[(1, "a.com")]));
        let outcome = merge(&mut store, day(2), &[]);
        assert_eq!(outcome.domains_updated, 1);
        assert_eq!(history(&store, "a.com"), vec![(day(1), 1), (day(2), 0)]);
    }
}
