//! Sparse in-memory ranking history: domain -> {date -> rank} plus first-seen dates.

use crate::models::{Rank, UNRANKED};
use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// History of one domain. Cells only exist for merged dates on or after `first_seen`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRecord {
    pub first_seen: NaiveDate,
    pub history: BTreeMap<NaiveDate, Rank>,
}

impl DomainRecord {
    pub fn new(first_seen: NaiveDate) -> Self {
        Self {
            first_seen,
            history: BTreeMap::new(),
        }
    }

    /// Rank on `date`, or `0` when the cell is missing.
    pub fn rank_on(&self, date: NaiveDate) -> Rank {
        self.history.get(&date).copied().unwrap_or(UNRANKED)
    }
}

/// The ranking matrix plus the set of dates merged into it.
///
/// A store loaded for one chunk may hold only some date columns; `dates`
/// still lists every merged date so absence cells land where they belong.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RankStore {
    records: HashMap<String, DomainRecord>,
    dates: BTreeSet<NaiveDate>,
}

impl RankStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dates(&self) -> &BTreeSet<NaiveDate> {
        &self.dates
    }

    pub fn contains_date(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }

    pub fn get(&self, domain: &str) -> Option<&DomainRecord> {
        self.records.get(domain)
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.records.contains_key(domain)
    }

    pub fn first_seen(&self, domain: &str) -> Option<NaiveDate> {
        self.records.get(domain).map(|record| record.first_seen)
    }

    /// Rank of `domain` on `date`; unknown domains and missing cells read as `0`.
    pub fn rank(&self, domain: &str, date: NaiveDate) -> Rank {
        self.records
            .get(domain)
            .map_or(UNRANKED, |record| record.rank_on(date))
    }

    pub fn records(&self) -> impl Iterator<Item = (&String, &DomainRecord)> {
        self.records.iter()
    }

    /// Domain names in lexical order, for deterministic output.
    pub fn sorted_domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.records.keys().map(String::as_str).collect();
        domains.sort_unstable();
        domains
    }

    /// Domains whose first observation is exactly `date`, sorted.
    pub fn first_seen_on(&self, date: NaiveDate) -> Vec<&str> {
        let mut domains: Vec<&str> = self
            .records
            .iter()
            .filter(|(_, record)| record.first_seen == date)
            .map(|(domain, _)| domain.as_str())
            .collect();
        domains.sort_unstable();
        domains
    }

    pub fn cell_count(&self) -> usize {
        self.records.values().map(|record| record.history.len()).sum()
    }

    // Raw access used by the merge engine and the persistence layer.

    pub(crate) fn record_mut(&mut self, domain: &str) -> Option<&mut DomainRecord> {
        self.records.get_mut(domain)
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = (&String, &mut DomainRecord)> {
        self.records.iter_mut()
    }

    pub(crate) fn insert_record(&mut self, domain: String, record: DomainRecord) {
        self.records.insert(domain, record);
    }

    /// Record that `date` has been merged.
    pub fn register_date(&mut self, date: NaiveDate) {
        self.dates.insert(date);
    }

    /// Restore one stored cell. Used when loading from disk or importing.
    pub fn load_cell(&mut self, domain: &str, date: NaiveDate, rank: Rank) {
        if let Some(record) = self.records.get_mut(domain) {
            record.history.insert(date, rank);
        }
    }

    /// Restore a first-seen entry without any cells.
    pub fn load_first_seen(&mut self, domain: String, first_seen: NaiveDate) {
        self.records
            .entry(domain)
            .and_modify(|record| record.first_seen = record.first_seen.min(first_seen))
            .or_insert_with(|| DomainRecord::new(first_seen));
    }

    /// Fold another store into this one.
    ///
    /// `first_seen` takes the minimum of both sides. When both sides hold a
    /// cell for the same date, `other` wins (it was written later).
    /// Call [`RankStore::fill_absences`] afterwards to restore completeness.
    pub fn absorb(&mut self, other: RankStore) {
        self.dates.extend(other.dates);
        for (domain, incoming) in other.records {
            match self.records.get_mut(&domain) {
                Some(record) => {
                    record.first_seen = record.first_seen.min(incoming.first_seen);
                    record.history.extend(incoming.history);
                }
                None => {
                    self.records.insert(domain, incoming);
                }
            }
        }
    }

    /// Give every domain a `0` cell for each merged date on or after its
    /// first-seen date where it has no cell. Returns the number of cells added.
    pub fn fill_absences(&mut self) -> usize {
        let mut added = 0;
        for record in self.records.values_mut() {
            for date in self.dates.range(record.first_seen..) {
                if let std::collections::btree_map::Entry::Vacant(cell) =
                    record.history.entry(*date)
                {
                    cell.insert(UNRANKED);
                    added += 1;
                }
            }
        }
        added
    }

    /// Domains that break closed-world completeness: a missing cell for a
    /// merged date on or after first-seen, or any cell before first-seen.
    pub fn completeness_violations(&self) -> Vec<(String, NaiveDate)> {
        let mut violations = Vec::new();
        for (domain, record) in &self.records {
            for date in self.dates.range(record.first_seen..) {
                if !record.history.contains_key(date) {
                    violations.push((domain.clone(), *date));
                }
            }
            for date in record.history.range(..record.first_seen).map(|(d, _)| d) {
                violations.push((domain.clone(), *date));
            }
        }
        violations.sort();
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn store_with(cells: &[(&str, NaiveDate, NaiveDate, Rank)]) -> RankStore {
        let mut store = RankStore::new();
        for (domain, first_seen, date, rank) in cells {
            store.load_first_seen(domain.to_string(), *first_seen);
            store.load_cell(domain, *date, *rank);
            store.register_date(*date);
        }
        store
    }

    #[test]
    fn test_missing_cell_reads_zero() {
        let store = store_with(&[("a.com", day(7), day(7), 3)]);
        assert_eq!(store.rank("a.com", day(7)), 3);
        assert_eq!(store.rank("a.com", day(8)), 0);
        assert_eq!(store.rank("missing.com", day(7)), 0);
    }

    #[test]
    fn test_absorb_keeps_min_first_seen_and_later_cells() {
        let mut left = store_with(&[("a.com", day(7), day(7), 5), ("b.com", day(7), day(7), 1)]);
        let right = store_with(&[("a.com", day(3), day(3), 9), ("b.com", day(7), day(7), 2)]);

        left.absorb(right);

        assert_eq!(left.first_seen("a.com"), Some(day(3)));
        assert_eq!(left.rank("a.com", day(3)), 9);
        assert_eq!(left.rank("a.com", day(7)), 5);
        assert_eq!(left.rank("b.com", day(7)), 2);
        assert_eq!(left.dates().len(), 2);
    }

    #[test]
    fn test_fill_absences_respects_first_seen() {
        let mut store = store_with(&[
            ("a.com", day(1), day(1), 1),
            ("b.com", day(3), day(3), 2),
        ]);
        store.register_date(day(2));

        let added = store.fill_absences();

        assert_eq!(added, 2); // a.com on days 2 and 3
        assert_eq!(store.get("a.com").unwrap().history.len(), 3);
        assert_eq!(store.get("b.com").unwrap().history.len(), 1);
        assert!(store.completeness_violations().is_empty());
    }

    #[test]
    fn test_first_seen_on_is_sorted() {
        let store = store_with(&[
            ("z.com", day(1), day(1), 1),
            ("a.com", day(1), day(1), 2),
            ("m.com", day(2), day(2), 1),
        ]);
        assert_eq!(store.first_seen_on(day(1)), vec!["a.com", "z.com"]);
        assert_eq!(store.first_seen_on(day(2)), vec!["m.com"]);
    }

    #[test]
    fn test_completeness_violation_detected() {
        let mut store = store_with(&[("a.com", day(1), day(1), 1)]);
        store.register_date(day(2));
        assert_eq!(
            store.completeness_violations(),
            vec![("a.com".to_string(), day(2))]
        );
    }
}
