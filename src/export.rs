//! Delimited exports: sharded wide ranking tables, the first-seen table and
//! change reports. Wide tables can be imported back into a store.

use crate::analyzer::RankChange;
use crate::models::{parse_date, Rank};
use crate::rank_store::RankStore;
use crate::table_writer::TableWriter;
use chrono::NaiveDate;
use std::collections::HashMap;
use std::io::BufRead;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FIRST_SEEN_FILE: &str = "domains_first_seen.csv";
const SHARD_PREFIX: &str = "domains_rankings_";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{file}:{line}: {reason}")]
    Malformed {
        file: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WideExportStats {
    pub shards: usize,
    pub domains: usize,
    pub dates: usize,
}

/// Write `domains_rankings_{n}.csv` shards of at most `shard_size` domains and
/// `domains_first_seen.csv`. Missing cells are written as `0`.
pub fn export_wide_tables(
    store: &RankStore,
    out_dir: &Path,
    shard_size: usize,
) -> Result<WideExportStats, ExportError> {
    let dates: Vec<NaiveDate> = store.dates().iter().copied().collect();
    let mut header = vec!["domain".to_string()];
    header.extend(dates.iter().map(|d| d.format("%Y-%m-%d").to_string()));

    let domains = store.sorted_domains();
    let mut stats = WideExportStats {
        dates: dates.len(),
        ..WideExportStats::default()
    };

    for (index, shard) in domains.chunks(shard_size.max(1)).enumerate() {
        let path = out_dir.join(format!("{}{}.csv", SHARD_PREFIX, index + 1));
        let mut writer = TableWriter::with_header(&path, &header)?;
        let mut row = Vec::with_capacity(header.len());
        for domain in shard {
            row.clear();
            row.push(domain.to_string());
            row.extend(dates.iter().map(|date| store.rank(domain, *date).to_string()));
            writer.write_fields(&row)?;
        }
        stats.domains += writer.finish()?;
        stats.shards += 1;
    }

    let mut writer = TableWriter::with_header(out_dir.join(FIRST_SEEN_FILE), &["domain", "first_seen"])?;
    for domain in &domains {
        if let Some(first_seen) = store.first_seen(domain) {
            writer.write_fields(&[domain.to_string(), first_seen.format("%Y-%m-%d").to_string()])?;
        }
    }
    writer.finish()?;

    tracing::info!(
        shards = stats.shards,
        domains = stats.domains,
        dates = stats.dates,
        "exported wide tables to {}",
        out_dir.display()
    );
    Ok(stats)
}

/// Read shards and the first-seen table written by [`export_wide_tables`].
///
/// Cells before a domain's first-seen date are not created. Domains missing
/// from the first-seen table take their earliest ranked date.
pub fn import_wide_tables(dir: &Path) -> Result<RankStore, ExportError> {
    let first_seen = read_first_seen(&dir.join(FIRST_SEEN_FILE))?;
    let mut store = RankStore::new();

    for shard in shard_paths(dir)? {
        let file = std::fs::File::open(&shard)?;
        let mut lines = std::io::BufReader::new(file).lines();
        let header = match lines.next() {
            Some(line) => line?,
            None => continue,
        };
        let dates = parse_header(&shard, &header)?;
        for date in &dates {
            store.register_date(*date);
        }

        for (index, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let line_no = index + 2;
            let mut fields = line.split(',');
            let domain = fields.next().unwrap_or_default().trim().to_string();
            let ranks = fields
                .map(|field| field.trim().parse::<Rank>())
                .collect::<Result<Vec<Rank>, _>>()
                .map_err(|e| malformed(&shard, line_no, e.to_string()))?;
            if ranks.len() != dates.len() {
                return Err(malformed(
                    &shard,
                    line_no,
                    format!("expected {} ranks, found {}", dates.len(), ranks.len()),
                ));
            }

            let known = first_seen.get(&domain).copied().or_else(|| {
                dates
                    .iter()
                    .zip(&ranks)
                    .filter(|(_, rank)| **rank > 0)
                    .map(|(date, _)| *date)
                    .min()
            });
            let Some(domain_first_seen) = known else {
                tracing::warn!("{}: {} has no first-seen date and no rank, skipped", shard.display(), domain);
                continue;
            };

            store.load_first_seen(domain.clone(), domain_first_seen);
            for (date, rank) in dates.iter().zip(ranks) {
                if *date >= domain_first_seen {
                    store.load_cell(&domain, *date, rank);
                }
            }
        }
    }

    tracing::info!(
        domains = store.len(),
        dates = store.dates().len(),
        "imported wide tables from {}",
        dir.display()
    );
    Ok(store)
}

fn shard_paths(dir: &Path) -> Result<Vec<PathBuf>, ExportError> {
    let mut shards: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let index = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(SHARD_PREFIX))
            .and_then(|rest| rest.strip_suffix(".csv"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(index) = index {
            shards.push((index, path));
        }
    }
    shards.sort();
    Ok(shards.into_iter().map(|(_, path)| path).collect())
}

fn parse_header(file: &Path, header: &str) -> Result<Vec<NaiveDate>, ExportError> {
    header
        .split(',')
        .skip(1)
        .map(|column| {
            parse_date(column).ok_or_else(|| malformed(file, 1, format!("bad date column '{}'", column)))
        })
        .collect()
}

fn read_first_seen(path: &Path) -> Result<HashMap<String, NaiveDate>, ExportError> {
    let mut first_seen = HashMap::new();
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{} not found, deriving first-seen dates from ranks", path.display());
            return Ok(first_seen);
        }
        Err(e) => return Err(e.into()),
    };
    for (index, line) in std::io::BufReader::new(file).lines().enumerate().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let (domain, date) = line
            .split_once(',')
            .ok_or_else(|| malformed(path, index + 1, "expected domain,first_seen".to_string()))?;
        let date = parse_date(date)
            .ok_or_else(|| malformed(path, index + 1, format!("bad date '{}'", date)))?;
        first_seen.insert(domain.trim().to_string(), date);
    }
    Ok(first_seen)
}

fn malformed(file: &Path, line: usize, reason: String) -> ExportError {
    ExportError::Malformed {
        file: file.to_path_buf(),
        line,
        reason,
    }
}

pub const CHANGE_HEADER: [&str; 6] = [
    "domain",
    "start_rank",
    "end_rank",
    "rank_change",
    "change_percent",
    "status",
];

/// Write a change list as CSV. Entrant and dropout rows leave `rank_change` empty.
pub fn write_change_table(path: &Path, changes: &[RankChange]) -> std::io::Result<usize> {
    let mut writer = TableWriter::with_header(path, &CHANGE_HEADER)?;
    for change in changes {
        writer.write_fields(&[
            change.domain.clone(),
            change.start_rank.to_string(),
            change.end_rank.to_string(),
            change.rank_change.map(|d| d.to_string()).unwrap_or_default(),
            change
                .change_percent
                .map(|p| format!("{:.2}", p))
                .unwrap_or_default(),
            change.kind.as_str().to_string(),
        ])?;
    }
    writer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::merge;
    use crate::models::RankEntry;
    use tempfile::TempDir;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    fn scenario() -> RankStore {
        let mut store = RankStore::new();
        merge(&mut store, day(7), &[RankEntry::new(1, "a.com"), RankEntry::new(2, "b.com")]);
        merge(&mut store, day(8), &[RankEntry::new(1, "b.com"), RankEntry::new(3, "c.com")]);
        store
    }

    #[test]
    fn test_export_wide_tables_layout() {
        let dir = TempDir::new().unwrap();
        let stats = export_wide_tables(&scenario(), dir.path(), 2).unwrap();

        assert_eq!(stats, WideExportStats { shards: 2, domains: 3, dates: 2 });
        let first = std::fs::read_to_string(dir.path().join("domains_rankings_1.csv")).unwrap();
        assert_eq!(first, "domain,2024-06-07,2024-06-08\na.com,1,0\nb.com,2,1\n");
        let second = std::fs::read_to_string(dir.path().join("domains_rankings_2.csv")).unwrap();
        assert_eq!(second, "domain,2024-06-07,2024-06-08\nc.com,0,3\n");
        let first_seen = std::fs::read_to_string(dir.path().join(FIRST_SEEN_FILE)).unwrap();
        assert_eq!(
            first_seen,
            "domain,first_seen\na.com,2024-06-07\nb.com,2024-06-07\nc.com,2024-06-08\n"
        );
    }

    #[test]
    fn test_import_restores_cells_after_first_seen() {
        let dir = TempDir::new().unwrap();
        let store = scenario();
        export_wide_tables(&store, dir.path(), 1).unwrap();

        let imported = import_wide_tables(dir.path()).unwrap();
        assert_eq!(imported, store);
        assert!(imported.get("c.com").unwrap().history.get(&day(7)).is_none());
    }

    #[test]
    fn test_import_without_first_seen_table() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("domains_rankings_1.csv"),
            "domain,2024-06-07,2024-06-08\nx.com,0,4\nnever.com,0,0\n",
        )
        .unwrap();

        let imported = import_wide_tables(dir.path()).unwrap();
        assert_eq!(imported.first_seen("x.com"), Some(day(8)));
        assert_eq!(imported.get("x.com").unwrap().history.len(), 1);
        assert!(!imported.contains("never.com"));
    }

    #[test]
    fn test_import_rejects_ragged_rows() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("domains_rankings_1.csv"),
            "domain,2024-06-07,2024-06-08\nx.com,1\n",
        )
        .unwrap();
        let err = import_wide_tables(dir.path()).unwrap_err();
        assert!(matches!(err, ExportError::Malformed { line: 2, .. }));
    }

    #[test]
    fn test_write_change_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("changes.csv");
        let rows = write_change_table(
            &path,
            &[
                RankChange::classify("a.com", 10, 5),
                RankChange::classify("b.com", 0, 7),
            ],
        )
        .unwrap();

        assert_eq!(rows, 2);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            content,
            "domain,start_rank,end_rank,rank_change,change_percent,status\n\
             a.com,10,5,5,50.00,RANKED\n\
             b.com,0,7,,,NEW_ENTRANT\n"
        );
    }
}
