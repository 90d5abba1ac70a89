//! New-domain feed: one `YYYY-MM-DD.txt` per date listing the domains first seen that day.

use crate::rank_store::RankStore;
use crate::table_writer::TableWriter;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};

pub struct NewDomainFeed {
    dir: PathBuf,
}

impl NewDomainFeed {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.txt", date.format("%Y-%m-%d")))
    }

    /// Rewrite the files for `dates` from the store's first-seen entries.
    ///
    /// Derived from the store rather than from what a run created, so
    /// replaying snapshots rewrites identical files. Returns domains listed.
    pub fn write_dates<'a, I>(&self, store: &RankStore, dates: I) -> std::io::Result<usize>
    where
        I: IntoIterator<Item = &'a NaiveDate>,
    {
        let mut listed = 0;
        for date in dates {
            let mut writer = TableWriter::new(self.path_for(*date))?;
            for domain in store.first_seen_on(*date) {
                writer.write_line(domain)?;
            }
            listed += writer.finish()?;
        }
        Ok(listed)
    }

    pub fn read(&self, date: NaiveDate) -> std::io::Result<Vec<String>> {
        let content = std::fs::read_to_string(self.path_for(date))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
