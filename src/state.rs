//! Durable rank store on redb.
//!
//! Layout:
//! - `first_seen`: domain -> day number
//! - `snapshot_dates`: day number -> status (registered / committed)
//! - `rankings_YYYY`: (day number, domain) -> rank, one table per calendar year
//!
//! A save runs two transactions. The first registers new dates and creates
//! year tables; the second writes cells and marks the dates committed. Dates
//! left in `registered` state belong to a save that never finished and are
//! invisible to readers.

use crate::models::{date_from_day, day_number, Rank};
use crate::rank_store::RankStore;
use chrono::{Datelike, NaiveDate};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Redb(#[from] redb::Error),

    #[error("Database creation error: {0}")]
    RedbCreate(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Schema evolution failed, no data written: {0}")]
    SchemaEvolution(String),

    #[error("Corrupt store: day number {0} is not a valid date")]
    InvalidDay(i32),

    #[cfg(test)]
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Counts from one save.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStats {
    pub dates_registered: usize,
    pub cells_written: usize,
    pub domains_written: usize,
}

/// Durable home of a [`RankStore`].
pub trait RankBackend: Send + Sync {
    /// Whole store: every domain and every committed date column.
    fn load(&self) -> Result<RankStore, StoreError>;

    /// Every domain and every committed date, with cells only for `dates`.
    fn load_columns(&self, dates: &[NaiveDate]) -> Result<RankStore, StoreError>;

    /// Persist `store`. With `partition = Some(year)` only that year's dates
    /// are committed. First-seen entries are always written, and a domain whose
    /// first-seen is new or earlier also gets its cells on dates already
    /// committed in other years.
    fn save(&self, store: &RankStore, partition: Option<i32>) -> Result<SaveStats, StoreError>;

    /// Committed dates.
    fn dates(&self) -> Result<BTreeSet<NaiveDate>, StoreError>;
}

const FIRST_SEEN: TableDefinition<&str, i32> = TableDefinition::new("first_seen");
const SNAPSHOT_DATES: TableDefinition<i32, u8> = TableDefinition::new("snapshot_dates");

const DATE_REGISTERED: u8 = 1;
const DATE_COMMITTED: u8 = 2;

fn year_table_name(year: i32) -> String {
    format!("rankings_{}", year)
}

/// redb-backed [`RankBackend`].
pub struct RedbBackend {
    db: Arc<Database>,
    path: PathBuf,
    #[cfg(test)]
    fail_data_write: std::sync::atomic::AtomicBool,
}

impl RedbBackend {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = Database::create(&path)?;

        // Open each fixed table so readers never see them missing.
        let write_txn = db.begin_write()?;
        {
            let _first_seen = write_txn.open_table(FIRST_SEEN)?;
            let _dates = write_txn.open_table(SNAPSHOT_DATES)?;
        }
        write_txn.commit()?;

        tracing::debug!("opened rank store at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            path,
            #[cfg(test)]
            fail_data_write: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dates registered by a save that did not finish.
    pub fn uncommitted_dates(&self) -> Result<BTreeSet<NaiveDate>, StoreError> {
        self.dates_with_status(DATE_REGISTERED)
    }

    fn dates_with_status(&self, status: u8) -> Result<BTreeSet<NaiveDate>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOT_DATES)?;
        let mut dates = BTreeSet::new();
        for entry in table.iter()? {
            let (day, value) = entry?;
            if value.value() == status {
                let day = day.value();
                dates.insert(date_from_day(day).ok_or(StoreError::InvalidDay(day))?);
            }
        }
        Ok(dates)
    }

    fn load_first_seen(&self, store: &mut RankStore) -> Result<(), StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FIRST_SEEN)?;
        for entry in table.iter()? {
            let (domain, day) = entry?;
            let day = day.value();
            let first_seen = date_from_day(day).ok_or(StoreError::InvalidDay(day))?;
            store.load_first_seen(domain.value().to_string(), first_seen);
        }
        Ok(())
    }

    /// Load cells of `dates` (all committed) into `store`.
    fn load_cells(&self, store: &mut RankStore, dates: &BTreeSet<NaiveDate>) -> Result<usize, StoreError> {
        let read_txn = self.db.begin_read()?;
        let mut loaded = 0;

        let mut by_year: BTreeMap<i32, Vec<NaiveDate>> = BTreeMap::new();
        for date in dates {
            by_year.entry(date.year()).or_default().push(*date);
        }

        for (year, year_dates) in by_year {
            let name = year_table_name(year);
            let definition: TableDefinition<'_, (i32, &str), Rank> = TableDefinition::new(&name);
            let table = match read_txn.open_table(definition) {
                Ok(table) => table,
                Err(redb::TableError::TableDoesNotExist(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            for date in year_dates {
                let day = day_number(date);
                for entry in table.range((day, "")..(day + 1, ""))? {
                    let (key, rank) = entry?;
                    let (_, domain) = key.value();
                    store.load_cell(domain, date, rank.value());
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }

    /// First transaction of a save: register dates and create year tables.
    /// Returns the dates this call registered.
    fn grow_schema(&self, dates: &BTreeSet<NaiveDate>) -> Result<Vec<NaiveDate>, StoreError> {
        let write_txn = self.db.begin_write()?;
        let mut registered = Vec::new();
        {
            let mut catalog = write_txn.open_table(SNAPSHOT_DATES)?;
            for date in dates {
                let day = day_number(*date);
                if catalog.get(day)?.is_none() {
                    catalog.insert(day, DATE_REGISTERED)?;
                    registered.push(*date);
                }
            }
            let years: BTreeSet<i32> = dates.iter().map(|d| d.year()).collect();
            for year in years {
                let name = year_table_name(year);
                let definition: TableDefinition<'_, (i32, &str), Rank> = TableDefinition::new(&name);
                let _table = write_txn.open_table(definition)?;
            }
        }
        write_txn.commit()?;
        Ok(registered)
    }

    /// Second transaction of a save: cells, first-seen entries, commit marks.
    fn write_data(
        &self,
        store: &RankStore,
        dates: &BTreeSet<NaiveDate>,
        partition: Option<i32>,
    ) -> Result<SaveStats, StoreError> {
        #[cfg(test)]
        if self.fail_data_write.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StoreError::Injected("data transaction".to_string()));
        }

        let mut stats = SaveStats::default();
        let write_txn = self.db.begin_write()?;

        // Domains whose stored first-seen is new or moves earlier. Under a
        // partitioned save they also need their cells on dates already
        // committed in other years, or those dates lose completeness.
        let mut introduced: HashSet<&str> = HashSet::new();
        {
            let mut first_seen = write_txn.open_table(FIRST_SEEN)?;
            for (domain, record) in store.records() {
                let day = day_number(record.first_seen);
                let stored = first_seen.get(domain.as_str())?.map(|value| value.value());
                if stored.map_or(true, |stored| stored > day) {
                    introduced.insert(domain.as_str());
                }
                first_seen.insert(domain.as_str(), day)?;
                stats.domains_written += 1;
            }
        }

        let committed_elsewhere: BTreeSet<NaiveDate> = match partition {
            Some(year) => {
                let catalog = write_txn.open_table(SNAPSHOT_DATES)?;
                let mut committed = BTreeSet::new();
                for entry in catalog.iter()? {
                    let (day, status) = entry?;
                    if status.value() != DATE_COMMITTED {
                        continue;
                    }
                    let day = day.value();
                    let date = date_from_day(day).ok_or(StoreError::InvalidDay(day))?;
                    if date.year() != year {
                        committed.insert(date);
                    }
                }
                committed
            }
            None => BTreeSet::new(),
        };

        let years: BTreeSet<i32> = dates
            .iter()
            .chain(committed_elsewhere.iter())
            .map(|d| d.year())
            .collect();
        for year in years {
            let name = year_table_name(year);
            let definition: TableDefinition<'_, (i32, &str), Rank> = TableDefinition::new(&name);
            let mut table = write_txn.open_table(definition)?;
            for (domain, record) in store.records() {
                for (date, rank) in record.history.iter() {
                    if date.year() != year {
                        continue;
                    }
                    let wanted = dates.contains(date)
                        || (introduced.contains(domain.as_str()) && committed_elsewhere.contains(date));
                    if wanted {
                        table.insert((day_number(*date), domain.as_str()), *rank)?;
                        stats.cells_written += 1;
                    }
                }
            }
        }

        {
            let mut catalog = write_txn.open_table(SNAPSHOT_DATES)?;
            for date in dates {
                catalog.insert(day_number(*date), DATE_COMMITTED)?;
            }
        }
        write_txn.commit()?;
        Ok(stats)
    }

    /// Undo the registrations of a save whose data transaction failed.
    fn unregister(&self, dates: &[NaiveDate]) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut catalog = write_txn.open_table(SNAPSHOT_DATES)?;
            for date in dates {
                let day = day_number(*date);
                let still_pending = catalog
                    .get(day)?
                    .map_or(false, |status| status.value() == DATE_REGISTERED);
                if still_pending {
                    catalog.remove(day)?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Register `dates` the way a save interrupted before its data write would.
    #[cfg(test)]
    pub(crate) fn leave_registered(&self, dates: &[NaiveDate]) -> Result<(), StoreError> {
        self.grow_schema(&dates.iter().copied().collect())
            .map(|_| ())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_data_write(&self, fail: bool) {
        self.fail_data_write
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}

impl RankBackend for RedbBackend {
    fn load(&self) -> Result<RankStore, StoreError> {
        let dates = self.dates()?;
        let mut store = RankStore::new();
        self.load_first_seen(&mut store)?;
        for date in &dates {
            store.register_date(*date);
        }
        let cells = self.load_cells(&mut store, &dates)?;
        tracing::debug!(
            domains = store.len(),
            dates = dates.len(),
            cells,
            "loaded full rank store"
        );
        Ok(store)
    }

    fn load_columns(&self, dates: &[NaiveDate]) -> Result<RankStore, StoreError> {
        let committed = self.dates()?;
        let mut store = RankStore::new();
        self.load_first_seen(&mut store)?;
        for date in &committed {
            store.register_date(*date);
        }
        let wanted: BTreeSet<NaiveDate> = dates
            .iter()
            .filter(|date| committed.contains(date))
            .copied()
            .collect();
        let cells = self.load_cells(&mut store, &wanted)?;
        tracing::debug!(
            domains = store.len(),
            columns = wanted.len(),
            cells,
            "loaded rank store columns"
        );
        Ok(store)
    }

    fn save(&self, store: &RankStore, partition: Option<i32>) -> Result<SaveStats, StoreError> {
        let dates: BTreeSet<NaiveDate> = store
            .dates()
            .iter()
            .filter(|date| partition.map_or(true, |year| date.year() == year))
            .copied()
            .collect();

        let registered = self
            .grow_schema(&dates)
            .map_err(|e| StoreError::SchemaEvolution(e.to_string()))?;

        match self.write_data(store, &dates, partition) {
            Ok(mut stats) => {
                stats.dates_registered = registered.len();
                tracing::debug!(
                    dates_registered = stats.dates_registered,
                    cells = stats.cells_written,
                    domains = stats.domains_written,
                    "saved rank store"
                );
                Ok(stats)
            }
            Err(e) => {
                if let Err(undo) = self.unregister(&registered) {
                    // Readers still ignore the registered dates; the next save retries them.
                    tracing::error!("failed to roll back date registration: {}", undo);
                }
                Err(e)
            }
        }
    }

    fn dates(&self) -> Result<BTreeSet<NaiveDate>, StoreError> {
        self.dates_with_status(DATE_COMMITTED)
    }
}
