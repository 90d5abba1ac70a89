//! Change reports over weekly, monthly or custom periods.

use super::processor::PipelineError;
use crate::analyzer::{ChangeAnalyzer, ChangeKind, ChangeReport};
use crate::config::{Config, ReportConfig};
use crate::export::write_change_table;
use crate::state::{RankBackend, RedbBackend};
use crate::table_writer::write_atomic;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportPeriod {
    Weekly,
    Monthly,
    Custom { start: NaiveDate, end: NaiveDate },
}

impl ReportPeriod {
    pub fn name(&self) -> String {
        match self {
            ReportPeriod::Weekly => "weekly".to_string(),
            ReportPeriod::Monthly => "monthly".to_string(),
            ReportPeriod::Custom { start, end } => format!("custom_{}_{}", start, end),
        }
    }

    /// Requested (start, end). Rolling periods end at `latest`.
    pub fn range(&self, latest: NaiveDate) -> (NaiveDate, NaiveDate) {
        match *self {
            ReportPeriod::Weekly => (latest - Duration::days(Config::WEEKLY_DAYS), latest),
            ReportPeriod::Monthly => (latest - Duration::days(Config::MONTHLY_DAYS), latest),
            ReportPeriod::Custom { start, end } => (start, end),
        }
    }

    fn interval_days(&self) -> Option<i64> {
        match self {
            ReportPeriod::Weekly => Some(Config::WEEKLY_DAYS),
            ReportPeriod::Monthly => Some(Config::MONTHLY_DAYS),
            ReportPeriod::Custom { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub period: String,
    pub requested_start: NaiveDate,
    pub requested_end: NaiveDate,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub domains: usize,
    pub ranked: usize,
    pub new_entrants: usize,
    pub dropped_out: usize,
    pub unchanged: usize,
    pub bands: usize,
    pub output_dir: PathBuf,
}

/// Analyze `period` against the store and write its CSV files.
#[tracing::instrument(skip(config))]
pub fn run_report(config: &ReportConfig, period: ReportPeriod) -> Result<ReportSummary, PipelineError> {
    let store = RedbBackend::open(config.store_path())?.load()?;
    let latest = store
        .dates()
        .iter()
        .next_back()
        .copied()
        .ok_or(PipelineError::EmptyStore)?;
    let (start, end) = period.range(latest);

    let report = ChangeAnalyzer::new(config.top_n, config.top_movers).analyze(&store, start, end)?;
    let output_dir = config
        .reports_dir()
        .join(format!("{}_{}", period.name(), report.end));
    write_report(&report, &output_dir, config.band_size, &period)
}

fn write_report(
    report: &ChangeReport,
    output_dir: &std::path::Path,
    band_size: usize,
    period: &ReportPeriod,
) -> Result<ReportSummary, PipelineError> {
    write_change_table(&output_dir.join("top_movers.csv"), &report.top_movers)?;
    write_change_table(&output_dir.join("top_risers.csv"), &report.top_risers)?;
    write_change_table(&output_dir.join("top_fallers.csv"), &report.top_fallers)?;

    let mut bands = 0;
    for (index, band) in report.bands(band_size).enumerate() {
        write_change_table(&output_dir.join(format!("all_changes_part_{}.csv", index + 1)), band)?;
        bands += 1;
    }

    let summary = ReportSummary {
        period: period.name(),
        requested_start: report.requested_start,
        requested_end: report.requested_end,
        start: report.start,
        end: report.end,
        domains: report.changes.len(),
        ranked: report.count(ChangeKind::Ranked),
        new_entrants: report.count(ChangeKind::NewEntrant),
        dropped_out: report.count(ChangeKind::DroppedOut),
        unchanged: report.count(ChangeKind::Unchanged),
        bands,
        output_dir: output_dir.to_path_buf(),
    };
    write_atomic(output_dir.join("summary.json"), &serde_json::to_vec_pretty(&summary)?)?;

    tracing::info!(
        period = %summary.period,
        start = %summary.start,
        end = %summary.end,
        domains = summary.domains,
        "wrote report to {}",
        output_dir.display()
    );
    Ok(summary)
}

/// Last run date of each scheduled period, kept in `reports/last_run.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSchedule {
    pub weekly: Option<NaiveDate>,
    pub monthly: Option<NaiveDate>,
}

impl ReportSchedule {
    pub fn load(config: &ReportConfig) -> Result<Self, PipelineError> {
        match std::fs::read(schedule_path(config)) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, config: &ReportConfig) -> Result<(), PipelineError> {
        write_atomic(schedule_path(config), &serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    fn last_run(&self, period: ReportPeriod) -> Option<NaiveDate> {
        match period {
            ReportPeriod::Weekly => self.weekly,
            ReportPeriod::Monthly => self.monthly,
            ReportPeriod::Custom { .. } => None,
        }
    }

    fn mark_run(&mut self, period: ReportPeriod, today: NaiveDate) {
        match period {
            ReportPeriod::Weekly => self.weekly = Some(today),
            ReportPeriod::Monthly => self.monthly = Some(today),
            ReportPeriod::Custom { .. } => {}
        }
    }

    /// Whether `period` has not run within its interval as of `today`.
    pub fn is_due(&self, period: ReportPeriod, today: NaiveDate) -> bool {
        match (self.last_run(period), period.interval_days()) {
            (Some(last), Some(days)) => (today - last).num_days() >= days,
            _ => true,
        }
    }
}

fn schedule_path(config: &ReportConfig) -> PathBuf {
    config.reports_dir().join("last_run.json")
}

/// Run the weekly and monthly reports that are due as of `today`.
#[tracing::instrument(skip(config))]
pub fn run_scheduled(config: &ReportConfig, today: NaiveDate) -> Result<Vec<ReportSummary>, PipelineError> {
    let mut schedule = ReportSchedule::load(config)?;
    let mut summaries = Vec::new();

    for period in [ReportPeriod::Weekly, ReportPeriod::Monthly] {
        if !schedule.is_due(period, today) {
            tracing::info!("{} report not due yet", period.name());
            continue;
        }
        summaries.push(run_report(config, period)?);
        schedule.mark_run(period, today);
        schedule.save(config)?;
    }
    Ok(summaries)
}
