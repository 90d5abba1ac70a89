//! High-level orchestration: ingestion runs, partial merges, reports and exports.

pub mod builder;
pub mod export;
pub mod partials;
pub mod processor;
pub mod report;
pub mod shutdown;

pub use builder::build_processor;
pub use export::{run_export, run_import};
pub use partials::merge_partials;
pub use processor::{ChunkProcessor, PipelineError, RunSummary};
pub use report::{run_report, run_scheduled, ReportPeriod, ReportSummary};
pub use shutdown::setup_shutdown_handler;
