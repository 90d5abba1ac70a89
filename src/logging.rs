//! Logging setup: daily-rotated text and JSON files plus a compact stdout layer.
//!
//! Files land in `<data_dir>/logs/`:
//! - `app.log` human-readable text without ANSI colors
//! - `app.json.log` structured JSON with span context
//!
//! `RUST_LOG` controls filtering (default `info`), e.g.
//! `RUST_LOG=rank_tracker=debug,reqwest=warn`.

use std::path::Path;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Flushes the background log writers when dropped. Hold it for the life of the program.
pub struct LogGuards {
    _text: WorkerGuard,
    _json: WorkerGuard,
}

pub fn init_logging<P: AsRef<Path>>(log_dir: P) -> Result<LogGuards, LoggingError> {
    let log_path = log_dir.as_ref();
    std::fs::create_dir_all(log_path)?;

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new("info")?,
    };

    let text_file_appender = tracing_appender::rolling::daily(log_path, "app.log");
    let (text_writer, text_guard) = tracing_appender::non_blocking(text_file_appender);

    let json_file_appender = tracing_appender::rolling::daily(log_path, "app.json.log");
    let (json_writer, json_guard) = tracing_appender::non_blocking(json_file_appender);

    let text_layer = fmt::layer()
        .with_writer(text_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_filter(env_filter.clone());

    let json_layer = fmt::layer()
        .json()
        .with_writer(json_writer)
        .with_target(true)
        .with_line_number(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .compact()
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(text_layer)
        .with(json_layer)
        .with(stdout_layer)
        .try_init()?;

    tracing::debug!("logging to {}", log_path.display());

    Ok(LogGuards {
        _text: text_guard,
        _json: json_guard,
    })
}

/// [`init_logging`] into `<data_dir>/logs`.
pub fn init_logging_in_data_dir<P: AsRef<Path>>(data_dir: P) -> Result<LogGuards, LoggingError> {
    init_logging(data_dir.as_ref().join("logs"))
}
