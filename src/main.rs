use rank_tracker::cli::{Cli, Commands, PeriodArg};
use rank_tracker::config::{EnrichConfig, PipelineConfig, ReportConfig, SourceConfig};
use rank_tracker::enrich::{enrich_feed_date, RdapLookup};
use rank_tracker::keywords::run_keywords;
use rank_tracker::logging::{init_logging_in_data_dir, LoggingError};
use rank_tracker::network::HttpClient;
use rank_tracker::orchestration::{
    build_processor, merge_partials, run_export, run_import, run_report, run_scheduled,
    setup_shutdown_handler, PipelineError, ReportPeriod, ReportSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MainError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("Invalid arguments: {0}")]
    Config(String),
}

impl MainError {
    fn exit_code(&self) -> u8 {
        match self {
            MainError::Config(_) => 2,
            MainError::Pipeline(_) | MainError::Logging(_) => 3,
        }
    }
}

fn print_report(summary: &ReportSummary) {
    println!(
        "{} report {} -> {}: {} domains ({} ranked, {} new, {} dropped, {} unchanged)",
        summary.period,
        summary.start,
        summary.end,
        summary.domains,
        summary.ranked,
        summary.new_entrants,
        summary.dropped_out,
        summary.unchanged
    );
    println!("Written to: {}", summary.output_dir.display());
}

/// Returns the number of unresolved snapshots (non-zero means exit 1).
async fn run(command: Commands) -> Result<usize, MainError> {
    match command {
        Commands::Ingest {
            data_dir,
            source_dir,
            manifest,
            chunk_size,
            start_date,
            end_date,
            chunk_id,
            isolated,
            retry_failed,
            rebuild_checkpoint,
            max_attempts,
            timeout,
            user_agent,
        } => {
            let source = match manifest {
                Some(path) => SourceConfig::Manifest(PathBuf::from(path)),
                None => SourceConfig::Directory(PathBuf::from(source_dir)),
            };
            let config = PipelineConfig {
                data_dir: PathBuf::from(data_dir),
                source,
                chunk_size,
                start_date,
                end_date,
                chunk_id,
                isolated,
                retry_failed,
                rebuild_checkpoint,
                max_attempts,
                fetch_timeout_secs: timeout,
                user_agent,
                ..PipelineConfig::default()
            };
            println!(
                "Ingesting into {} ({} snapshots per chunk)",
                config.store_path().display(),
                config.chunk_size
            );

            let shutdown = setup_shutdown_handler();
            let mut processor = build_processor(config).await?.with_shutdown(shutdown);
            let summary = processor.run().await?;

            println!(
                "Committed: {} | Failed: {} | Pending: {} | Skipped: {} | New domains: {}",
                summary.committed,
                summary.committed_with_failure,
                summary.still_pending,
                summary.skipped,
                summary.new_domains
            );
            if summary.interrupted {
                println!("Stopped early; rerun to continue from the checkpoint");
            }
            Ok(summary.unresolved())
        }

        Commands::MergePartials { data_dir } => {
            let summary = merge_partials(&PathBuf::from(data_dir))?;
            println!(
                "Merged {} partial stores: {} domains, {} dates, {} absence cells filled",
                summary.partials, summary.domains, summary.dates, summary.absences_filled
            );
            Ok(0)
        }

        Commands::Report {
            data_dir,
            period,
            start,
            end,
            top_n,
            top_movers,
            band_size,
        } => {
            let config = ReportConfig {
                data_dir: PathBuf::from(data_dir),
                top_n,
                top_movers,
                band_size,
            };
            let period = match period {
                PeriodArg::Weekly => ReportPeriod::Weekly,
                PeriodArg::Monthly => ReportPeriod::Monthly,
                PeriodArg::Custom => match (start, end) {
                    (Some(start), Some(end)) => ReportPeriod::Custom { start, end },
                    _ => return Err(MainError::Config("custom period needs --start and --end".to_string())),
                },
                PeriodArg::Scheduled => {
                    let today = chrono::Utc::now().date_naive();
                    let summaries = run_scheduled(&config, today)?;
                    if summaries.is_empty() {
                        println!("No scheduled report is due");
                    }
                    summaries.iter().for_each(print_report);
                    return Ok(0);
                }
            };
            print_report(&run_report(&config, period)?);
            Ok(0)
        }

        Commands::Export {
            data_dir,
            output,
            shard_size,
        } => {
            let stats = run_export(&PathBuf::from(data_dir), &PathBuf::from(&output), shard_size)?;
            println!(
                "Exported {} domains x {} dates in {} shards to {}",
                stats.domains, stats.dates, stats.shards, output
            );
            Ok(0)
        }

        Commands::Import { data_dir, input } => {
            let stats = run_import(&PathBuf::from(data_dir), &PathBuf::from(input))?;
            println!(
                "Imported {} domains, {} cells",
                stats.domains_written, stats.cells_written
            );
            Ok(0)
        }

        Commands::Enrich {
            data_dir,
            date,
            concurrency,
            timeout,
            rdap_url,
        } => {
            let config = EnrichConfig {
                data_dir: PathBuf::from(data_dir),
                concurrency,
                timeout_secs: timeout,
                rdap_base_url: rdap_url,
                ..EnrichConfig::default()
            };
            let http = HttpClient::new(&config.user_agent, config.timeout_secs).map_err(PipelineError::from)?;
            let lookup = RdapLookup::new(http, &config.rdap_base_url).map_err(PipelineError::from)?;
            let summary = enrich_feed_date(Arc::new(lookup), &config, date)
                .await
                .map_err(PipelineError::from)?;
            println!(
                "Looked up {} domains: {} resolved, {} failed",
                summary.looked_up, summary.resolved, summary.failed
            );
            println!("Written to: {}", config.results_path(date).display());
            Ok(0)
        }

        Commands::Keywords {
            data_dir,
            input,
            output,
            top,
        } => {
            let output = output
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(data_dir).join("keyword_counts.csv"));
            let summary = run_keywords(&PathBuf::from(input), &output, top).map_err(PipelineError::from)?;
            println!(
                "{} domains, {} distinct keywords ({} rows skipped)",
                summary.domains, summary.distinct, summary.skipped_rows
            );
            for (word, count) in &summary.top {
                println!("{}: {}", word, count);
            }
            println!("Written to: {}", output.display());
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse_args();

    let _log_guards = match init_logging_in_data_dir(cli.command.data_dir()) {
        Ok(guards) => guards,
        Err(e) => {
            eprintln!("Error: {}", MainError::from(e));
            return ExitCode::from(3);
        }
    };

    match run(cli.command).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(unresolved) => {
            eprintln!("{} snapshots remain unresolved", unresolved);
            ExitCode::from(1)
        }
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
