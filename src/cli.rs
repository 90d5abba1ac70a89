use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};

/// Command-line interface for ingesting daily ranking snapshots and reporting on them.
/// Exit codes: 0=success, 1=snapshots left unresolved, 2=invalid arguments, 3=I/O, config, store or checkpoint error
#[derive(Parser, Debug)]
#[command(name = "rank_tracker")]
#[command(about = "Daily top-N domain ranking history and rank-change reports")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum PeriodArg {
    Weekly,
    Monthly,
    Custom,
    /// Weekly and monthly, each only when its interval has elapsed.
    Scheduled,
}

fn parse_cli_date(raw: &str) -> Result<NaiveDate, String> {
    crate::models::parse_date(raw).ok_or_else(|| format!("'{}' is not a YYYY-MM-DD date", raw))
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Merge snapshots into the rank store, one checkpointed chunk at a time.
    Ingest {
        #[arg(
            short,
            long,
            default_value = "./data",
            help = "Directory holding the rank store, checkpoint and outputs"
        )]
        data_dir: String,

        #[arg(
            short,
            long,
            default_value = "./historical_extracts",
            help = "Directory of YYYY-MM-DD/top-1m.csv or YYYY-MM-DD.csv snapshots"
        )]
        source_dir: String,

        #[arg(
            short,
            long,
            conflicts_with = "source_dir",
            help = "JSON manifest of {id, date, url} snapshots fetched over HTTP"
        )]
        manifest: Option<String>,

        #[arg(short, long, default_value_t = 10, help = "Snapshots merged per flush")]
        chunk_size: usize,

        #[arg(long, value_parser = parse_cli_date, help = "Skip snapshots before this date")]
        start_date: Option<NaiveDate>,

        #[arg(long, value_parser = parse_cli_date, help = "Skip snapshots after this date")]
        end_date: Option<NaiveDate>,

        #[arg(long, help = "Process only this chunk (0-based)")]
        chunk_id: Option<usize>,

        #[arg(
            long,
            requires = "chunk_id",
            help = "Write the chunk into its own partial store for a later merge-partials"
        )]
        isolated: bool,

        #[arg(long, help = "Re-queue snapshots that previously failed permanently")]
        retry_failed: bool,

        #[arg(long, help = "Reconstruct an unreadable checkpoint from the store")]
        rebuild_checkpoint: bool,

        #[arg(long, default_value_t = 3, help = "Fetch attempts per snapshot")]
        max_attempts: u32,

        #[arg(short, long, default_value_t = 60, help = "Fetch timeout in seconds")]
        timeout: u64,

        #[arg(
            short,
            long,
            default_value = "RankTracker/1.0",
            help = "User agent string for HTTP requests"
        )]
        user_agent: String,
    },

    /// Fold partial stores written by isolated chunk runs into the main store.
    MergePartials {
        #[arg(short, long, default_value = "./data", help = "Directory holding the rank store")]
        data_dir: String,
    },

    /// Write rank-change reports as CSV.
    Report {
        #[arg(short, long, default_value = "./data", help = "Directory holding the rank store")]
        data_dir: String,

        #[arg(short, long, value_enum, default_value_t = PeriodArg::Weekly)]
        period: PeriodArg,

        #[arg(long, value_parser = parse_cli_date, required_if_eq("period", "custom"))]
        start: Option<NaiveDate>,

        #[arg(long, value_parser = parse_cli_date, required_if_eq("period", "custom"))]
        end: Option<NaiveDate>,

        #[arg(long, default_value_t = 100, help = "Rows in the top movers list")]
        top_n: usize,

        #[arg(long, default_value_t = 50, help = "Rows in the risers and fallers lists")]
        top_movers: usize,

        #[arg(long, default_value_t = 1_000_000, help = "Rows per all_changes part file")]
        band_size: usize,
    },

    /// Export the store as sharded wide CSV tables.
    Export {
        #[arg(short, long, default_value = "./data", help = "Directory holding the rank store")]
        data_dir: String,

        #[arg(short, long, default_value = "./export", help = "Output directory")]
        output: String,

        #[arg(long, default_value_t = 1_000_000, help = "Domains per shard")]
        shard_size: usize,
    },

    /// Load wide CSV tables into the store.
    Import {
        #[arg(short, long, default_value = "./data", help = "Directory holding the rank store")]
        data_dir: String,

        #[arg(short, long, help = "Directory of domains_rankings_N.csv shards")]
        input: String,
    },

    /// Look up registration dates for one day's new domains.
    Enrich {
        #[arg(short, long, default_value = "./data", help = "Directory holding the new-domain feed")]
        data_dir: String,

        #[arg(long, value_parser = parse_cli_date, help = "Feed date to enrich")]
        date: NaiveDate,

        #[arg(long, default_value_t = 100, help = "Lookups in flight")]
        concurrency: usize,

        #[arg(short, long, default_value_t = 20, help = "Per-lookup timeout in seconds")]
        timeout: u64,

        #[arg(long, default_value = "https://rdap.org/", help = "RDAP bootstrap service")]
        rdap_url: String,
    },

    /// Count first-label keywords across one snapshot file.
    Keywords {
        #[arg(short, long, default_value = "./data", help = "Directory for logs and the default output")]
        data_dir: String,

        #[arg(short, long, help = "Snapshot file with rank,domain rows")]
        input: String,

        #[arg(short, long, help = "Output CSV (default: <data-dir>/keyword_counts.csv)")]
        output: Option<String>,

        #[arg(long, default_value_t = 20, help = "Keywords to print")]
        top: usize,
    },
}

impl Commands {
    /// Every command works inside a data directory; logs go under it.
    pub fn data_dir(&self) -> &str {
        match self {
            Commands::Ingest { data_dir, .. }
            | Commands::MergePartials { data_dir }
            | Commands::Report { data_dir, .. }
            | Commands::Export { data_dir, .. }
            | Commands::Import { data_dir, .. }
            | Commands::Enrich { data_dir, .. }
            | Commands::Keywords { data_dir, .. } => data_dir,
        }
    }
}

impl Cli {
    /// On error, clap prints help and exits with code 2.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::error::ErrorKind;

    #[test]
    fn test_ingest_defaults() {
        let cli = Cli::try_parse_from(["rank_tracker", "ingest"]).unwrap();
        match cli.command {
            Commands::Ingest {
                data_dir,
                source_dir,
                manifest,
                chunk_size,
                isolated,
                max_attempts,
                ..
            } => {
                assert_eq!(data_dir, "./data");
                assert_eq!(source_dir, "./historical_extracts");
                assert!(manifest.is_none());
                assert_eq!(chunk_size, 10);
                assert!(!isolated);
                assert_eq!(max_attempts, 3);
            }
            _ => panic!("Expected Ingest command"),
        }
    }

    #[test]
    fn test_ingest_isolated_chunk() {
        let cli = Cli::try_parse_from([
            "rank_tracker",
            "ingest",
            "--chunk-id",
            "4",
            "--isolated",
            "--start-date",
            "2024-06-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Ingest {
                chunk_id,
                isolated,
                start_date,
                ..
            } => {
                assert_eq!(chunk_id, Some(4));
                assert!(isolated);
                assert_eq!(start_date, NaiveDate::from_ymd_opt(2024, 6, 1));
            }
            _ => panic!("Expected Ingest command"),
        }
    }

    #[test]
    fn test_isolated_requires_chunk_id() {
        let err = Cli::try_parse_from(["rank_tracker", "ingest", "--isolated"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_manifest_conflicts_with_source_dir() {
        let err = Cli::try_parse_from([
            "rank_tracker",
            "ingest",
            "--manifest",
            "m.json",
            "--source-dir",
            "./x",
        ])
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArgumentConflict);
    }

    #[test]
    fn test_bad_date_is_rejected() {
        let err = Cli::try_parse_from(["rank_tracker", "ingest", "--end-date", "June 8"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValueValidation);
    }

    #[test]
    fn test_custom_report_needs_range() {
        let err = Cli::try_parse_from(["rank_tracker", "report", "--period", "custom"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);

        let cli = Cli::try_parse_from([
            "rank_tracker",
            "report",
            "--period",
            "custom",
            "--start",
            "2024-01-01",
            "--end",
            "2024-02-01",
        ])
        .unwrap();
        match cli.command {
            Commands::Report { period, start, end, top_n, .. } => {
                assert_eq!(period, PeriodArg::Custom);
                assert_eq!(start, NaiveDate::from_ymd_opt(2024, 1, 1));
                assert_eq!(end, NaiveDate::from_ymd_opt(2024, 2, 1));
                assert_eq!(top_n, 100);
            }
            _ => panic!("Expected Report command"),
        }
    }

    #[test]
    fn test_enrich_requires_date() {
        let err = Cli::try_parse_from(["rank_tracker", "enrich"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_merge_partials_command() {
        let cli = Cli::try_parse_from(["rank_tracker", "merge-partials", "-d", "/tmp/data"]).unwrap();
        assert!(matches!(cli.command, Commands::MergePartials { data_dir } if data_dir == "/tmp/data"));
    }

    #[test]
    fn test_keywords_command() {
        let cli = Cli::try_parse_from(["rank_tracker", "keywords", "-i", "top-1m.csv"]).unwrap();
        match cli.command {
            Commands::Keywords { input, output, top, .. } => {
                assert_eq!(input, "top-1m.csv");
                assert!(output.is_none());
                assert_eq!(top, 20);
            }
            _ => panic!("Expected Keywords command"),
        }
        let err = Cli::try_parse_from(["rank_tracker", "keywords"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn test_invalid_command() {
        assert!(Cli::try_parse_from(["rank_tracker", "crawl"]).is_err());
    }

    #[test]
    fn test_help_does_not_panic() {
        let err = Cli::try_parse_from(["rank_tracker", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }
}
