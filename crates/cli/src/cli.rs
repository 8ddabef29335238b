//! CLI argument definitions using clap.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use contracts::SinkKind;
use std::path::PathBuf;

/// Engagement fan-out - exactly-once delivery of engagement events to every sink
#[derive(Parser, Debug)]
#[command(
    name = "engagement-fanout",
    author,
    version,
    about = "Change-driven engagement event fan-out pipeline",
    long_about = "Tails the engagement event log, enriches every event with content \n\
                  metadata and delivers it exactly once to the cache, warehouse and \n\
                  external sinks, with per-sink retries, circuit breakers and a \n\
                  dead-letter store."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "FANOUT_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "FANOUT_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Follow the event log and fan events out until interrupted
    Run(RunArgs),

    /// Re-deliver a historical time range without touching the live checkpoint
    Backfill(BackfillArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Show checkpoints, ledger and dead letters from the state directory
    Inspect(InspectArgs),

    /// Push dead letters of one sink through that sink again
    ReplayDeadLetters(ReplayArgs),

    /// Append synthetic engagement events to a JSONL event log
    Generate(GenerateArgs),
}

/// Options shared by every command that reads a configuration file
#[derive(Parser, Debug, Clone)]
pub struct ConfigArgs {
    /// Path to configuration file (TOML or JSON)
    #[arg(
        short,
        long,
        default_value = "pipeline.toml",
        env = "FANOUT_CONFIG"
    )]
    pub config: PathBuf,

    /// Override the state directory (ledger, checkpoints, dead letters)
    #[arg(long, env = "FANOUT_STATE_DIR")]
    pub state_dir: Option<PathBuf>,
}

/// Arguments for the `run` command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Override the event log path
    #[arg(long, env = "FANOUT_SOURCE_PATH")]
    pub source: Option<PathBuf>,

    /// Override the external sink endpoint (also enables the sink)
    #[arg(long, env = "FANOUT_EXTERNAL_URL")]
    pub external_url: Option<String>,

    /// Stop after this many seconds (0 = run until interrupted)
    #[arg(long, default_value = "0", env = "FANOUT_TIMEOUT")]
    pub timeout: u64,

    /// Validate configuration and exit without running pipeline
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "9000", env = "FANOUT_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `backfill` command
#[derive(Parser, Debug, Clone)]
pub struct BackfillArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Inclusive range start (RFC 3339)
    #[arg(long)]
    pub start: DateTime<Utc>,

    /// Exclusive range end (RFC 3339)
    #[arg(long)]
    pub end: DateTime<Utc>,

    /// Override `backfill.concurrency`
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "FANOUT_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "pipeline.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `inspect` command
#[derive(Parser, Debug)]
pub struct InspectArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Only list dead letters of this sink
    #[arg(long)]
    pub sink: Option<SinkKind>,

    /// Include the enriched payload of every dead letter
    #[arg(long)]
    pub payloads: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `replay-dead-letters` command
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Sink whose dead letters are replayed
    #[arg(long)]
    pub sink: SinkKind,

    /// Override the external sink endpoint
    #[arg(long, env = "FANOUT_EXTERNAL_URL")]
    pub external_url: Option<String>,
}

/// Arguments for the `generate` command
#[derive(Parser, Debug)]
pub struct GenerateArgs {
    /// Event log to append to (created if missing)
    #[arg(short, long, default_value = "./data/events.jsonl")]
    pub output: PathBuf,

    /// Content catalog: read if it exists, written otherwise
    #[arg(long, default_value = "./data/content.json")]
    pub catalog: PathBuf,

    /// Number of events to append
    #[arg(short = 'n', long, default_value = "1000")]
    pub count: usize,

    /// Seed for reproducible output
    #[arg(long)]
    pub seed: Option<u64>,

    /// Catalog size when a new catalog is generated
    #[arg(long, default_value = "20")]
    pub content_count: usize,

    /// Size of the user pool
    #[arg(long, default_value = "1000")]
    pub user_count: usize,

    /// Gap between consecutive event timestamps, in milliseconds
    #[arg(long, default_value = "1000")]
    pub spacing_ms: u64,

    /// Timestamp of the first event (default: so the last one lands now)
    #[arg(long)]
    pub start: Option<DateTime<Utc>>,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}
