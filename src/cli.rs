use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(
    name = "burnlog",
    about = "Incremental daily token and cost reports from Bedrock invocation logs"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub run: RunArgs,

    /// Config file (default: <config_dir>/burnlog/config.toml)
    #[arg(long, global = true, env = "BURNLOG_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output: pretty (default), json
    #[arg(long, global = true, default_value = "pretty", env = "BURNLOG_LOG_FORMAT")]
    pub log_format: LogFormat,
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Report date in UTC (YYYY-MM-DD, default: today)
    #[arg(long, env = "BURNLOG_REPORT_DATE")]
    pub report_date: Option<NaiveDate>,

    /// Hours re-scanned before the last processed hour, for late objects
    #[arg(long, default_value = "6", env = "BURNLOG_LOOKBACK_HOURS")]
    pub lookback_hours: u32,

    /// Pricing table (default: <config_dir>/burnlog/pricing.yaml)
    #[arg(long, env = "BURNLOG_PRICING")]
    pub pricing: Option<PathBuf>,

    /// Manifest and snapshot directory (default: <data_dir>/burnlog)
    #[arg(long, env = "BURNLOG_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Directory holding one local mirror per bucket
    #[arg(long, env = "BURNLOG_BUCKET_ROOT")]
    pub bucket_root: Option<PathBuf>,

    /// Append one summary row per run to this CSV file
    #[arg(long, env = "BURNLOG_CSV")]
    pub csv: Option<PathBuf>,

    /// Key prefix before AWSLogs/ (overrides the config file)
    #[arg(long, env = "BURNLOG_LOG_PREFIX")]
    pub log_prefix: Option<String>,

    /// Rescan the whole day and replace the stored snapshot
    #[arg(long)]
    pub force_reprocess: bool,

    /// Write every fetched log object, decompressed, under this directory
    #[arg(long, env = "BURNLOG_DEBUG_DUMP")]
    pub debug_dump: Option<PathBuf>,

    /// Skip the webhook notification
    #[arg(long, env = "BURNLOG_NO_NOTIFY")]
    pub no_notify: bool,

    /// Terminal output: text (default), table, json
    #[arg(long, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Ingest new logs and report the day (default)
    Run,
    /// Post a test message to the configured webhook
    TestWebhook,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum OutputFormat {
    Text,
    Table,
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Cli {
    pub fn effective_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
