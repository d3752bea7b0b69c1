mod aggregate;
mod cli;
mod config;
mod cost;
mod error;
mod ingest;
mod manifest;
mod orchestrator;
mod output;
mod parser;
mod planner;
mod pricing;
mod retry;
mod sink;
mod storage;
mod transport;
mod types;
mod verify;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration as StdDuration;

use anyhow::{anyhow, Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, LogFormat, OutputFormat, RunArgs};
use config::{AppConfig, RunConfig, TransportKind};
use orchestrator::{Dependencies, RunOutcome};
use planner::ReportWindow;
use sink::csv::CsvAppender;
use sink::webhook::WebhookNotifier;
use sink::{Delivery, Notifier};
use storage::snapshot_store::JsonSnapshotStore;
use transport::dump::DumpingObjectStore;
use transport::local::LocalObjectStore;
use transport::s3::S3ObjectStore;
use transport::sigv4::Credentials;
use transport::ObjectStore;

const EXIT_FATAL: u8 = 1;
const EXIT_VERIFICATION: u8 = 2;

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let _ = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

fn required(path: Option<PathBuf>, default: Option<PathBuf>, what: &str) -> Result<PathBuf> {
    path.or(default)
        .ok_or_else(|| anyhow!(error::Error::Config(format!("no {what} given and no default location available"))))
}

fn load_app_config(cli: &Cli) -> Result<AppConfig> {
    let path = required(cli.config.clone(), config::default_config_path(), "config file")?;
    Ok(config::load_config(&path)?)
}

fn webhook_notifier(app: &AppConfig) -> Option<WebhookNotifier> {
    app.webhook.as_ref().map(|w| {
        WebhookNotifier::new(
            w.url.clone(),
            w.channel.clone(),
            w.username.clone(),
            StdDuration::from_secs(app.transport.timeout_secs),
            app.retry.clone(),
        )
    })
}

fn build_run_config(args: &RunArgs, app: &AppConfig) -> Result<RunConfig> {
    let now = Utc::now();
    let date = args.report_date.unwrap_or_else(|| now.date_naive());
    let mut layout = app.layout();
    if let Some(prefix) = &args.log_prefix {
        layout.log_prefix = prefix.trim_matches('/').to_string();
    }

    Ok(RunConfig {
        window: ReportWindow::for_date(date),
        now,
        lookback: Duration::hours(i64::from(args.lookback_hours)),
        force_reprocess: args.force_reprocess,
        regions: app.regions.keys().cloned().collect(),
        layout,
        retry: app.retry.clone(),
        state_dir: required(args.state_dir.clone(), config::default_state_dir(), "state directory")?,
        csv_path: args.csv.clone(),
        notify: !args.no_notify,
    })
}

fn object_store(args: &RunArgs, app: &AppConfig) -> Result<Box<dyn ObjectStore>> {
    match app.transport.kind {
        TransportKind::Local => {
            let bucket_root = required(
                args.bucket_root.clone().or_else(|| app.transport.bucket_root.clone()),
                config::default_bucket_root(),
                "bucket root",
            )?;
            info!(bucket_root = %bucket_root.display(), "reading local bucket mirrors");
            Ok(Box::new(LocalObjectStore::new(app.bucket_dirs(&bucket_root))))
        }
        TransportKind::S3 => {
            let credentials = Credentials::from_env()?;
            info!(endpoint = ?app.transport.endpoint, buckets = app.regions.len(), "reading buckets over S3");
            Ok(Box::new(S3ObjectStore::new(
                app.regions.clone(),
                credentials,
                app.transport.endpoint.clone(),
                StdDuration::from_secs(app.transport.timeout_secs),
            )))
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let args = &cli.run;
    let app = load_app_config(cli)?;
    let config = build_run_config(args, &app)?;

    let pricing_path = required(args.pricing.clone(), config::default_pricing_path(), "pricing table")?;
    info!(
        config = ?cli.config,
        pricing = %pricing_path.display(),
        state_dir = %config.state_dir.display(),
        "resolved paths"
    );

    let store = object_store(args, &app)?;
    let dumping = args.debug_dump.clone().map(|dir| {
        info!(dir = %dir.display(), "dumping fetched log objects");
        DumpingObjectStore::new(store.as_ref(), dir)
    });
    let objects: &dyn ObjectStore = match &dumping {
        Some(d) => d,
        None => store.as_ref(),
    };
    let mut manifests = storage::default_manifest_store(&config.state_dir)?;
    let snapshots = JsonSnapshotStore::new(config.state_dir.join("snapshots"));
    let pricing = pricing::YamlPricingFile::new(pricing_path);
    let notifier = webhook_notifier(&app);
    if notifier.is_none() && config.notify {
        info!("no webhook configured; report will not be posted");
    }
    let csv = config.csv_path.clone().map(CsvAppender::new);

    let outcome = orchestrator::run(
        &config,
        Dependencies {
            objects,
            manifests: manifests.as_mut(),
            snapshots: &snapshots,
            pricing: &pricing,
            notifier: notifier.as_ref().map(|n| n as &dyn Notifier),
            csv: csv.as_ref(),
        },
    )
    .with_context(|| format!("run for {} failed", config.report_date()))?;

    match outcome {
        RunOutcome::Reported {
            report,
            delivery_warnings,
        } => {
            match args.format {
                OutputFormat::Text => print!(
                    "{}",
                    output::format_report(&report.metrics, &report.currency, &delivery_warnings)
                ),
                OutputFormat::Table => output::print_table(&report.metrics, &report.currency),
                OutputFormat::Json => output::print_json(&report),
            }
            Ok(ExitCode::SUCCESS)
        }
        RunOutcome::VerificationFailed(mismatches) => {
            let err = error::Error::Verification(mismatches);
            error!(class = err.class(), "{err}");
            Ok(ExitCode::from(EXIT_VERIFICATION))
        }
    }
}

fn test_webhook(cli: &Cli) -> Result<ExitCode> {
    let app = load_app_config(cli)?;
    let notifier = webhook_notifier(&app)
        .ok_or_else(|| anyhow!(error::Error::Config("no [webhook] section in config".into())))?;

    match notifier.notify("burnlog test message")? {
        Delivery::Delivered => {
            info!("webhook delivery confirmed");
            Ok(ExitCode::SUCCESS)
        }
        Delivery::Ambiguous(reason) => {
            warn!(reason = %reason, "webhook accepted the message without confirming delivery");
            Ok(ExitCode::from(EXIT_FATAL))
        }
    }
}

fn main() -> ExitCode {
    // Before parsing, so `.env` values feed the `env = ...` argument defaults.
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();
    init_logging(cli.log_format);
    match dotenv {
        Ok(path) => debug!(path = %path.display(), "loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(error = %e, "ignoring unreadable .env file"),
    }

    let result = match cli.effective_command() {
        cli::Command::Run => run(&cli),
        cli::Command::TestWebhook => test_webhook(&cli),
    };

    match result {
        Ok(code) => code,
        Err(err) => {
            let class = err
                .chain()
                .find_map(|e| e.downcast_ref::<error::Error>())
                .map_or("internal", error::Error::class);
            error!(class, "{err:#}");
            eprintln!("burnlog: {class}: {err:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
