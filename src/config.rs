use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use directories::ProjectDirs;
use regex::Regex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::planner::{PrefixLayout, ReportWindow};
use crate::retry::RetryPolicy;

static ACCOUNT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\D)(\d{12})(?:\D|$)").expect("account id pattern"));

#[derive(Debug, Deserialize, Default)]
pub struct AppConfig {
    pub account_id: Option<String>,
    #[serde(default)]
    pub log_prefix: String,
    /// Region code -> bucket holding that region's invocation logs.
    #[serde(default)]
    pub regions: BTreeMap<String, String>,
    pub webhook: Option<WebhookConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub channel: Option<String>,
    pub username: Option<String>,
}

/// Where log objects are read from.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local mirrors under `bucket_root`.
    #[default]
    Local,
    /// The buckets themselves, over signed HTTPS.
    S3,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TransportConfig {
    pub kind: TransportKind,
    pub timeout_secs: u64,
    /// Directory holding one local mirror per bucket.
    pub bucket_root: Option<PathBuf>,
    /// S3-compatible endpoint, addressed path-style (e.g. `http://localhost:9000`).
    pub endpoint: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Local,
            timeout_secs: 10,
            bucket_root: None,
            endpoint: None,
        }
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "burnlog")
}

pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("config.toml"))
}

pub fn default_pricing_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join("pricing.yaml"))
}

pub fn default_state_dir() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_dir().to_path_buf())
}

pub fn default_bucket_root() -> Option<PathBuf> {
    project_dirs().map(|d| d.data_dir().join("buckets"))
}

/// `s3://name/`, `name.s3.us-east-1.amazonaws.com` -> `name`
pub fn normalize_bucket(raw: &str) -> String {
    let bucket = raw.trim();
    let bucket = bucket.strip_prefix("s3://").unwrap_or(bucket);
    let bucket = bucket.split_once(".s3.").map_or(bucket, |(name, _)| name);
    bucket.trim_matches('/').to_string()
}

/// The account id, when exactly one 12-digit number appears across bucket names.
pub fn derive_account_id<'a>(buckets: impl IntoIterator<Item = &'a String>) -> Option<String> {
    let found: BTreeSet<&str> = buckets
        .into_iter()
        .flat_map(|b| ACCOUNT_ID.captures_iter(b))
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    if found.len() == 1 {
        found.into_iter().next().map(str::to_string)
    } else {
        None
    }
}

pub fn parse_config(data: &str) -> Result<AppConfig> {
    let mut config: AppConfig =
        toml::from_str(data).map_err(|e| Error::Config(format!("invalid config: {e}")))?;

    if config.regions.is_empty() {
        return Err(Error::Config("no regions configured".into()));
    }
    for (region, bucket) in config.regions.iter_mut() {
        crate::storage::check_region_name(region)?;
        *bucket = normalize_bucket(bucket);
        if bucket.is_empty() {
            return Err(Error::Config(format!("empty bucket for region {region}")));
        }
    }
    config.log_prefix = config.log_prefix.trim_matches('/').to_string();
    if config.account_id.is_none() {
        config.account_id = derive_account_id(config.regions.values());
    }
    if config.retry.max_attempts == 0 {
        return Err(Error::Config("retry.max_attempts must be at least 1".into()));
    }
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<AppConfig> {
    let data = fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => Error::Config(format!("config file {} not found", path.display())),
        _ => Error::Config(format!("failed to read {}: {e}", path.display())),
    })?;
    parse_config(&data).map_err(|e| match e {
        Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
        other => other,
    })
}

impl AppConfig {
    pub fn layout(&self) -> PrefixLayout {
        PrefixLayout {
            log_prefix: self.log_prefix.clone(),
            account_id: self.account_id.clone(),
        }
    }

    /// Region -> local mirror directory of its bucket.
    pub fn bucket_dirs(&self, bucket_root: &Path) -> BTreeMap<String, PathBuf> {
        self.regions
            .iter()
            .map(|(region, bucket)| (region.clone(), bucket_root.join(bucket)))
            .collect()
    }
}

/// Everything one run needs, resolved once at startup.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub window: ReportWindow,
    /// Captured once so every component agrees on the current hour.
    pub now: DateTime<Utc>,
    pub lookback: Duration,
    pub force_reprocess: bool,
    pub regions: Vec<String>,
    pub layout: PrefixLayout,
    pub retry: RetryPolicy,
    pub state_dir: PathBuf,
    pub csv_path: Option<PathBuf>,
    pub notify: bool,
}

impl RunConfig {
    pub fn report_date(&self) -> NaiveDate {
        self.window.date
    }
}
