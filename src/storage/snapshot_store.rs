use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::write_atomic;
use crate::error::{Error, Result};
use crate::types::{MetricsSnapshot, RunStats};

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Everything persisted for one report date after a verified run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedReport {
    pub schema_version: u32,
    pub report_date: NaiveDate,
    pub report_start: DateTime<Utc>,
    pub report_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub currency: String,
    pub metrics: MetricsSnapshot,
    /// Counters of the run that produced this document only.
    pub stats: RunStats,
    pub report_text: String,
}

/// Durable store of the latest snapshot per report date.
pub trait SnapshotStore {
    fn read(&self, date: NaiveDate) -> Result<Option<PersistedReport>>;
    fn write(&self, report: &PersistedReport) -> Result<PathBuf>;
}

/// `{state_dir}/snapshots/usage-{date}.json`
pub struct JsonSnapshotStore {
    dir: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("usage-{}.json", date.format("%Y-%m-%d")))
    }
}

impl SnapshotStore for JsonSnapshotStore {
    fn read(&self, date: NaiveDate) -> Result<Option<PersistedReport>> {
        let path = self.path_for(date);
        let data = match fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::Store(format!(
                    "failed to read snapshot {}: {e}",
                    path.display()
                )))
            }
        };

        let corrupt = |reason: String| Error::CorruptState {
            what: "snapshot",
            location: path.display().to_string(),
            reason,
        };

        // Check the version before committing to the full shape.
        let raw: serde_json::Value =
            serde_json::from_str(&data).map_err(|e| corrupt(e.to_string()))?;
        let version = raw.get("schema_version").and_then(|v| v.as_u64());
        if version != Some(u64::from(SNAPSHOT_SCHEMA_VERSION)) {
            return Err(corrupt(format!(
                "schema version {version:?}, expected {SNAPSHOT_SCHEMA_VERSION}"
            )));
        }

        let report: PersistedReport =
            serde_json::from_value(raw).map_err(|e| corrupt(e.to_string()))?;
        if report.report_date != date {
            return Err(corrupt(format!(
                "document is for {}, expected {date}",
                report.report_date
            )));
        }
        Ok(Some(report))
    }

    fn write(&self, report: &PersistedReport) -> Result<PathBuf> {
        let path = self.path_for(report.report_date);
        let data = serde_json::to_vec_pretty(report)
            .map_err(|e| Error::Store(format!("failed to serialize snapshot: {e}")))?;
        write_atomic(&path, &data)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;

    fn report(date: NaiveDate) -> PersistedReport {
        let start = Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0).unwrap());
        PersistedReport {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            report_date: date,
            report_start: start,
            report_end: start + chrono::Duration::days(1),
            generated_at: start,
            currency: "USD".into(),
            metrics: MetricsSnapshot::new(date),
            stats: RunStats::default(),
            report_text: "nothing".into(),
        }
    }

    #[test]
    fn missing_snapshot_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonSnapshotStore::new(dir.path().to_path_buf());
        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        assert!(store.read(date).unwrap().is_none());
    }

    #[test]
    fn write_then_read() {
        let dir = TempDir::new().unwrap();
        let store = JsonSnapshotStore::new(dir.path().to_path_buf());
        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();

        let path = store.write(&report(date)).unwrap();
        assert!(path.ends_with("usage-2026-02-01.json"));
        assert_eq!(store.read(date).unwrap(), Some(report(date)));
    }

    #[test]
    fn schema_mismatch_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonSnapshotStore::new(dir.path().to_path_buf());
        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        fs::write(store.path_for(date), r#"{"schema_version": 0}"#).unwrap();

        assert!(matches!(
            store.read(date),
            Err(Error::CorruptState { what: "snapshot", .. })
        ));
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonSnapshotStore::new(dir.path().to_path_buf());
        let date = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
        fs::write(store.path_for(date), "{not json").unwrap();

        assert!(store.read(date).is_err());
    }
}
