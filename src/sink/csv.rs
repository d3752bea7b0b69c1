use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::storage::snapshot_store::PersistedReport;

/// One row per completed run.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    report_date: String,
    generated_at: String,
    input_tokens: u64,
    output_tokens: u64,
    total_tokens: u64,
    cost: f64,
    currency: &'a str,
    regions: usize,
    models: usize,
    identities: usize,
    objects_processed: u64,
    records_used: u64,
    records_missing_tokens: u64,
    records_missing_timestamp: u64,
    unpriced: bool,
    unpriced_models: String,
}

impl<'a> CsvRow<'a> {
    fn from_report(report: &'a PersistedReport) -> Self {
        let m = &report.metrics;
        let unpriced: Vec<&str> = m.unpriced_models.iter().map(String::as_str).collect();
        Self {
            report_date: report.report_date.to_string(),
            generated_at: report.generated_at.to_rfc3339(),
            input_tokens: m.totals.input_tokens,
            output_tokens: m.totals.output_tokens,
            total_tokens: m.totals.total_tokens(),
            cost: m.totals.cost,
            currency: &report.currency,
            regions: m.by_region.len(),
            models: m.by_model.len(),
            identities: m.by_identity.len(),
            objects_processed: report.stats.objects_processed,
            records_used: report.stats.records_used,
            records_missing_tokens: m.data_quality.records_missing_tokens,
            records_missing_timestamp: m.data_quality.records_missing_timestamp,
            unpriced: !unpriced.is_empty(),
            unpriced_models: unpriced.join("|"),
        }
    }
}

pub struct CsvAppender {
    path: PathBuf,
}

impl CsvAppender {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first when the file is new or empty.
    pub fn append(&self, report: &PersistedReport) -> Result<()> {
        let err = |e: String| Error::Store(format!("failed to append to {}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| err(e.to_string()))?;
        }
        let needs_header = fs::metadata(&self.path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| err(e.to_string()))?;

        let mut writer = ::csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer
            .serialize(CsvRow::from_report(report))
            .map_err(|e| err(e.to_string()))?;
        writer.flush().map_err(|e| err(e.to_string()))?;
        Ok(())
    }
}
