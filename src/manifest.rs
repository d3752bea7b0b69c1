use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::ListedObject;

pub const MANIFEST_VERSION: u32 = 1;

/// Per-region record of counted log objects and scan progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub last_processed_hour: Option<DateTime<Utc>>,
    /// Entries for hours before this were pruned; normal scans never go back
    /// past it, whatever lookback a later run asks for.
    #[serde(default)]
    pub tracked_since: Option<DateTime<Utc>>,
    pub processed: BTreeMap<String, ProcessedObject>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedObject {
    pub etag: String,
    /// Scan hour the object was listed under; drives pruning.
    pub hour: DateTime<Utc>,
    pub seen_at: DateTime<Utc>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION,
            last_processed_hour: None,
            tracked_since: None,
            processed: BTreeMap::new(),
            updated_at: None,
        }
    }
}

impl Manifest {
    pub fn etag_of(&self, key: &str) -> Option<&str> {
        self.processed.get(key).map(|p| p.etag.as_str())
    }

    pub fn record_processed(&mut self, object: &ListedObject, seen_at: DateTime<Utc>) {
        self.processed.insert(
            object.key.key.clone(),
            ProcessedObject {
                etag: object.etag.clone(),
                hour: object.hour,
                seen_at,
            },
        );
    }

    /// Move the scan watermark forward. Never moves it back, so a run for an
    /// older report date cannot widen the next incremental scan.
    pub fn advance_to(&mut self, hour: Option<DateTime<Utc>>) {
        let Some(hour) = hour else { return };
        match self.last_processed_hour {
            Some(current) if current >= hour => {}
            _ => self.last_processed_hour = Some(hour),
        }
    }

    /// Drop entries for hours a normal-mode run can no longer list.
    ///
    /// Everything older than `last_processed_hour - lookback` goes, and the
    /// cutoff becomes the manifest's horizon so no later normal scan can list
    /// those hours again. The horizon only moves forward. Returns the number
    /// pruned.
    pub fn prune(&mut self, lookback: Duration) -> usize {
        let Some(last) = self.last_processed_hour else {
            return 0;
        };
        let cutoff = self.tracked_since.map_or(last - lookback, |h| h.max(last - lookback));
        self.tracked_since = Some(cutoff);
        let before = self.processed.len();
        self.processed.retain(|_, p| p.hour >= cutoff);
        before - self.processed.len()
    }
}
