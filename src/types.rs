use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one raw log object: the region whose bucket holds it plus its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogObjectKey {
    pub region: String,
    pub key: String,
}

/// An object returned by a listing pass, tagged with the scan hour it was found under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: LogObjectKey,
    pub etag: String,
    pub hour: DateTime<Utc>,
}

/// One normalized invocation extracted from a log object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub region: String,
    pub model_id: String,
    pub identity_arn: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Token counts came from the response body instead of the metadata fields.
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

impl TokenStats {
    /// Saturates instead of wrapping; callers check `can_add` first, so a
    /// saturated sum only shows up on data that no longer reconciles.
    pub fn add(&mut self, input_tokens: u64, output_tokens: u64, cost: f64) {
        self.input_tokens = self.input_tokens.saturating_add(input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(output_tokens);
        self.cost += cost;
    }

    /// Whether adding these counts keeps every sum, the combined total included, in range.
    pub fn can_add(&self, input_tokens: u64, output_tokens: u64) -> bool {
        let input = self.input_tokens.checked_add(input_tokens);
        let output = self.output_tokens.checked_add(output_tokens);
        matches!((input, output), (Some(i), Some(o)) if i.checked_add(o).is_some())
    }

    pub fn accumulate_from(&mut self, other: &TokenStats) {
        self.add(other.input_tokens, other.output_tokens, other.cost);
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Finest aggregation grain: pricing depends on region and model, reports on identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UsageKey {
    pub region: String,
    pub identity: String,
    pub model_id: String,
}

/// Data-quality faults: surfaced in the report, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQuality {
    pub records_missing_tokens: u64,
    pub records_missing_timestamp: u64,
    /// Counts out of range, or records that would overflow the day's totals.
    #[serde(default)]
    pub records_invalid_tokens: u64,
    pub token_count_fallbacks: u64,
    pub malformed_lines: u64,
    pub malformed_objects: BTreeSet<String>,
}

impl DataQuality {
    pub fn absorb(&mut self, other: &DataQuality) {
        self.records_missing_tokens += other.records_missing_tokens;
        self.records_missing_timestamp += other.records_missing_timestamp;
        self.records_invalid_tokens += other.records_invalid_tokens;
        self.token_count_fallbacks += other.token_count_fallbacks;
        self.malformed_lines += other.malformed_lines;
        self.malformed_objects
            .extend(other.malformed_objects.iter().cloned());
    }

    pub fn is_clean(&self) -> bool {
        self.records_missing_tokens == 0
            && self.records_missing_timestamp == 0
            && self.records_invalid_tokens == 0
            && self.token_count_fallbacks == 0
            && self.malformed_lines == 0
            && self.malformed_objects.is_empty()
    }
}

/// Aggregated metrics for one report date.
///
/// For every breakdown map the per-entry sums equal `totals`; `by_usage`
/// is the ledger the other breakdowns and the pricing pass derive from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub report_date: NaiveDate,
    pub totals: TokenStats,
    pub by_region: BTreeMap<String, TokenStats>,
    pub by_identity: BTreeMap<String, TokenStats>,
    pub by_model: BTreeMap<String, TokenStats>,
    #[serde(with = "usage_ledger")]
    pub by_usage: BTreeMap<UsageKey, TokenStats>,
    /// Bare model ids with at least one ledger entry that had no rate.
    pub unpriced_models: BTreeSet<String>,
    /// model id -> regions whose ledger entries had no rate.
    #[serde(default)]
    pub unpriced_regions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub partial_pricing_models: BTreeSet<String>,
    /// Models priced with a rate whose effective date is after the report date.
    #[serde(default)]
    pub future_rate_models: BTreeSet<String>,
    #[serde(default)]
    pub data_quality: DataQuality,
}

impl MetricsSnapshot {
    pub fn new(report_date: NaiveDate) -> Self {
        Self {
            report_date,
            totals: TokenStats::default(),
            by_region: BTreeMap::new(),
            by_identity: BTreeMap::new(),
            by_model: BTreeMap::new(),
            by_usage: BTreeMap::new(),
            unpriced_models: BTreeSet::new(),
            unpriced_regions: BTreeMap::new(),
            partial_pricing_models: BTreeSet::new(),
            future_rate_models: BTreeSet::new(),
            data_quality: DataQuality::default(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.by_usage.is_empty()
    }
}

/// Per-run counters. Unlike the snapshot these are not merged across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub objects_listed: u64,
    pub objects_filtered: u64,
    pub objects_already_processed: u64,
    pub objects_processed: u64,
    pub records_parsed: u64,
    pub records_used: u64,
    pub records_out_of_range: u64,
}

impl RunStats {
    pub fn absorb(&mut self, other: &RunStats) {
        self.objects_listed += other.objects_listed;
        self.objects_filtered += other.objects_filtered;
        self.objects_already_processed += other.objects_already_processed;
        self.objects_processed += other.objects_processed;
        self.records_parsed += other.records_parsed;
        self.records_used += other.records_used;
        self.records_out_of_range += other.records_out_of_range;
    }
}

/// JSON cannot key a map by a struct, so the ledger is stored as a list.
mod usage_ledger {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::{TokenStats, UsageKey};

    #[derive(Serialize, Deserialize)]
    struct LedgerEntry {
        region: String,
        identity: String,
        model_id: String,
        input_tokens: u64,
        output_tokens: u64,
        cost: f64,
    }

    pub fn serialize<S: Serializer>(
        ledger: &BTreeMap<UsageKey, TokenStats>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let entries: Vec<LedgerEntry> = ledger
            .iter()
            .map(|(k, s)| LedgerEntry {
                region: k.region.clone(),
                identity: k.identity.clone(),
                model_id: k.model_id.clone(),
                input_tokens: s.input_tokens,
                output_tokens: s.output_tokens,
                cost: s.cost,
            })
            .collect();
        entries.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<UsageKey, TokenStats>, D::Error> {
        let entries = Vec::<LedgerEntry>::deserialize(deserializer)?;
        let mut ledger = BTreeMap::new();
        for e in entries {
            let key = UsageKey {
                region: e.region,
                identity: e.identity,
                model_id: e.model_id,
            };
            ledger.entry(key).or_insert_with(TokenStats::default).add(
                e.input_tokens,
                e.output_tokens,
                e.cost,
            );
        }
        Ok(ledger)
    }
}
