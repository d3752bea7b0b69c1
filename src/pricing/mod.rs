mod yaml;

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use tracing::debug;

use crate::cost::{PricingMap, Rate};
use crate::error::{Error, Result};
use crate::types::MetricsSnapshot;

pub use yaml::{parse_pricing_yaml, RateTable};

const DEFAULT_SCOPE: &str = "default";

/// A closed, explicitly maintained rate table. No fuzzy or alias matching.
#[derive(Debug, Clone)]
pub struct StaticPricing {
    rates: RateTable,
    currency: String,
}

impl StaticPricing {
    pub fn from_yaml(data: &str) -> Result<Self> {
        let (rates, currency) = parse_pricing_yaml(data)?;
        Ok(Self { rates, currency })
    }

    pub fn model_count(&self) -> usize {
        self.rates.len()
    }
}

impl PricingMap for StaticPricing {
    fn rate(&self, model_key: &str, region: &str) -> Option<&Rate> {
        let scopes = self.rates.get(model_key)?;
        scopes.get(region).or_else(|| scopes.get(DEFAULT_SCOPE))
    }

    fn currency(&self) -> &str {
        &self.currency
    }
}

/// Where a run gets its pricing table from. Loaded fresh once per run.
pub trait PricingSource {
    fn load(&self) -> Result<StaticPricing>;
}

pub struct YamlPricingFile {
    path: PathBuf,
}

impl YamlPricingFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl PricingSource for YamlPricingFile {
    fn load(&self) -> Result<StaticPricing> {
        let data = fs::read_to_string(&self.path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => {
                Error::Config(format!("pricing table {} not found", self.path.display()))
            }
            _ => Error::Config(format!(
                "failed to read pricing table {}: {e}",
                self.path.display()
            )),
        })?;
        StaticPricing::from_yaml(&data)
    }
}

/// Recompute every cost in the snapshot from its token ledger.
///
/// All costs are reset first, so pricing an already-priced snapshot with the
/// same table gives the same result. Ledger entries without a rate cost zero
/// and their bare model id is listed in `unpriced_models`; the regions
/// without a rate are kept per model in `unpriced_regions`.
pub fn price(snapshot: &mut MetricsSnapshot, pricing: &dyn PricingMap) {
    let check = cfg!(debug_assertions) && crate::verify::verify(snapshot).is_ok();
    snapshot.totals.cost = 0.0;
    for map in [
        &mut snapshot.by_region,
        &mut snapshot.by_identity,
        &mut snapshot.by_model,
    ] {
        for stats in map.values_mut() {
            stats.cost = 0.0;
        }
    }
    snapshot.unpriced_models.clear();
    snapshot.unpriced_regions.clear();
    snapshot.partial_pricing_models.clear();
    snapshot.future_rate_models.clear();
    let report_date = snapshot.report_date;

    for (key, stats) in snapshot.by_usage.iter_mut() {
        let Some(rate) = pricing.rate(&key.model_id, &key.region) else {
            stats.cost = 0.0;
            snapshot.unpriced_models.insert(key.model_id.clone());
            snapshot
                .unpriced_regions
                .entry(key.model_id.clone())
                .or_default()
                .insert(key.region.clone());
            continue;
        };
        if rate.is_partial() {
            snapshot.partial_pricing_models.insert(key.model_id.clone());
        }
        if rate.is_future_on(report_date) {
            snapshot.future_rate_models.insert(key.model_id.clone());
        }

        let cost = rate.cost_for(stats.input_tokens, stats.output_tokens);
        stats.cost = cost;
        snapshot.totals.cost += cost;
        snapshot.by_region.entry(key.region.clone()).or_default().cost += cost;
        snapshot.by_identity.entry(key.identity.clone()).or_default().cost += cost;
        snapshot.by_model.entry(key.model_id.clone()).or_default().cost += cost;
    }

    debug!(
        cost = snapshot.totals.cost,
        unpriced = snapshot.unpriced_models.len(),
        partial = snapshot.partial_pricing_models.len(),
        "priced snapshot"
    );
    if check {
        snapshot.debug_assert_reconciled();
    }
}
