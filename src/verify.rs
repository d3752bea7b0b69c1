use std::collections::BTreeMap;
use std::fmt;

use crate::types::{MetricsSnapshot, TokenStats};

pub const COST_TOLERANCE: f64 = 1e-6;

/// One breakdown whose entries do not add up to the grand total.
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub breakdown: &'static str,
    pub field: &'static str,
    pub detail: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}: {}", self.breakdown, self.field, self.detail)
    }
}

fn check_breakdown<K>(
    name: &'static str,
    entries: &BTreeMap<K, TokenStats>,
    totals: &TokenStats,
    out: &mut Vec<Mismatch>,
) {
    let mut sum = TokenStats::default();
    for stats in entries.values() {
        sum.accumulate_from(stats);
    }

    if sum.input_tokens != totals.input_tokens {
        out.push(Mismatch {
            breakdown: name,
            field: "input_tokens",
            detail: format!("sum {} != total {}", sum.input_tokens, totals.input_tokens),
        });
    }
    if sum.output_tokens != totals.output_tokens {
        out.push(Mismatch {
            breakdown: name,
            field: "output_tokens",
            detail: format!("sum {} != total {}", sum.output_tokens, totals.output_tokens),
        });
    }
    if (sum.cost - totals.cost).abs() > COST_TOLERANCE {
        out.push(Mismatch {
            breakdown: name,
            field: "cost",
            detail: format!("sum {:.8} != total {:.8}", sum.cost, totals.cost),
        });
    }
}

/// Cross-check every breakdown against the grand totals.
///
/// Read-only; all mismatches are collected rather than stopping at the first.
pub fn verify(snapshot: &MetricsSnapshot) -> Result<(), Vec<Mismatch>> {
    let mut mismatches = Vec::new();
    let totals = &snapshot.totals;

    check_breakdown("by_region", &snapshot.by_region, totals, &mut mismatches);
    check_breakdown("by_identity", &snapshot.by_identity, totals, &mut mismatches);
    check_breakdown("by_model", &snapshot.by_model, totals, &mut mismatches);
    check_breakdown("by_usage", &snapshot.by_usage, totals, &mut mismatches);

    for (key, stats) in &snapshot.by_usage {
        let unpriced = snapshot
            .unpriced_regions
            .get(&key.model_id)
            .is_some_and(|regions| regions.contains(&key.region));
        if unpriced && stats.cost.abs() > COST_TOLERANCE {
            mismatches.push(Mismatch {
                breakdown: "by_usage",
                field: "cost",
                detail: format!(
                    "unpriced model {} in {} carries cost {:.8}",
                    key.model_id, key.region, stats.cost
                ),
            });
        }
    }
    if !snapshot.unpriced_models.iter().eq(snapshot.unpriced_regions.keys()) {
        mismatches.push(Mismatch {
            breakdown: "unpriced_models",
            field: "model_id",
            detail: "unpriced model list disagrees with the unpriced regions".to_string(),
        });
    }

    if mismatches.is_empty() {
        Ok(())
    } else {
        Err(mismatches)
    }
}
