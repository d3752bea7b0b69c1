use std::collections::HashMap;

use chrono::NaiveDate;
use serde_yaml::Value;

use crate::cost::Rate;
use crate::error::{Error, Result};
use crate::parser::normalize_model_key;

pub const PRICING_SCHEMA_VERSION: u64 = 1;
const DEFAULT_CURRENCY: &str = "USD";

/// model key -> (region or `default`) -> rate
pub type RateTable = HashMap<String, HashMap<String, Rate>>;

fn number(v: Option<&Value>) -> Option<f64> {
    match v? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn string(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse the pricing table. Returns the rates and the single currency they share.
///
/// Accepts the map under a `rates` key or at the top level. Keys go through the
/// same normalization as observed model ids, so `...-v1:0` and `...-v1` collide.
pub fn parse_pricing_yaml(data: &str) -> Result<(RateTable, String)> {
    let doc: Value = serde_yaml::from_str(data)
        .map_err(|e| Error::Config(format!("invalid pricing table: {e}")))?;

    if let Some(version) = doc.get("schema_version") {
        if version.as_u64() != Some(PRICING_SCHEMA_VERSION) {
            return Err(Error::Config(format!(
                "unsupported pricing schema_version {version:?}"
            )));
        }
    }

    let raw = match doc.get("rates") {
        Some(rates) => rates,
        None => &doc,
    };
    let Some(models) = raw.as_mapping() else {
        return Ok((RateTable::new(), DEFAULT_CURRENCY.to_string()));
    };

    let mut table = RateTable::new();
    let mut currency: Option<String> = None;

    for (model, scopes) in models {
        let Some(model) = string(Some(model)) else {
            continue;
        };
        if model == "schema_version" {
            continue;
        }
        let key = normalize_model_key(&model);
        let Some(scopes) = scopes.as_mapping().filter(|_| !key.is_empty()) else {
            continue;
        };

        for (scope, entry) in scopes {
            let Some(scope) = string(Some(scope)) else {
                continue;
            };
            let input = number(entry.get("input_per_1k"));
            let output = number(entry.get("output_per_1k"));
            if input.is_none() && output.is_none() {
                continue;
            }

            let rate_currency = string(entry.get("currency")).unwrap_or_else(|| DEFAULT_CURRENCY.to_string());
            match &currency {
                Some(c) if *c != rate_currency => {
                    return Err(Error::Config(format!(
                        "pricing table mixes currencies: {c} and {rate_currency} ({model} / {scope})"
                    )));
                }
                Some(_) => {}
                None => currency = Some(rate_currency),
            }

            let effective_date = match string(entry.get("effective_date")) {
                Some(raw) => Some(NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|e| {
                    Error::Config(format!(
                        "invalid effective_date {raw:?} for {model} / {scope}: {e}"
                    ))
                })?),
                None => None,
            };

            table.entry(key.clone()).or_default().insert(
                scope,
                Rate {
                    input_per_1k: input.unwrap_or(0.0),
                    output_per_1k: output.unwrap_or(0.0),
                    effective_date,
                    missing_input: input.is_none(),
                    missing_output: output.is_none(),
                },
            );
        }
    }

    Ok((table, currency.unwrap_or_else(|| DEFAULT_CURRENCY.to_string())))
}
