use std::collections::BTreeMap;
use std::fmt::Write as _;

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, CellAlignment, ContentArrangement, Table};
use tracing::warn;

use crate::storage::snapshot_store::PersistedReport;
use crate::types::{MetricsSnapshot, TokenStats};

const TOP_IDENTITIES: usize = 5;

fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// `1234567` -> `1,234,567`
fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn format_cost(cost: f64, currency: &str) -> String {
    if currency == "USD" {
        format!("${cost:.4}")
    } else {
        format!("{cost:.4} {currency}")
    }
}

fn ranked(map: &BTreeMap<String, TokenStats>) -> Vec<(&String, &TokenStats)> {
    let mut entries: Vec<_> = map.iter().collect();
    // Stable sort keeps key order among ties.
    entries.sort_by(|a, b| b.1.total_tokens().cmp(&a.1.total_tokens()));
    entries
}

fn stat_line(out: &mut String, name: &str, stats: &TokenStats, currency: &str) {
    let _ = writeln!(
        out,
        "- {name}: {} tokens ({})",
        group_thousands(stats.total_tokens()),
        format_cost(stats.cost, currency)
    );
}

fn warning_lines(metrics: &MetricsSnapshot, delivery_warnings: &[String]) -> Vec<String> {
    let mut lines = Vec::new();
    let dq = &metrics.data_quality;

    if !metrics.unpriced_models.is_empty() {
        lines.push(String::new());
        lines.push("UNPRICED MODELS DETECTED".to_string());
        lines.push("The following models were counted at zero cost due to missing pricing:".to_string());
        for model in &metrics.unpriced_models {
            match metrics.unpriced_regions.get(model) {
                Some(regions) if !regions.is_empty() => {
                    let regions: Vec<_> = regions.iter().map(String::as_str).collect();
                    lines.push(format!("  - {model} (regions: {})", regions.join(", ")));
                }
                _ => lines.push(format!("  - {model}")),
            }
        }
        lines.push(String::new());
        lines.push("Action required: add these model keys to the pricing table".to_string());
    }
    if !metrics.partial_pricing_models.is_empty() {
        let models: Vec<_> = metrics.partial_pricing_models.iter().map(String::as_str).collect();
        lines.push(format!(
            "- Partial pricing (missing input/output rates) for models: {}",
            models.join(", ")
        ));
    }
    if !metrics.future_rate_models.is_empty() {
        let models: Vec<_> = metrics.future_rate_models.iter().map(String::as_str).collect();
        lines.push(format!(
            "- Rates not yet in effect on {} for models: {}",
            metrics.report_date,
            models.join(", ")
        ));
    }
    if dq.records_missing_tokens > 0 {
        lines.push(format!("- {} records missing token counts", dq.records_missing_tokens));
    }
    if dq.records_invalid_tokens > 0 {
        lines.push(format!(
            "- {} records with implausible token counts",
            dq.records_invalid_tokens
        ));
    }
    if dq.records_missing_timestamp > 0 {
        lines.push(format!("- {} records missing timestamps", dq.records_missing_timestamp));
    }
    if dq.token_count_fallbacks > 0 {
        lines.push(format!(
            "- {} records took token counts from the response body",
            dq.token_count_fallbacks
        ));
    }
    if dq.malformed_lines > 0 {
        lines.push(format!("- {} malformed log lines", dq.malformed_lines));
    }
    if !dq.malformed_objects.is_empty() {
        lines.push(format!("- {} malformed log objects:", dq.malformed_objects.len()));
        for key in &dq.malformed_objects {
            lines.push(format!("  - {key}"));
        }
    }
    for w in delivery_warnings {
        lines.push(format!("- Delivery: {w}"));
    }
    lines
}

/// Plain-text report; also the notification payload.
pub fn format_report(metrics: &MetricsSnapshot, currency: &str, delivery_warnings: &[String]) -> String {
    let totals = &metrics.totals;
    let mut out = String::new();
    let _ = writeln!(out, "Bedrock usage report for {} (UTC)", metrics.report_date);

    if metrics.is_empty() {
        out.push_str("No Bedrock usage recorded for this date.\n");
    } else {
        let _ = writeln!(
            out,
            "Total tokens: {} (input {} / output {})",
            group_thousands(totals.total_tokens()),
            group_thousands(totals.input_tokens),
            group_thousands(totals.output_tokens)
        );
        let _ = writeln!(out, "Total cost: {}", format_cost(totals.cost, currency));

        out.push_str("By region:\n");
        for (region, stats) in &metrics.by_region {
            stat_line(&mut out, region, stats, currency);
        }
        out.push_str("By model:\n");
        for (model, stats) in ranked(&metrics.by_model) {
            stat_line(&mut out, model, stats, currency);
        }
        out.push_str("Top identities:\n");
        for (identity, stats) in ranked(&metrics.by_identity).into_iter().take(TOP_IDENTITIES) {
            stat_line(&mut out, identity, stats, currency);
        }
    }

    let warnings = warning_lines(metrics, delivery_warnings);
    if !warnings.is_empty() {
        out.push_str("Warnings:\n");
        for line in warnings {
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

fn breakdown_table(title: &str, rows: Vec<(&String, &TokenStats)>, totals: &TokenStats, currency: &str) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![title, "Input", "Output", "Total", "Cost"]);

    let row = |name: &str, s: &TokenStats| {
        vec![
            Cell::new(name),
            Cell::new(format_tokens(s.input_tokens)).set_alignment(CellAlignment::Right),
            Cell::new(format_tokens(s.output_tokens)).set_alignment(CellAlignment::Right),
            Cell::new(format_tokens(s.total_tokens())).set_alignment(CellAlignment::Right),
            Cell::new(format_cost(s.cost, currency)).set_alignment(CellAlignment::Right),
        ]
    };
    for (name, stats) in rows {
        table.add_row(row(name.as_str(), stats));
    }
    table.add_row(row("TOTAL", totals));
    table
}

pub fn print_table(metrics: &MetricsSnapshot, currency: &str) {
    println!("Bedrock usage for {} (UTC)", metrics.report_date);
    let totals = &metrics.totals;
    println!("{}", breakdown_table("Region", metrics.by_region.iter().collect(), totals, currency));
    println!("{}", breakdown_table("Model", ranked(&metrics.by_model), totals, currency));
    println!("{}", breakdown_table("Identity", ranked(&metrics.by_identity), totals, currency));

    for line in warning_lines(metrics, &[]) {
        println!("{line}");
    }
}

pub fn print_json(report: &PersistedReport) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "failed to serialize report"),
    }
}
