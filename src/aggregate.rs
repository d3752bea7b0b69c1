use crate::types::{MetricsSnapshot, TokenStats, UsageKey, UsageRecord};

impl MetricsSnapshot {
    /// Fold one record into the totals, all three breakdowns and the ledger.
    /// Costs stay untouched here; they are derived by the pricing pass.
    ///
    /// Returns `false`, leaving the snapshot untouched, when the record would
    /// overflow the totals. Breakdown entries never exceed the totals, so
    /// checking the totals covers them.
    #[must_use]
    pub fn add_usage(&mut self, r: &UsageRecord) -> bool {
        let (input, output) = (r.input_tokens, r.output_tokens);
        if !self.totals.can_add(input, output) {
            return false;
        }

        self.totals.add(input, output, 0.0);
        self.by_region
            .entry(r.region.clone())
            .or_default()
            .add(input, output, 0.0);
        self.by_identity
            .entry(r.identity_arn.clone())
            .or_default()
            .add(input, output, 0.0);
        self.by_model
            .entry(r.model_id.clone())
            .or_default()
            .add(input, output, 0.0);

        let key = UsageKey {
            region: r.region.clone(),
            identity: r.identity_arn.clone(),
            model_id: r.model_id.clone(),
        };
        self.by_usage.entry(key).or_default().add(input, output, 0.0);

        if r.used_fallback {
            self.data_quality.token_count_fallbacks += 1;
        }
        true
    }

    /// Field-wise sum of `other` into `self`.
    pub fn absorb(&mut self, other: &MetricsSnapshot) {
        self.totals.accumulate_from(&other.totals);
        merge_map(&mut self.by_region, &other.by_region);
        merge_map(&mut self.by_identity, &other.by_identity);
        merge_map(&mut self.by_model, &other.by_model);
        merge_map(&mut self.by_usage, &other.by_usage);
        self.unpriced_models
            .extend(other.unpriced_models.iter().cloned());
        for (model, regions) in &other.unpriced_regions {
            self.unpriced_regions
                .entry(model.clone())
                .or_default()
                .extend(regions.iter().cloned());
        }
        self.partial_pricing_models
            .extend(other.partial_pricing_models.iter().cloned());
        self.future_rate_models
            .extend(other.future_rate_models.iter().cloned());
        self.data_quality.absorb(&other.data_quality);
    }

    /// Panics in debug builds when a breakdown no longer reconciles with the totals.
    pub fn debug_assert_reconciled(&self) {
        #[cfg(debug_assertions)]
        if let Err(mismatches) = crate::verify::verify(self) {
            panic!("snapshot for {} lost reconciliation: {mismatches:?}", self.report_date);
        }
    }
}

fn merge_map<K: Ord + Clone>(
    target: &mut std::collections::BTreeMap<K, TokenStats>,
    source: &std::collections::BTreeMap<K, TokenStats>,
) {
    for (k, stats) in source {
        target.entry(k.clone()).or_default().accumulate_from(stats);
    }
}

/// Combine a freshly aggregated run with the previously persisted snapshot
/// for the same date.
///
/// With no previous snapshot, or when reprocessing, the current run replaces
/// whatever was there. Costs are summed like every other field but are not
/// trusted afterwards: pricing recomputes them from the merged ledger.
pub fn merge(
    previous: Option<MetricsSnapshot>,
    current: MetricsSnapshot,
    force_reprocess: bool,
) -> MetricsSnapshot {
    let Some(previous) = previous.filter(|_| !force_reprocess) else {
        return current;
    };

    // A damaged snapshot from disk is left for the verifier to report.
    let check = cfg!(debug_assertions) && crate::verify::verify(&previous).is_ok();
    let mut merged = previous;
    merged.report_date = current.report_date;
    merged.absorb(&current);
    if check {
        merged.debug_assert_reconciled();
    }
    merged
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, TimeZone, Utc};

    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 2).unwrap()
    }

    fn record(region: &str, identity: &str, model: &str, input: u64, output: u64) -> UsageRecord {
        UsageRecord {
            timestamp: Utc.with_ymd_and_hms(2026, 2, 2, 10, 0, 0).unwrap(),
            region: region.into(),
            model_id: model.into(),
            identity_arn: identity.into(),
            input_tokens: input,
            output_tokens: output,
            used_fallback: false,
        }
    }

    fn snapshot(records: &[UsageRecord]) -> MetricsSnapshot {
        let mut s = MetricsSnapshot::new(date());
        for r in records {
            assert!(s.add_usage(r));
        }
        s
    }

    #[test]
    fn overflowing_record_is_refused() {
        let mut s = snapshot(&[record("us-east-1", "arn:a", "m1", u64::MAX - 10, 0)]);
        let before = s.clone();
        assert!(!s.add_usage(&record("us-east-1", "arn:a", "m1", 11, 0)));
        assert_eq!(s, before);

        // input and output fit alone but not together
        assert!(!s.add_usage(&record("us-west-2", "arn:b", "m2", 0, 11)));
        assert!(s.add_usage(&record("us-west-2", "arn:b", "m2", 10, 0)));
    }

    #[test]
    fn add_usage_updates_every_breakdown() {
        let s = snapshot(&[
            record("us-east-1", "arn:a", "m1", 100, 50),
            record("us-west-2", "arn:a", "m2", 10, 5),
        ]);
        assert_eq!(s.totals.input_tokens, 110);
        assert_eq!(s.totals.output_tokens, 55);
        assert_eq!(s.by_region["us-east-1"].input_tokens, 100);
        assert_eq!(s.by_identity["arn:a"].total_tokens(), 165);
        assert_eq!(s.by_model["m2"].output_tokens, 5);
        assert_eq!(s.by_usage.len(), 2);
        s.debug_assert_reconciled();
    }

    #[test]
    fn merge_without_previous_returns_current() {
        let current = snapshot(&[record("us-east-1", "arn:a", "m1", 1, 2)]);
        assert_eq!(merge(None, current.clone(), false), current);
    }

    #[test]
    fn merge_when_reprocessing_ignores_previous() {
        let previous = snapshot(&[record("us-east-1", "arn:a", "m1", 500, 500)]);
        let current = snapshot(&[record("us-east-1", "arn:a", "m1", 1, 2)]);
        assert_eq!(merge(Some(previous), current.clone(), true), current);
    }

    #[test]
    fn merge_sums_fields_and_unions_sets() {
        let mut previous = snapshot(&[record("us-east-1", "arn:a", "m1", 60, 40)]);
        previous.unpriced_models.insert("m1".into());
        previous.unpriced_regions.entry("m1".into()).or_default().insert("us-east-1".into());
        let mut current = snapshot(&[
            record("us-east-1", "arn:a", "m1", 30, 20),
            record("eu-west-1", "arn:b", "m3", 7, 3),
        ]);
        current.unpriced_models.insert("m3".into());
        current.unpriced_regions.entry("m3".into()).or_default().insert("eu-west-1".into());

        let merged = merge(Some(previous), current, false);
        assert_eq!(merged.totals.total_tokens(), 160);
        assert_eq!(merged.by_region["us-east-1"].input_tokens, 90);
        assert_eq!(merged.by_identity["arn:b"].output_tokens, 3);
        assert_eq!(merged.unpriced_models.len(), 2);
        assert!(merged.unpriced_regions["m3"].contains("eu-west-1"));
        assert_eq!(crate::verify::verify(&merged), Ok(()));
    }

    #[test]
    fn merge_is_order_independent() {
        let a = snapshot(&[record("us-east-1", "arn:a", "m1", 60, 40)]);
        let b = snapshot(&[
            record("us-east-1", "arn:b", "m1", 30, 20),
            record("us-west-2", "arn:a", "m2", 9, 1),
        ]);
        let c = snapshot(&[record("us-west-2", "arn:c", "m2", 4, 4)]);

        let ab_c = merge(Some(merge(Some(a.clone()), b.clone(), false)), c.clone(), false);
        let c_ba = merge(Some(merge(Some(c), b, false)), a, false);
        assert_eq!(ab_c, c_ba);
    }

    #[test]
    fn split_runs_equal_single_run() {
        let all = [
            record("us-east-1", "arn:a", "m1", 100, 50),
            record("us-east-1", "arn:b", "m1", 200, 100),
            record("us-west-2", "arn:a", "m2", 3, 4),
        ];
        let once = snapshot(&all);
        let split = merge(Some(snapshot(&all[..1])), snapshot(&all[1..]), false);
        assert_eq!(once, split);
    }
}
