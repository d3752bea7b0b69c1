use chrono::NaiveDate;

/// Price per thousand tokens for one model, optionally one region.
#[derive(Debug, Clone, PartialEq)]
pub struct Rate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    /// First day the rate applies.
    pub effective_date: Option<NaiveDate>,
    pub missing_input: bool,
    pub missing_output: bool,
}

impl Rate {
    /// One side of the rate was absent from the table and is priced at zero.
    pub fn is_partial(&self) -> bool {
        self.missing_input || self.missing_output
    }

    /// The rate only takes effect after `date`.
    pub fn is_future_on(&self, date: NaiveDate) -> bool {
        self.effective_date.is_some_and(|d| d > date)
    }

    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_per_1k
            + (output_tokens as f64 / 1000.0) * self.output_per_1k
    }
}

/// Exact-match rate lookup by normalized model key.
pub trait PricingMap {
    /// A region-specific rate wins over the model's default.
    fn rate(&self, model_key: &str, region: &str) -> Option<&Rate>;

    /// Currency every rate in the table is expressed in.
    fn currency(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_is_per_thousand_tokens() {
        let rate = Rate {
            input_per_1k: 0.005,
            output_per_1k: 0.015,
            effective_date: NaiveDate::from_ymd_opt(2026, 3, 1),
            missing_input: false,
            missing_output: false,
        };
        assert!((rate.cost_for(300, 150) - 0.00375).abs() < 1e-12);
        assert_eq!(rate.cost_for(0, 0), 0.0);
        assert!(!rate.is_partial());
        assert!(rate.is_future_on(NaiveDate::from_ymd_opt(2026, 2, 28).unwrap()));
        assert!(!rate.is_future_on(NaiveDate::from_ymd_opt(2026, 3, 1).unwrap()));
    }
}
