//! Run driver: a small explicit state machine over the configured regions.
//!
//! Per region: load the manifest, plan the scan, list, ingest (or skip when
//! nothing is new) and persist the manifest. Once every region is done the
//! run merges with the stored snapshot for the date, prices, verifies and
//! reports. A region's manifest is saved before the next region starts, so an
//! aborted run never loses work for regions that completed.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::aggregate::merge;
use crate::config::RunConfig;
use crate::cost::PricingMap;
use crate::error::{Error, Result};
use crate::ingest::{ingest_objects, list_region};
use crate::manifest::Manifest;
use crate::output::format_report;
use crate::planner::{plan_scan, PlanRequest, ScanPlan};
use crate::pricing::{price, PricingSource, StaticPricing};
use crate::sink::csv::CsvAppender;
use crate::sink::{Delivery, Notifier};
use crate::storage::snapshot_store::{PersistedReport, SnapshotStore, SNAPSHOT_SCHEMA_VERSION};
use crate::storage::ManifestStore;
use crate::types::{ListedObject, MetricsSnapshot, RunStats};
use crate::verify::{verify, Mismatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    LoadManifest,
    Plan,
    List,
    Ingest,
    UpdateManifest,
    AdvanceRegion,
    LoadPreviousSnapshot,
    RefreshPricing,
    ApplyPricing,
    Verify,
    Report,
    Fail,
    Done,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Fail | State::Done)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Ready,
    Loaded,
    Planned,
    NewObjects,
    NoNewObjects,
    Ingested,
    Saved,
    MoreRegions,
    RegionsExhausted,
    Merged,
    Refreshed,
    Priced,
    Verified,
    Faulted,
    Reported,
}

pub fn transition(state: State, event: Event) -> Result<State> {
    use Event as E;
    use State as S;

    let next = match (state, event) {
        (S::Init, E::Ready) => S::LoadManifest,
        (S::LoadManifest, E::Loaded) => S::Plan,
        (S::Plan, E::Planned) => S::List,
        (S::List, E::NewObjects) => S::Ingest,
        (S::List, E::NoNewObjects) => S::UpdateManifest,
        (S::Ingest, E::Ingested) => S::UpdateManifest,
        (S::UpdateManifest, E::Saved) => S::AdvanceRegion,
        (S::AdvanceRegion, E::MoreRegions) => S::LoadManifest,
        (S::AdvanceRegion, E::RegionsExhausted) => S::LoadPreviousSnapshot,
        (S::LoadPreviousSnapshot, E::Merged) => S::RefreshPricing,
        (S::RefreshPricing, E::Refreshed) => S::ApplyPricing,
        (S::ApplyPricing, E::Priced) => S::Verify,
        (S::Verify, E::Verified) => S::Report,
        (S::Verify, E::Faulted) => S::Fail,
        (S::Report, E::Reported) => S::Done,
        (state, event) => {
            return Err(Error::InvalidTransition(format!("{event:?} in state {state:?}")))
        }
    };
    Ok(next)
}

/// External collaborators of a run.
pub struct Dependencies<'a> {
    pub objects: &'a dyn crate::transport::ObjectStore,
    pub manifests: &'a mut dyn ManifestStore,
    pub snapshots: &'a dyn SnapshotStore,
    pub pricing: &'a dyn PricingSource,
    pub notifier: Option<&'a dyn Notifier>,
    pub csv: Option<&'a CsvAppender>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Reported {
        report: Box<PersistedReport>,
        /// Non-fatal notification problems, e.g. an unconfirmed webhook post.
        delivery_warnings: Vec<String>,
    },
    /// The merged snapshot did not reconcile; nothing was persisted or sent.
    VerificationFailed(Vec<Mismatch>),
}

struct Run<'d, 'c> {
    deps: Dependencies<'d>,
    config: &'c RunConfig,
    region_idx: usize,
    manifest: Manifest,
    plan: ScanPlan,
    pending: Vec<ListedObject>,
    current: MetricsSnapshot,
    stats: RunStats,
    merged: Option<MetricsSnapshot>,
    pricing: Option<StaticPricing>,
    mismatches: Vec<Mismatch>,
    outcome: Option<RunOutcome>,
}

/// Drive one run from `Init` to a terminal state.
pub fn run(config: &RunConfig, deps: Dependencies<'_>) -> Result<RunOutcome> {
    if config.regions.is_empty() {
        return Err(Error::Config("no regions configured".into()));
    }

    let mut run = Run {
        deps,
        config,
        region_idx: 0,
        manifest: Manifest::default(),
        plan: ScanPlan::default(),
        pending: Vec::new(),
        current: MetricsSnapshot::new(config.report_date()),
        stats: RunStats::default(),
        merged: None,
        pricing: None,
        mismatches: Vec::new(),
        outcome: None,
    };

    let mut state = State::Init;
    while !state.is_terminal() {
        let event = run.step(state)?;
        state = transition(state, event)?;
    }

    if state == State::Fail {
        for m in &run.mismatches {
            error!(event = "verify", mismatch = %m, "breakdown does not reconcile");
        }
        return Ok(RunOutcome::VerificationFailed(run.mismatches));
    }
    run.outcome
        .ok_or_else(|| Error::InvalidTransition("run finished without a report".into()))
}

impl Run<'_, '_> {
    fn region(&self) -> &str {
        &self.config.regions[self.region_idx]
    }

    fn step(&mut self, state: State) -> Result<Event> {
        match state {
            State::Init => {
                info!(
                    report_date = %self.config.report_date(),
                    regions = self.config.regions.len(),
                    force_reprocess = self.config.force_reprocess,
                    "starting run"
                );
                // Loaded before any manifest is touched: a bad table must not
                // leave keys recorded whose counts never reach a snapshot.
                self.pricing = Some(self.deps.pricing.load()?);
                Ok(Event::Ready)
            }
            State::LoadManifest => self.load_manifest(),
            State::Plan => self.plan(),
            State::List => self.list(),
            State::Ingest => self.ingest(),
            State::UpdateManifest => self.update_manifest(),
            State::AdvanceRegion => {
                self.region_idx += 1;
                if self.region_idx < self.config.regions.len() {
                    Ok(Event::MoreRegions)
                } else {
                    Ok(Event::RegionsExhausted)
                }
            }
            State::LoadPreviousSnapshot => self.load_previous_snapshot(),
            State::RefreshPricing => self.refresh_pricing(),
            State::ApplyPricing => self.apply_pricing(),
            State::Verify => self.verify(),
            State::Report => self.report(),
            State::Fail | State::Done => Err(Error::InvalidTransition(format!(
                "no step for terminal state {state:?}"
            ))),
        }
    }

    fn load_manifest(&mut self) -> Result<Event> {
        let region = self.region().to_string();
        self.manifest = self.deps.manifests.load(&region)?;
        info!(
            event = "load_manifest",
            region,
            processed = self.manifest.processed.len(),
            last_processed_hour = ?self.manifest.last_processed_hour,
        );
        Ok(Event::Loaded)
    }

    fn plan(&mut self) -> Result<Event> {
        let config = self.config;
        self.plan = plan_scan(&PlanRequest {
            region: self.region(),
            window: config.window,
            now: config.now,
            lookback: config.lookback,
            last_processed_hour: self.manifest.last_processed_hour,
            tracked_since: self.manifest.tracked_since,
            force_reprocess: config.force_reprocess,
            layout: &config.layout,
        });
        info!(
            event = "plan_scan",
            region = self.region(),
            units = self.plan.units.len(),
            first = ?self.plan.units.first().map(|u| u.hour),
            last = ?self.plan.end_hour(),
        );
        Ok(Event::Planned)
    }

    fn list(&mut self) -> Result<Event> {
        let listing = list_region(
            self.deps.objects,
            &self.config.retry,
            self.region(),
            &self.plan,
            &self.manifest,
            self.config.force_reprocess,
        )?;
        info!(
            event = "list_objects",
            region = self.region(),
            listed = listing.stats.objects_listed,
            filtered = listing.stats.objects_filtered,
            already_processed = listing.stats.objects_already_processed,
            new = listing.new_objects.len(),
        );
        self.stats.absorb(&listing.stats);
        self.pending = listing.new_objects;

        if self.pending.is_empty() {
            Ok(Event::NoNewObjects)
        } else {
            Ok(Event::NewObjects)
        }
    }

    fn ingest(&mut self) -> Result<Event> {
        let objects = std::mem::take(&mut self.pending);
        let (snapshot, stats) = ingest_objects(
            self.deps.objects,
            &self.config.retry,
            &self.config.window,
            &objects,
            &mut self.manifest,
            self.config.now,
        )?;
        info!(
            event = "ingest_objects",
            region = self.region(),
            objects = stats.objects_processed,
            records = stats.records_parsed,
            used = stats.records_used,
            out_of_range = stats.records_out_of_range,
            input_tokens = snapshot.totals.input_tokens,
            output_tokens = snapshot.totals.output_tokens,
        );
        self.stats.absorb(&stats);
        self.current.absorb(&snapshot);
        self.current.debug_assert_reconciled();
        Ok(Event::Ingested)
    }

    fn update_manifest(&mut self) -> Result<Event> {
        self.manifest.advance_to(self.plan.end_hour());
        let pruned = self.manifest.prune(self.config.lookback);
        self.manifest.updated_at = Some(self.config.now);

        let region = self.region().to_string();
        self.deps.manifests.save(&region, &self.manifest)?;
        info!(
            event = "update_manifest",
            region,
            processed = self.manifest.processed.len(),
            pruned,
            last_processed_hour = ?self.manifest.last_processed_hour,
        );
        Ok(Event::Saved)
    }

    fn load_previous_snapshot(&mut self) -> Result<Event> {
        let date = self.config.report_date();
        // Reprocessing replaces the stored snapshot, so it is not even read:
        // that is also the way out of an unreadable one.
        let previous = if self.config.force_reprocess {
            None
        } else {
            self.deps.snapshots.read(date)?.map(|r| r.metrics)
        };
        info!(
            event = "load_snapshot",
            report_date = %date,
            found = previous.is_some(),
            force_reprocess = self.config.force_reprocess,
        );

        let current = std::mem::replace(&mut self.current, MetricsSnapshot::new(date));
        self.merged = Some(merge(previous, current, self.config.force_reprocess));
        Ok(Event::Merged)
    }

    fn refresh_pricing(&mut self) -> Result<Event> {
        let Some(pricing) = self.pricing.as_ref() else {
            return Err(Error::InvalidTransition("pricing table was not loaded at start".into()));
        };
        info!(
            event = "refresh_pricing",
            models = pricing.model_count(),
            currency = pricing.currency(),
        );
        Ok(Event::Refreshed)
    }

    fn apply_pricing(&mut self) -> Result<Event> {
        let (Some(merged), Some(pricing)) = (self.merged.as_mut(), self.pricing.as_ref()) else {
            return Err(Error::InvalidTransition("pricing without a merged snapshot".into()));
        };
        price(merged, pricing);
        info!(
            event = "apply_pricing",
            cost = merged.totals.cost,
            unpriced = merged.unpriced_models.len(),
            partial = merged.partial_pricing_models.len(),
        );
        if !merged.data_quality.is_clean() {
            warn!(
                missing_tokens = merged.data_quality.records_missing_tokens,
                invalid_tokens = merged.data_quality.records_invalid_tokens,
                missing_timestamp = merged.data_quality.records_missing_timestamp,
                malformed_objects = merged.data_quality.malformed_objects.len(),
                "data-quality faults were excluded from the totals"
            );
        }
        if !merged.unpriced_models.is_empty() {
            warn!(
                models = ?merged.unpriced_models,
                regions = ?merged.unpriced_regions,
                "models without pricing were counted at zero cost"
            );
        }
        if !merged.future_rate_models.is_empty() {
            warn!(
                models = ?merged.future_rate_models,
                report_date = %merged.report_date,
                "priced with rates that are not yet in effect"
            );
        }
        Ok(Event::Priced)
    }

    fn verify(&mut self) -> Result<Event> {
        let Some(merged) = self.merged.as_ref() else {
            return Err(Error::InvalidTransition("verify without a merged snapshot".into()));
        };
        match verify(merged) {
            Ok(()) => {
                info!(event = "verify", ok = true);
                Ok(Event::Verified)
            }
            Err(mismatches) => {
                self.mismatches = mismatches;
                Ok(Event::Faulted)
            }
        }
    }

    fn report(&mut self) -> Result<Event> {
        let (Some(metrics), Some(pricing)) = (self.merged.take(), self.pricing.as_ref()) else {
            return Err(Error::InvalidTransition("report without a priced snapshot".into()));
        };
        let currency = pricing.currency().to_string();
        let window = self.config.window;

        let report_text = format_report(&metrics, &currency, &[]);
        info!(event = "render_report", bytes = report_text.len());
        let report = PersistedReport {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            report_date: window.date,
            report_start: window.start,
            report_end: window.end,
            generated_at: self.config.now,
            currency,
            metrics,
            stats: self.stats.clone(),
            report_text,
        };

        let path = self.deps.snapshots.write(&report)?;
        info!(event = "write_snapshot", path = %path.display());

        if let Some(csv) = self.deps.csv {
            csv.append(&report)?;
            info!(event = "append_csv", path = %csv.path().display());
        }

        let mut delivery_warnings = Vec::new();
        match self.deps.notifier.filter(|_| self.config.notify) {
            Some(notifier) => match notifier.notify(&report.report_text)? {
                Delivery::Delivered => info!(event = "post_report", delivered = true),
                Delivery::Ambiguous(reason) => {
                    warn!(event = "post_report", delivered = false, reason = %reason, "delivery not confirmed");
                    delivery_warnings.push(reason);
                }
            },
            None => info!(event = "post_report", skipped = true),
        }

        let elapsed = Utc::now() - self.config.now;
        info!(
            report_date = %report.report_date,
            cost = report.metrics.totals.cost,
            elapsed_ms = elapsed.num_milliseconds(),
            "run complete"
        );
        self.outcome = Some(RunOutcome::Reported {
            report: Box::new(report),
            delivery_warnings,
        });
        Ok(Event::Reported)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fs;
    use std::path::Path;

    use chrono::{DateTime, Duration, NaiveDate, TimeZone};
    use tempfile::TempDir;

    use super::*;
    use crate::planner::{PrefixLayout, ReportWindow};
    use crate::retry::RetryPolicy;
    use crate::storage::default_manifest_store;
    use crate::storage::snapshot_store::JsonSnapshotStore;
    use crate::transport::memory::MemoryObjectStore;

    const MODEL: &str = "us.provider.model-v1";
    const PRICING: &str = r#"
rates:
  us.provider.model-v1:
    default: {input_per_1k: 0.005, output_per_1k: 0.015, currency: USD}
"#;

    struct InlinePricing(&'static str);

    impl PricingSource for InlinePricing {
        fn load(&self) -> Result<StaticPricing> {
            StaticPricing::from_yaml(self.0)
        }
    }

    struct MissingPricing;

    impl PricingSource for MissingPricing {
        fn load(&self) -> Result<StaticPricing> {
            Err(Error::Config("pricing table pricing.yaml not found".into()))
        }
    }

    struct RecordingNotifier {
        reply: Delivery,
        sent: RefCell<Vec<String>>,
    }

    impl RecordingNotifier {
        fn new(reply: Delivery) -> Self {
            Self {
                reply,
                sent: RefCell::new(Vec::new()),
            }
        }
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, text: &str) -> Result<Delivery> {
            self.sent.borrow_mut().push(text.to_string());
            Ok(self.reply.clone())
        }
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 2).unwrap()
    }

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, hour, 30, 0).unwrap()
    }

    fn config(state: &Path, regions: &[&str], now: DateTime<Utc>, force: bool) -> RunConfig {
        RunConfig {
            window: ReportWindow::for_date(date()),
            now,
            lookback: Duration::hours(6),
            force_reprocess: force,
            regions: regions.iter().map(|r| r.to_string()).collect(),
            layout: PrefixLayout {
                log_prefix: String::new(),
                account_id: Some("123456789012".into()),
            },
            retry: RetryPolicy::immediate(3),
            state_dir: state.to_path_buf(),
            csv_path: None,
            notify: true,
        }
    }

    fn key(region: &str, hour: u32, id: &str) -> String {
        format!(
            "AWSLogs/123456789012/BedrockModelInvocationLogs/{region}/2026/02/02/{hour:02}/20260202T{hour:02}0000000Z_{id}.json"
        )
    }

    fn record(region: &str, hour: u32, model: &str, input: u64, output: u64) -> String {
        format!(
            r#"{{"timestamp":"2026-02-02T{hour:02}:05:00Z","region":"{region}","modelId":"{model}","identity":{{"arn":"arn:aws:iam::123456789012:user/ci"}},"input":{{"inputTokenCount":{input}}},"output":{{"outputTokenCount":{output}}}}}"#
        )
    }

    /// One object, two records, the reference scenario.
    fn put_scenario(store: &MemoryObjectStore) {
        store.put(
            "us-east-1",
            &key("us-east-1", 3, "aa"),
            format!(
                "{}\n{}\n",
                record("us-east-1", 3, MODEL, 100, 50),
                record("us-east-1", 3, MODEL, 200, 100)
            ),
        );
    }

    struct Harness {
        dir: TempDir,
        snapshots: JsonSnapshotStore,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let snapshots = JsonSnapshotStore::new(dir.path().join("snapshots"));
            Self { dir, snapshots }
        }

        fn run(
            &self,
            store: &MemoryObjectStore,
            config: &RunConfig,
            notifier: Option<&dyn Notifier>,
        ) -> Result<RunOutcome> {
            self.run_priced(store, config, &InlinePricing(PRICING), notifier)
        }

        fn run_priced(
            &self,
            store: &MemoryObjectStore,
            config: &RunConfig,
            pricing: &dyn PricingSource,
            notifier: Option<&dyn Notifier>,
        ) -> Result<RunOutcome> {
            let mut manifests = default_manifest_store(self.dir.path())?;
            run(
                config,
                Dependencies {
                    objects: store,
                    manifests: manifests.as_mut(),
                    snapshots: &self.snapshots,
                    pricing,
                    notifier,
                    csv: None,
                },
            )
        }

        fn reported(&self, store: &MemoryObjectStore, config: &RunConfig) -> PersistedReport {
            match self.run(store, config, None).unwrap() {
                RunOutcome::Reported { report, .. } => *report,
                other => panic!("unexpected outcome: {other:?}"),
            }
        }

        fn manifest(&self, region: &str) -> Manifest {
            default_manifest_store(self.dir.path())
                .unwrap()
                .load(region)
                .unwrap()
        }
    }

    fn metrics_json(report: &PersistedReport) -> Vec<u8> {
        serde_json::to_vec(&report.metrics).unwrap()
    }

    #[test]
    fn transition_table_rejects_unknown_pairs() {
        assert_eq!(transition(State::Init, Event::Ready).unwrap(), State::LoadManifest);
        assert_eq!(transition(State::List, Event::NoNewObjects).unwrap(), State::UpdateManifest);
        assert_eq!(transition(State::AdvanceRegion, Event::MoreRegions).unwrap(), State::LoadManifest);
        assert_eq!(transition(State::Verify, Event::Faulted).unwrap(), State::Fail);
        assert!(matches!(
            transition(State::List, Event::Ingested),
            Err(Error::InvalidTransition(_))
        ));
        assert!(transition(State::Done, Event::Ready).is_err());
        assert!(transition(State::Fail, Event::Reported).is_err());
    }

    #[test]
    fn reference_scenario_prices_and_verifies() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let notifier = RecordingNotifier::new(Delivery::Delivered);

        let outcome = h
            .run(&store, &config(h.dir.path(), &["us-east-1"], at(5), false), Some(&notifier))
            .unwrap();
        let RunOutcome::Reported { report, delivery_warnings } = outcome else {
            panic!("verification failed");
        };

        let totals = report.metrics.totals;
        assert_eq!(totals.input_tokens, 300);
        assert_eq!(totals.output_tokens, 150);
        assert!((totals.cost - 0.00375).abs() < 1e-12);
        assert!(report.metrics.unpriced_models.is_empty());
        assert!(delivery_warnings.is_empty());
        assert_eq!(report.stats.objects_processed, 1);
        assert_eq!(report.stats.records_used, 2);

        assert_eq!(notifier.sent.borrow().len(), 1);
        assert!(notifier.sent.borrow()[0].contains("Total tokens: 450"));
        let stored = h.snapshots.read(date()).unwrap().unwrap();
        assert_eq!(stored.report_text, report.report_text);

        let manifest = h.manifest("us-east-1");
        assert_eq!(manifest.processed.len(), 1);
        assert_eq!(manifest.last_processed_hour, Some(Utc.with_ymd_and_hms(2026, 2, 2, 5, 0, 0).unwrap()));
    }

    #[test]
    fn rerun_without_new_objects_is_idempotent() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let config = config(h.dir.path(), &["us-east-1"], at(5), false);

        let first = h.reported(&store, &config);
        let fetches = store.fetch_count();
        let second = h.reported(&store, &config);

        assert_eq!(metrics_json(&first), metrics_json(&second));
        assert_eq!(store.fetch_count(), fetches);
        assert_eq!(second.stats.objects_already_processed, 1);
        assert_eq!(second.stats.objects_processed, 0);
    }

    #[test]
    fn split_runs_equal_a_single_run() {
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let split = Harness::new();
        split.reported(&store, &config(split.dir.path(), &["us-east-1", "us-west-2"], at(5), false));

        store.put("us-east-1", &key("us-east-1", 4, "bb"), record("us-east-1", 4, MODEL, 7, 3));
        store.put("us-west-2", &key("us-west-2", 6, "cc"), record("us-west-2", 6, "unpriced.model-v2:0", 11, 13));
        let split_final =
            split.reported(&store, &config(split.dir.path(), &["us-east-1", "us-west-2"], at(8), false));

        let once = Harness::new();
        let single = once.reported(&store, &config(once.dir.path(), &["us-east-1", "us-west-2"], at(8), false));

        assert_eq!(metrics_json(&split_final), metrics_json(&single));
        assert_eq!(single.metrics.totals.total_tokens(), 450 + 10 + 24);
        assert!(single.metrics.unpriced_models.contains("unpriced.model-v2"));
        assert_eq!(single.metrics.by_model["unpriced.model-v2"].cost, 0.0);
    }

    #[test]
    fn processed_objects_are_never_recounted() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(5), false));

        // Same key, new content: still counted once.
        store.put("us-east-1", &key("us-east-1", 3, "aa"), record("us-east-1", 3, MODEL, 9_999, 9_999));
        let report = h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(6), false));
        assert_eq!(report.metrics.totals.total_tokens(), 450);
    }

    #[test]
    fn force_reprocess_ignores_previous_snapshot() {
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        store.put("us-east-1", &key("us-east-1", 9, "bb"), record("us-east-1", 9, MODEL, 5, 5));

        let h = Harness::new();
        h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(12), false));
        // A broken previous snapshot must not block reprocessing.
        fs::write(h.snapshots.path_for(date()), "{garbage").unwrap();
        let forced = h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(12), true));

        let fresh = Harness::new();
        let single = fresh.reported(&store, &config(fresh.dir.path(), &["us-east-1"], at(12), false));
        assert_eq!(metrics_json(&forced), metrics_json(&single));
        // Hour 3 falls behind the lookback window and is pruned.
        let manifest = h.manifest("us-east-1");
        assert_eq!(manifest.processed.len(), 1);
        assert!(manifest.etag_of(&key("us-east-1", 9, "bb")).is_some());
    }

    #[test]
    fn widening_lookback_never_recounts_pruned_keys() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let first = h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(12), false));
        assert_eq!(first.metrics.totals.total_tokens(), 450);
        assert!(h.manifest("us-east-1").processed.is_empty());

        let mut wider = config(h.dir.path(), &["us-east-1"], at(13), false);
        wider.lookback = Duration::hours(12);
        let second = h.reported(&store, &wider);
        assert_eq!(second.metrics.totals.total_tokens(), 450);
        assert_eq!(second.stats.objects_processed, 0);
    }

    #[test]
    fn missing_pricing_fails_before_any_manifest_changes() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let config = config(h.dir.path(), &["us-east-1"], at(5), false);

        let err = h.run_priced(&store, &config, &MissingPricing, None).unwrap_err();
        assert_eq!(err.class(), "configuration");
        assert_eq!(store.fetch_count(), 0);
        assert_eq!(h.manifest("us-east-1"), Manifest::default());

        let report = h.reported(&store, &config);
        assert_eq!(report.metrics.totals.total_tokens(), 450);
    }

    #[test]
    fn corrupt_snapshot_without_force_is_fatal() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        fs::create_dir_all(h.dir.path().join("snapshots")).unwrap();
        fs::write(h.snapshots.path_for(date()), "{garbage").unwrap();

        let err = h
            .run(&store, &config(h.dir.path(), &["us-east-1"], at(5), false), None)
            .unwrap_err();
        assert!(matches!(err, Error::CorruptState { what: "snapshot", .. }));
    }

    #[test]
    fn verification_fault_blocks_reporting() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let first = h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(5), false));

        let mut tampered = first.clone();
        tampered.metrics.by_region.get_mut("us-east-1").unwrap().input_tokens += 1;
        let path = h.snapshots.write(&tampered).unwrap();
        let before = fs::read(&path).unwrap();

        store.put("us-east-1", &key("us-east-1", 6, "bb"), record("us-east-1", 6, MODEL, 1, 1));
        let notifier = RecordingNotifier::new(Delivery::Delivered);
        let outcome = h
            .run(&store, &config(h.dir.path(), &["us-east-1"], at(7), false), Some(&notifier))
            .unwrap();

        let RunOutcome::VerificationFailed(mismatches) = outcome else {
            panic!("expected a verification fault");
        };
        assert_eq!(mismatches[0].breakdown, "by_region");
        assert!(notifier.sent.borrow().is_empty());
        assert_eq!(fs::read(&path).unwrap(), before);
        // The manifest is durable regardless of the fault.
        assert_eq!(h.manifest("us-east-1").processed.len(), 2);
    }

    #[test]
    fn empty_scan_still_advances_watermark() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        let report = h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(10), false));

        assert!(report.metrics.is_empty());
        assert!(report.report_text.contains("No Bedrock usage recorded"));
        assert_eq!(
            h.manifest("us-east-1").last_processed_hour,
            Some(Utc.with_ymd_and_hms(2026, 2, 2, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn transient_failures_are_retried_and_exhaustion_is_fatal() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);

        store.fail_next(2);
        let report = h.reported(&store, &config(h.dir.path(), &["us-east-1"], at(5), false));
        assert_eq!(report.metrics.totals.total_tokens(), 450);

        let other = Harness::new();
        store.fail_next(10);
        let err = other
            .run(&store, &config(other.dir.path(), &["us-east-1"], at(5), false), None)
            .unwrap_err();
        assert_eq!(err.class(), "transient-retry-exhausted");
        assert!(other.manifest("us-east-1").processed.is_empty());
        assert!(other.snapshots.read(date()).unwrap().is_none());
    }

    #[test]
    fn ambiguous_delivery_is_a_warning() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        put_scenario(&store);
        let notifier = RecordingNotifier::new(Delivery::Ambiguous("webhook answered 200 with \"queued\"".into()));

        let outcome = h
            .run(&store, &config(h.dir.path(), &["us-east-1"], at(5), false), Some(&notifier))
            .unwrap();
        let RunOutcome::Reported { delivery_warnings, .. } = outcome else {
            panic!("verification failed");
        };
        assert_eq!(delivery_warnings.len(), 1);
    }

    #[test]
    fn notifications_can_be_disabled() {
        let h = Harness::new();
        let store = MemoryObjectStore::default();
        let notifier = RecordingNotifier::new(Delivery::Delivered);
        let mut config = config(h.dir.path(), &["us-east-1"], at(5), false);
        config.notify = false;

        h.run(&store, &config, Some(&notifier)).unwrap();
        assert!(notifier.sent.borrow().is_empty());
    }
}
