use chrono::{DateTime, Utc};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::error::Result;
use crate::manifest::Manifest;
use crate::parser::{self, RecordFault};
use crate::planner::{ReportWindow, ScanPlan};
use crate::retry::{with_retry, RetryPolicy};
use crate::transport::ObjectStore;
use crate::types::{ListedObject, LogObjectKey, MetricsSnapshot, RunStats};

/// Result of listing every scan unit of one region.
#[derive(Debug, Default)]
pub struct RegionListing {
    /// Objects to ingest, in listing order.
    pub new_objects: Vec<ListedObject>,
    pub stats: RunStats,
}

/// List the plan's prefixes and keep the metadata objects the manifest has not seen.
///
/// With `force_reprocess` the manifest is not consulted: every listed object is
/// ingested again and re-recorded afterwards.
pub fn list_region(
    store: &dyn ObjectStore,
    retry: &RetryPolicy,
    region: &str,
    plan: &ScanPlan,
    manifest: &Manifest,
    force_reprocess: bool,
) -> Result<RegionListing> {
    let mut listing = RegionListing::default();

    for unit in &plan.units {
        let op = format!("list {region}:{}", unit.prefix);
        let entries = with_retry(retry, &op, || store.list(region, &unit.prefix))?;

        for entry in entries {
            listing.stats.objects_listed += 1;
            if !parser::is_metadata_object(&entry.key) {
                listing.stats.objects_filtered += 1;
                continue;
            }
            if !force_reprocess {
                if let Some(previous) = manifest.etag_of(&entry.key) {
                    if previous != entry.etag {
                        warn!(
                            region,
                            key = %entry.key,
                            previous,
                            current = %entry.etag,
                            "processed object changed since it was counted; not recounting"
                        );
                    }
                    listing.stats.objects_already_processed += 1;
                    continue;
                }
            }
            listing.new_objects.push(ListedObject {
                key: LogObjectKey {
                    region: region.to_string(),
                    key: entry.key,
                },
                etag: entry.etag,
                hour: unit.hour,
            });
        }
    }

    Ok(listing)
}

/// Fetch, parse and fold a region's new objects into a fresh snapshot, recording
/// each folded object in the manifest.
///
/// Fetching and parsing run in parallel. Folding happens only once every fetch
/// succeeded, so a transport failure leaves both the snapshot and the manifest
/// untouched for the whole region.
pub fn ingest_objects(
    store: &dyn ObjectStore,
    retry: &RetryPolicy,
    window: &ReportWindow,
    objects: &[ListedObject],
    manifest: &mut Manifest,
    seen_at: DateTime<Utc>,
) -> Result<(MetricsSnapshot, RunStats)> {
    let fetched: Vec<_> = objects
        .par_iter()
        .map(|object| -> Result<_> {
            let key = &object.key;
            let op = format!("fetch {}:{}", key.region, key.key);
            let bytes = with_retry(retry, &op, || store.fetch(&key.region, &key.key))?;
            Ok((object, parser::parse_log_object(&key.key, &bytes)))
        })
        .collect::<Result<_>>()?;

    let mut snapshot = MetricsSnapshot::new(window.date);
    let mut stats = RunStats::default();

    for (object, parsed) in fetched {
        stats.objects_processed += 1;
        let key = &object.key;

        match parsed {
            Err(e) => {
                warn!(region = %key.region, key = %key.key, error = %e, "malformed log object");
                snapshot
                    .data_quality
                    .malformed_objects
                    .insert(format!("{}:{}", key.region, key.key));
            }
            Ok(parsed) => {
                snapshot.data_quality.malformed_lines += parsed.malformed_lines;
                for raw in &parsed.records {
                    stats.records_parsed += 1;
                    match parser::extract_usage(raw, &key.region) {
                        Ok(record) if window.contains(record.timestamp) => {
                            if snapshot.add_usage(&record) {
                                stats.records_used += 1;
                            } else {
                                warn!(key = %key.key, "record would overflow the token totals");
                                snapshot.data_quality.records_invalid_tokens += 1;
                            }
                        }
                        Ok(record) => {
                            debug!(key = %key.key, timestamp = %record.timestamp, "record outside report window");
                            stats.records_out_of_range += 1;
                        }
                        Err(RecordFault::MissingTimestamp) => {
                            snapshot.data_quality.records_missing_timestamp += 1;
                        }
                        Err(RecordFault::MissingTokenCounts) => {
                            snapshot.data_quality.records_missing_tokens += 1;
                        }
                        Err(RecordFault::InvalidTokenCount) => {
                            snapshot.data_quality.records_invalid_tokens += 1;
                        }
                    }
                }
            }
        }

        // Malformed objects are recorded too: re-fetching them cannot help.
        manifest.record_processed(object, seen_at);
        snapshot.debug_assert_reconciled();
    }

    Ok((snapshot, stats))
}
