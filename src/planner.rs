use chrono::{DateTime, Duration, DurationRound, NaiveDate, NaiveTime, Utc};

/// The UTC day a report covers: `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportWindow {
    pub date: NaiveDate,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReportWindow {
    pub fn for_date(date: NaiveDate) -> Self {
        let start = date.and_time(NaiveTime::MIN).and_utc();
        Self {
            date,
            start,
            end: start + Duration::days(1),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Start of the last hour bucket of the day.
    pub fn last_hour(&self) -> DateTime<Utc> {
        self.end - Duration::hours(1)
    }
}

pub fn floor_hour(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(Duration::hours(1)).unwrap_or(ts)
}

/// Where a service writes its invocation logs inside a bucket.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixLayout {
    pub log_prefix: String,
    pub account_id: Option<String>,
}

impl PrefixLayout {
    /// `[log_prefix/]AWSLogs/[account/]BedrockModelInvocationLogs/{region}/YYYY/MM/DD/HH/`
    pub fn prefix_for(&self, region: &str, hour: DateTime<Utc>) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(6);
        if !self.log_prefix.is_empty() {
            parts.push(&self.log_prefix);
        }
        parts.push("AWSLogs");
        if let Some(account) = &self.account_id {
            parts.push(account);
        }
        parts.push("BedrockModelInvocationLogs");
        parts.push(region);
        let bucket = hour.format("%Y/%m/%d/%H").to_string();
        format!("{}/{bucket}/", parts.join("/"))
    }
}

/// One hour bucket to list for one region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanUnit {
    pub hour: DateTime<Utc>,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanPlan {
    pub units: Vec<ScanUnit>,
}

impl ScanPlan {
    /// Hour of the latest unit examined; what the manifest watermark advances to.
    pub fn end_hour(&self) -> Option<DateTime<Utc>> {
        self.units.last().map(|u| u.hour)
    }
}

#[derive(Debug, Clone)]
pub struct PlanRequest<'a> {
    pub region: &'a str,
    pub window: ReportWindow,
    pub now: DateTime<Utc>,
    /// Overlap re-scanned behind the watermark to catch late-arriving objects.
    pub lookback: Duration,
    pub last_processed_hour: Option<DateTime<Utc>>,
    /// Oldest scan hour whose keys the manifest still holds.
    pub tracked_since: Option<DateTime<Utc>>,
    pub force_reprocess: bool,
    pub layout: &'a PrefixLayout,
}

/// Hour buckets to examine for one region, oldest first.
///
/// Normal runs resume at `last_processed_hour - lookback` (never before the
/// report day, nor before hours whose keys were already pruned); forced runs
/// cover the whole day. Either way the plan stops at the current hour, so the
/// watermark never claims hours not yet written.
pub fn plan_scan(req: &PlanRequest<'_>) -> ScanPlan {
    let mut start = req.window.start;
    if !req.force_reprocess {
        if let Some(last) = req.last_processed_hour {
            start = start.max(last - req.lookback);
        }
        if let Some(horizon) = req.tracked_since {
            start = start.max(horizon);
        }
    }
    let start = floor_hour(start);
    let end = req.window.last_hour().min(floor_hour(req.now));

    let mut units = Vec::new();
    let mut hour = start;
    while hour <= end {
        units.push(ScanUnit {
            hour,
            prefix: req.layout.prefix_for(req.region, hour),
        });
        hour += Duration::hours(1);
    }
    ScanPlan { units }
}
