use std::io::Read;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::MultiGzDecoder;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::types::UsageRecord;

/// Invocation metadata files, e.g. `20260201T173052540Z_0b98d2144de6272e.json.gz`.
/// Request/response body files and the permission-check object do not match.
static METADATA_OBJECT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{8}T\d{6,9}Z_[a-f0-9]+\.json(\.gz)?$").expect("metadata object pattern")
});

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_metadata_object(key: &str) -> bool {
    let basename = key.rsplit('/').next().unwrap_or(key);
    METADATA_OBJECT.is_match(basename)
}

/// Canonical model key shared by aggregation and pricing.
///
/// Inference-profile ARNs keep their scope prefix (`us.`, `global.`, ...)
/// since each profile is priced on its own. A trailing `:N` version is dropped.
pub fn normalize_model_key(raw: &str) -> String {
    let raw = raw.trim();
    let id = if let Some((_, profile)) = raw.split_once("inference-profile/") {
        profile
    } else if raw.starts_with("arn:") {
        raw.rsplit('/').next().unwrap_or(raw)
    } else {
        raw
    };

    match id.rsplit_once(':') {
        Some((base, version))
            if !version.is_empty() && version.bytes().all(|b| b.is_ascii_digit()) =>
        {
            base.to_string()
        }
        _ => id.to_string(),
    }
}

/// The whole object could not be decoded. Individual bad lines are not errors.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("gzip decode failed: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct ParsedObject {
    pub records: Vec<Value>,
    pub malformed_lines: u64,
}

pub fn decompress(key: &str, data: &[u8]) -> Result<Vec<u8>, PayloadError> {
    if key.ends_with(".gz") || data.starts_with(&GZIP_MAGIC) {
        let mut out = Vec::new();
        MultiGzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(data.to_vec())
    }
}

fn parse_json_lines(text: &str) -> ParsedObject {
    let mut parsed = ParsedObject::default();
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<Value>(line) {
            Ok(v) => parsed.records.push(v),
            Err(_) => parsed.malformed_lines += 1,
        }
    }
    parsed
}

/// Raw records of one log object: a JSON array, a single object, or JSON lines.
pub fn parse_log_object(key: &str, data: &[u8]) -> Result<ParsedObject, PayloadError> {
    let payload = decompress(key, data)?;
    let text = String::from_utf8_lossy(&payload);
    let text = text.trim();

    if text.is_empty() {
        return Ok(ParsedObject::default());
    }
    if text.starts_with('[') {
        let records = match serde_json::from_str::<Value>(text)? {
            Value::Array(items) => items,
            other => vec![other],
        };
        return Ok(ParsedObject {
            records,
            malformed_lines: 0,
        });
    }
    if text.starts_with('{') {
        // A pretty-printed single record spans lines; fall back to JSON lines otherwise.
        if let Ok(v) = serde_json::from_str::<Value>(text) {
            return Ok(ParsedObject {
                records: vec![v],
                malformed_lines: 0,
            });
        }
    }
    Ok(parse_json_lines(text))
}

/// Why a raw record was excluded from totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFault {
    MissingTimestamp,
    MissingTokenCounts,
    /// A token count is present but negative or beyond `MAX_TOKENS_PER_RECORD`.
    InvalidTokenCount,
}

fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    // Offset-less timestamps are taken as UTC.
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Upper bound for one invocation's input or output count; anything larger is corrupt.
pub const MAX_TOKENS_PER_RECORD: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Count {
    Valid(u64),
    /// Present but negative, fractional garbage or out of range.
    Invalid,
}

fn token_count(v: Option<&Value>) -> Option<Count> {
    let n = match v? {
        Value::Number(n) => match n.as_u64() {
            Some(n) => n,
            None => {
                let f = n.as_f64()?;
                if !(0.0..=MAX_TOKENS_PER_RECORD as f64).contains(&f) {
                    return Some(Count::Invalid);
                }
                f as u64
            }
        },
        Value::String(s) => match s.trim().parse::<i128>() {
            Ok(n) => u64::try_from(n).unwrap_or(u64::MAX),
            Err(_) => return None,
        },
        _ => return None,
    };
    if n > MAX_TOKENS_PER_RECORD {
        Some(Count::Invalid)
    } else {
        Some(Count::Valid(n))
    }
}

fn first_count(usage: &Value, keys: &[&str]) -> Option<Count> {
    keys.iter().find_map(|k| token_count(usage.get(k)))
}

/// `usage` block of the response body: an object, or a list of stream events.
fn body_usage(body: &Value) -> Option<&Value> {
    match body {
        Value::Object(_) => body.get("usage"),
        Value::Array(items) => items.iter().find_map(|item| {
            item.get("message")
                .and_then(|m| m.get("usage"))
                .or_else(|| item.get("usage"))
        }),
        _ => None,
    }
}

fn str_field<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    let mut cur = v;
    for seg in path {
        cur = cur.get(seg)?;
    }
    cur.as_str().filter(|s| !s.is_empty())
}

/// Normalize one raw invocation record.
pub fn extract_usage(raw: &Value, scan_region: &str) -> Result<UsageRecord, RecordFault> {
    let timestamp = raw
        .get("timestamp")
        .and_then(parse_timestamp)
        .ok_or(RecordFault::MissingTimestamp)?;

    let mut saw_invalid = false;
    let mut valid = |c: Option<Count>| match c {
        Some(Count::Valid(n)) => Some(n),
        Some(Count::Invalid) => {
            saw_invalid = true;
            None
        }
        None => None,
    };

    let mut input_tokens = valid(token_count(raw.pointer("/input/inputTokenCount")));
    let mut output_tokens = valid(token_count(raw.pointer("/output/outputTokenCount")));
    let mut used_fallback = false;

    if input_tokens.is_none() || output_tokens.is_none() {
        if let Some(usage) = raw.pointer("/output/outputBodyJson").and_then(body_usage) {
            used_fallback = true;
            if input_tokens.is_none() {
                input_tokens = valid(first_count(usage, &["input_tokens", "inputTokens", "input_token_count"]));
            }
            if output_tokens.is_none() {
                output_tokens = valid(first_count(usage, &["output_tokens", "outputTokens", "output_token_count"]));
            }
        }
    }

    let (Some(input_tokens), Some(output_tokens)) = (input_tokens, output_tokens) else {
        return Err(if saw_invalid {
            RecordFault::InvalidTokenCount
        } else {
            RecordFault::MissingTokenCounts
        });
    };

    Ok(UsageRecord {
        timestamp,
        region: str_field(raw, &["region"]).unwrap_or(scan_region).to_string(),
        model_id: normalize_model_key(str_field(raw, &["modelId"]).unwrap_or("unknown")),
        identity_arn: str_field(raw, &["identity", "arn"]).unwrap_or("unknown").to_string(),
        input_tokens,
        output_tokens,
        used_fallback,
    })
}
