use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use tracing::debug;
use ureq::http::Response;
use ureq::{Agent, Body};

use super::sigv4::{self, Credentials};
use super::{ObjectEntry, ObjectStore};
use crate::error::TransportError;

/// Largest object body read into memory.
const MAX_OBJECT_BYTES: u64 = 256 * 1024 * 1024;

static CONTENTS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Contents>(.*?)</Contents>").expect("contents pattern"));
static KEY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<Key>(.*?)</Key>").expect("key pattern"));
static ETAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<ETag>(.*?)</ETag>").expect("etag pattern"));
static TRUNCATED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<IsTruncated>\s*true\s*</IsTruncated>").expect("truncated pattern"));
static NEXT_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<NextContinuationToken>(.*?)</NextContinuationToken>").expect("token pattern")
});
static ERROR_CODE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<Code>(.*?)</Code>").expect("code pattern"));

/// S3 buckets read over signed HTTP, one bucket per region.
///
/// Without an endpoint requests go virtual-hosted to
/// `<bucket>.s3.<region>.amazonaws.com`; with one (MinIO, LocalStack) they
/// are path-style against it.
pub struct S3ObjectStore {
    agent: Agent,
    buckets: BTreeMap<String, String>,
    credentials: Credentials,
    endpoint: Option<String>,
}

#[derive(Debug, Default, PartialEq)]
struct ListPage {
    entries: Vec<ObjectEntry>,
    next_token: Option<String>,
}

impl S3ObjectStore {
    pub fn new(
        buckets: BTreeMap<String, String>,
        credentials: Credentials,
        endpoint: Option<String>,
        timeout: Duration,
    ) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            buckets,
            credentials,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
        }
    }

    fn bucket(&self, region: &str) -> Result<&str, TransportError> {
        self.buckets
            .get(region)
            .map(String::as_str)
            .ok_or_else(|| TransportError::permanent("resolve bucket", format!("no bucket configured for {region}")))
    }

    /// (base url, host, canonical path) for an already encoded key path.
    fn target(&self, region: &str, bucket: &str, key_path: &str) -> (String, String, String) {
        match &self.endpoint {
            Some(endpoint) => {
                let host = endpoint
                    .split_once("://")
                    .map_or(endpoint.as_str(), |(_, rest)| rest)
                    .to_string();
                (endpoint.clone(), host, format!("/{bucket}/{key_path}"))
            }
            None => {
                let host = format!("{bucket}.s3.{region}.amazonaws.com");
                (format!("https://{host}"), host, format!("/{key_path}"))
            }
        }
    }

    fn get(
        &self,
        op: &str,
        region: &str,
        key_path: &str,
        query: &str,
    ) -> Result<Response<Body>, TransportError> {
        let bucket = self.bucket(region)?;
        let (base, host, path) = self.target(region, bucket, key_path);
        let headers = sigv4::sign_get(&self.credentials, region, &host, &path, query, Utc::now())?;

        let url = if query.is_empty() {
            format!("{base}{path}")
        } else {
            format!("{base}{path}?{query}")
        };
        let mut request = self.agent.get(&url);
        for (name, value) in &headers {
            request = request.header(*name, value.as_str());
        }
        let mut response = request.call().map_err(|e| TransportError::from_http(op, e))?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(response);
        }
        let body = response.body_mut().read_to_string().unwrap_or_default();
        Err(classify_status(op, status, &body))
    }
}

/// 403/404 and other client errors are permanent; throttling and server
/// errors, including S3's `SlowDown` code, are transient.
fn classify_status(op: &str, status: u16, body: &str) -> TransportError {
    let code = ERROR_CODE
        .captures(body)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    match code.as_str() {
        "SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable" => {
            TransportError::transient(op, format!("HTTP {status}: {code}"))
        }
        _ => TransportError::from_status(op, status, &code),
    }
}

fn xml_unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find(';') else {
            out.push_str(tail);
            rest = "";
            break;
        };
        let entity = &tail[1..end];
        let decoded = match entity {
            "amp" => Some('&'),
            "lt" => Some('<'),
            "gt" => Some('>'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .map(|hex| u32::from_str_radix(hex, 16).ok())
                .unwrap_or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..=end]),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}

fn parse_list_page(body: &str) -> Result<ListPage, TransportError> {
    if !body.contains("<ListBucketResult") {
        return Err(TransportError::permanent("list", "response is not a ListBucketResult"));
    }

    let mut page = ListPage::default();
    for contents in CONTENTS.captures_iter(body) {
        let item = &contents[1];
        let Some(key) = KEY.captures(item).map(|c| xml_unescape(&c[1])) else {
            continue;
        };
        let etag = ETAG
            .captures(item)
            .map(|c| xml_unescape(&c[1]).trim_matches('"').to_string())
            .unwrap_or_default();
        page.entries.push(ObjectEntry { key, etag });
    }

    if TRUNCATED.is_match(body) {
        let token = NEXT_TOKEN
            .captures(body)
            .map(|c| xml_unescape(c[1].trim()))
            .filter(|t| !t.is_empty())
            .ok_or_else(|| TransportError::permanent("list", "truncated listing without a continuation token"))?;
        page.next_token = Some(token);
    }
    Ok(page)
}

impl ObjectStore for S3ObjectStore {
    fn list(&self, region: &str, prefix: &str) -> Result<Vec<ObjectEntry>, TransportError> {
        let op = format!("list {region}:{prefix}");
        let mut entries = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0u32;

        loop {
            let mut params = vec![("list-type", "2"), ("prefix", prefix)];
            if let Some(t) = &token {
                params.push(("continuation-token", t.as_str()));
            }
            let query = sigv4::canonical_query(&params);
            let mut response = self.get(&op, region, "", &query)?;
            let body = response
                .body_mut()
                .read_to_string()
                .map_err(|e| TransportError::from_http(op.as_str(), e))?;

            let page = parse_list_page(&body)?;
            pages += 1;
            entries.extend(page.entries);
            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        debug!(region, prefix, pages, objects = entries.len(), "listed bucket prefix");
        Ok(entries)
    }

    fn fetch(&self, region: &str, key: &str) -> Result<Vec<u8>, TransportError> {
        let op = format!("fetch {region}:{key}");
        let mut response = self.get(&op, region, &sigv4::uri_encode(key, false), "")?;
        response
            .body_mut()
            .with_config()
            .limit(MAX_OBJECT_BYTES)
            .read_to_vec()
            .map_err(|e| TransportError::from_http(op.as_str(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/">
  <Name>bedrock-logs</Name>
  <Prefix>AWSLogs/</Prefix>
  <KeyCount>2</KeyCount>
  <IsTruncated>true</IsTruncated>
  <NextContinuationToken>1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=</NextContinuationToken>
  <Contents>
    <Key>AWSLogs/1/BedrockModelInvocationLogs/us-east-1/2026/02/02/03/a.json.gz</Key>
    <LastModified>2026-02-02T03:05:00.000Z</LastModified>
    <ETag>&quot;9b2cf535f27731c974343645a3985328&quot;</ETag>
    <Size>120</Size>
  </Contents>
  <Contents>
    <Key>AWSLogs/1/odd &amp; name.json</Key>
    <ETag>"abc-2"</ETag>
  </Contents>
</ListBucketResult>"#;

    #[test]
    fn parses_a_truncated_listing_page() {
        let page = parse_list_page(PAGE).unwrap();
        assert_eq!(page.entries.len(), 2);
        assert_eq!(
            page.entries[0].key,
            "AWSLogs/1/BedrockModelInvocationLogs/us-east-1/2026/02/02/03/a.json.gz"
        );
        assert_eq!(page.entries[0].etag, "9b2cf535f27731c974343645a3985328");
        assert_eq!(page.entries[1].key, "AWSLogs/1/odd & name.json");
        assert_eq!(page.entries[1].etag, "abc-2");
        assert_eq!(
            page.next_token.as_deref(),
            Some("1ueGcxLPRx1Tr/XYExHnhbYLgveDs2J/wm36Hy4vbOwM=")
        );
    }

    #[test]
    fn last_page_and_bad_bodies() {
        let last = "<ListBucketResult><IsTruncated>false</IsTruncated></ListBucketResult>";
        assert_eq!(parse_list_page(last).unwrap(), ListPage::default());

        let err = parse_list_page("<html>captive portal</html>").unwrap_err();
        assert!(!err.is_transient());

        let no_token = "<ListBucketResult><IsTruncated>true</IsTruncated></ListBucketResult>";
        assert!(parse_list_page(no_token).is_err());
    }

    #[test]
    fn status_classes() {
        let denied = "<Error><Code>AccessDenied</Code><Message>Access Denied</Message></Error>";
        assert!(!classify_status("list", 403, denied).is_transient());
        assert!(!classify_status("fetch", 404, "<Error><Code>NoSuchKey</Code></Error>").is_transient());
        assert!(classify_status("list", 503, "<Error><Code>SlowDown</Code></Error>").is_transient());
        assert!(classify_status("list", 500, "").is_transient());
        assert!(classify_status("list", 400, "<Error><Code>RequestTimeout</Code></Error>").is_transient());
        assert!(!classify_status("list", 400, "<Error><Code>ExpiredToken</Code></Error>").is_transient());
    }

    #[test]
    fn entities_decode() {
        assert_eq!(xml_unescape("a&amp;b&lt;&#x41;&#66;&bogus;"), "a&b<AB&bogus;");
        assert_eq!(xml_unescape("tail & no semicolon"), "tail & no semicolon");
    }

    #[test]
    fn endpoint_requests_are_path_style() {
        let creds = Credentials::new("AK".into(), "SK".into(), None);
        let buckets = BTreeMap::from([("us-east-1".to_string(), "logs".to_string())]);
        let virtual_hosted = S3ObjectStore::new(buckets.clone(), creds.clone(), None, Duration::from_secs(1));
        assert_eq!(
            virtual_hosted.target("us-east-1", "logs", "a/b.json"),
            (
                "https://logs.s3.us-east-1.amazonaws.com".to_string(),
                "logs.s3.us-east-1.amazonaws.com".to_string(),
                "/a/b.json".to_string()
            )
        );

        let minio = S3ObjectStore::new(buckets, creds, Some("http://127.0.0.1:9000/".into()), Duration::from_secs(1));
        assert_eq!(
            minio.target("us-east-1", "logs", "a/b.json"),
            (
                "http://127.0.0.1:9000".to_string(),
                "127.0.0.1:9000".to_string(),
                "/logs/a/b.json".to_string()
            )
        );
        assert!(!minio.fetch("eu-west-1", "x").unwrap_err().is_transient());
    }

    #[test]
    fn unreachable_endpoint_is_transient() {
        let creds = Credentials::new("AK".into(), "SK".into(), None);
        let buckets = BTreeMap::from([("us-east-1".to_string(), "logs".to_string())]);
        let store = S3ObjectStore::new(buckets, creds, Some("http://127.0.0.1:9".into()), Duration::from_secs(2));
        assert!(store.list("us-east-1", "AWSLogs/").unwrap_err().is_transient());
    }
}
