use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use ureq::Agent;

use super::{Delivery, Notifier};
use crate::error::{Result, TransportError};
use crate::retry::{with_retry, RetryPolicy};

/// Incoming-webhook endpoint (Slack style): answers `ok` once the message is posted.
pub struct WebhookNotifier {
    agent: Agent,
    url: String,
    channel: Option<String>,
    username: Option<String>,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct Payload<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

impl WebhookNotifier {
    pub fn new(
        url: String,
        channel: Option<String>,
        username: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        let agent: Agent = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            url,
            channel,
            username,
            retry,
        }
    }

    fn post_once(&self, body: &str) -> std::result::Result<Delivery, TransportError> {
        let mut response = self
            .agent
            .post(&self.url)
            .header("Content-Type", "application/json")
            .send(body)
            .map_err(|e| TransportError::from_http("post webhook", e))?;

        let status = response.status().as_u16();
        let reply = response
            .body_mut()
            .read_to_string()
            .unwrap_or_default();

        match status {
            200..=299 if reply.trim() == "ok" => Ok(Delivery::Delivered),
            200..=299 => Ok(Delivery::Ambiguous(format!(
                "webhook answered {status} with {:?} instead of \"ok\"",
                reply.trim()
            ))),
            _ => Err(TransportError::from_status("post webhook", status, &reply)),
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, text: &str) -> Result<Delivery> {
        let payload = Payload {
            text,
            channel: self.channel.as_deref(),
            username: self.username.as_deref(),
        };
        let body = serde_json::to_string(&payload)
            .map_err(|e| crate::error::Error::Config(format!("unencodable webhook payload: {e}")))?;
        debug!(bytes = body.len(), "posting report to webhook");
        with_retry(&self.retry, "post webhook", || self.post_once(&body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_omits_unset_fields() {
        let p = Payload {
            text: "hi",
            channel: None,
            username: Some("burnlog"),
        };
        assert_eq!(
            serde_json::to_string(&p).unwrap(),
            r#"{"text":"hi","username":"burnlog"}"#
        );
    }

    #[test]
    fn unreachable_endpoint_is_transient() {
        // Port 9 (discard) on localhost is not expected to accept connections.
        let notifier = WebhookNotifier::new(
            "http://127.0.0.1:9/hook".into(),
            None,
            None,
            Duration::from_secs(2),
            RetryPolicy::immediate(1),
        );
        let err = notifier.post_once("{}").unwrap_err();
        assert!(err.is_transient());
    }
}
