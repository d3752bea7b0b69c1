//! Bounded retry with exponential backoff for transport calls.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::error::{Error, Result, TransportError};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            backoff_factor: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay after failed attempt `attempt` (1-indexed).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let ms = self.base_delay_ms as f64 * self.backoff_factor.powi((attempt - 1) as i32);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }
}

/// Run `call` until it succeeds, fails permanently, or runs out of attempts.
///
/// Permanent failures are returned on the first occurrence.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    op: &str,
    mut call: impl FnMut() -> std::result::Result<T, TransportError>,
) -> Result<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call() {
            Ok(v) => return Ok(v),
            Err(e) if !e.is_transient() => return Err(Error::PermanentTransport(e)),
            Err(e) if attempt >= max_attempts => {
                return Err(Error::RetriesExhausted {
                    op: op.to_string(),
                    attempts: attempt,
                    last: e,
                })
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    op,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                std::thread::sleep(delay);
            }
        }
    }
}
