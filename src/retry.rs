//! Exponential backoff for the directory and config endpoints.
//!
//! Only transient failures are retried. A reqwest error anywhere in the
//! source chain decides by itself (connect and timeout errors, 5xx and 429
//! retry; other statuses and decode failures do not). Anything else falls
//! back to matching the message against known transient wording.

use crate::errors::BoxError;
use log::{debug, warn};
use reqwest::StatusCode;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Resolution of one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_retries, base_delay, max_delay }
    }

    /// Fail on the first error.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    /// Pause before retry number `retry` (1-based): `base * 2^(retry-1)`,
    /// capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// The last failure of an operation that ran out of attempts or hit a
/// permanent error.
#[derive(Debug)]
pub struct RetryError {
    pub operation: &'static str,
    pub attempts: u32,
    pub last_error: BoxError,
}

impl fmt::Display for RetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.operation, self.attempts, self.last_error
        )
    }
}

impl Error for RetryError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.last_error.as_ref())
    }
}

pub async fn retry_async<T, E, F, Fut>(
    config: &RetryConfig,
    operation: &'static str,
    mut attempt: F,
) -> Result<T, RetryError>
where
    E: Into<BoxError>,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        let error: BoxError = match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    debug!("{} succeeded on attempt {}", operation, attempts);
                }
                return Ok(value);
            }
            Err(e) => e.into(),
        };

        let retries_used = attempts - 1;
        if retries_used >= config.max_retries || verdict(error.as_ref()) == Verdict::Permanent {
            return Err(RetryError { operation, attempts, last_error: error });
        }

        let delay = config.backoff(attempts);
        warn!("{} failed ({}), retrying in {:?}", operation, error, delay);
        sleep(delay).await;
    }
}

/// Whether `error` is worth another attempt.
pub fn verdict(error: &(dyn Error + 'static)) -> Verdict {
    let mut current = Some(error);
    while let Some(e) = current {
        if let Some(http) = e.downcast_ref::<reqwest::Error>() {
            return http_verdict(http);
        }
        current = e.source();
    }

    let message = chain_text(error);
    let transient = [
        "connection refused",
        "connection reset",
        "connection closed",
        "connection aborted",
        "broken pipe",
        "timed out",
        "unreachable",
        "temporarily unavailable",
        "dns error",
    ];
    if transient.iter().any(|pattern| message.contains(pattern)) {
        Verdict::Transient
    } else {
        Verdict::Permanent
    }
}

fn http_verdict(error: &reqwest::Error) -> Verdict {
    if let Some(status) = error.status() {
        return if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Verdict::Transient
        } else {
            Verdict::Permanent
        };
    }

    if error.is_decode() || error.is_builder() {
        Verdict::Permanent
    } else {
        Verdict::Transient
    }
}

fn chain_text(error: &(dyn Error + 'static)) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_lowercase()
}
