//! HTTP client construction and the retry decision shared by every outbound call.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;

/// Longest server-requested pause honoured from a `Retry-After` header.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl RetryDisposition {
    /// Throttling and server-side failures are transient; everything else is final.
    pub fn for_status(status: StatusCode) -> Self {
        match status {
            StatusCode::TOO_MANY_REQUESTS => Self::Retryable,
            s if s.is_server_error() => Self::Retryable,
            _ => Self::NonRetryable,
        }
    }

    /// Connection, timeout and send failures; body/decode errors are final.
    pub fn for_error(err: &reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            Self::Retryable
        } else {
            Self::NonRetryable
        }
    }
}

/// Whether a request may be sent again after the server might have applied it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replay {
    /// Reads, upserts, keyed updates and deletes: a second application changes nothing.
    Safe,
    /// Plain inserts: only retried when the server provably did not apply them.
    Unsafe,
}

impl Replay {
    pub fn status_disposition(self, status: StatusCode) -> RetryDisposition {
        match self {
            Self::Safe => RetryDisposition::for_status(status),
            Self::Unsafe if status == StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
            Self::Unsafe => RetryDisposition::NonRetryable,
        }
    }

    /// An unsafe request is only resent when the connection never opened.
    pub fn error_disposition(self, err: &reqwest::Error) -> RetryDisposition {
        match self {
            Self::Safe => RetryDisposition::for_error(err),
            Self::Unsafe if err.is_connect() => RetryDisposition::Retryable,
            Self::Unsafe => RetryDisposition::NonRetryable,
        }
    }
}

/// Delay-seconds form of `Retry-After`, capped. HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let secs: u64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
    Some(Duration::from_secs(secs).min(RETRY_AFTER_CAP))
}

/// Doubling delays from `base_delay`, never above `max_delay`, for at most `max_retries` retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn backoff(&self, attempt: usize) -> Duration {
        let shift = u32::try_from(attempt).unwrap_or(u32::MAX).min(31);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// How long to wait before retrying a failed `attempt` (0-based), or
    /// `None` when the failure is final. A server hint overrides the backoff.
    pub fn next_delay(
        &self,
        disposition: RetryDisposition,
        attempt: usize,
        server_hint: Option<Duration>,
    ) -> Option<Duration> {
        if disposition == RetryDisposition::NonRetryable || attempt >= self.max_retries {
            return None;
        }
        Some(server_hint.unwrap_or_else(|| self.backoff(attempt)))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    /// A compressed-transport client that always carries the configured timeout.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .gzip(true)
            .brotli(true);
        let builder = match &self.user_agent {
            Some(agent) => builder.user_agent(agent.as_str()),
            None => builder,
        };
        builder
            .build()
            .with_context(|| format!("building HTTP client (timeout {:?})", self.timeout))
    }
}
