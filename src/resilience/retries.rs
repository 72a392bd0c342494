//! Retry logic.
//!
//! # Responsibilities
//! - Classify attempt outcomes (success, retryable failure)
//! - Decide whether a failed attempt may move to another backend
//!
//! # Design Decisions
//! - Connect failures are always retryable: the request never left the proxy
//! - After the request was sent, non-idempotent methods are only retried
//!   when `retry_non_idempotent` is set
//! - Retryable statuses are configurable (default 500, 502, 503, 504)
//! - Attempts are sequential; no speculative parallel retries

use std::fmt;

use axum::http::{Method, StatusCode};
use tokio::time::Instant;

use crate::config::UpstreamConfig;
use crate::load_balancer::backend::BackendId;

/// Why an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// TCP connect or handshake failed; nothing was sent.
    Connect,
    /// I/O or protocol error after the request was sent.
    Io,
    /// No response head within the read timeout.
    Timeout,
    /// The backend answered with a retryable status.
    Status(StatusCode),
}

impl FailureKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            FailureKind::Connect => "connect",
            FailureKind::Io => "io",
            FailureKind::Timeout => "timeout",
            FailureKind::Status(_) => "status",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Status(status) => write!(f, "status {}", status.as_u16()),
            other => f.write_str(other.as_label()),
        }
    }
}

/// Result of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failure(FailureKind),
}

/// Ephemeral record of one proxy attempt.
#[derive(Debug, Clone, Copy)]
pub struct RequestAttempt {
    pub backend: BackendId,
    pub started: Instant,
    pub outcome: AttemptOutcome,
}

impl RequestAttempt {
    pub fn new(backend: BackendId, started: Instant, outcome: AttemptOutcome) -> Self {
        Self { backend, started, outcome }
    }
}

/// Which failures may move a request to another backend.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    retry_statuses: Vec<StatusCode>,
    retry_non_idempotent: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        Self {
            max_attempts: config.next_upstream_tries.max(1),
            retry_statuses: config
                .retry_statuses
                .iter()
                .filter_map(|&s| StatusCode::from_u16(s).ok())
                .collect(),
            retry_non_idempotent: config.retry_non_idempotent,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether a response with `status` counts as a backend failure.
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Whether a request with `method` may be re-sent after `failure`.
    pub fn may_retry(&self, method: &Method, failure: FailureKind) -> bool {
        match failure {
            FailureKind::Connect => true,
            _ => method.is_idempotent() || self.retry_non_idempotent,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UpstreamConfig::default())
    }
}
