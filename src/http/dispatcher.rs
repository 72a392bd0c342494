//! Request dispatch and retry engine.
//!
//! # Responsibilities
//! - Run the attempt loop: select, check out, forward, classify
//! - Enforce the per-attempt read timeout and the cumulative deadline
//! - Feed every attempt outcome to passive health
//! - Hand the committed response to the streaming body
//!
//! # Data Flow
//! ```text
//! UpstreamRequest
//!     → Selector (least relative load, excluding tried backends)
//!     → ConnectionPool::checkout
//!     → send, wait for response head (read timeout)
//!     → retryable failure: record, exclude, next attempt
//!     → terminal response: record success, stream body to client
//! ```
//!
//! # Design Decisions
//! - The retry decision is made on the response head only; body bytes
//!   are never forwarded from an attempt that may still be retried
//! - Attempts are sequential and go to a different backend each time
//! - No backoff between attempts: the next backend is a different host
//! - A deadline that runs out mid-attempt ends the chain without charging
//!   the backend, which may still be within its own read timeout

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use tokio::time::Instant;

use crate::config::UpstreamConfig;
use crate::health::{BackendConnectionGuard, HealthTracker, Outcome};
use crate::http::request::UpstreamRequest;
use crate::http::response::into_client_response;
use crate::load_balancer::Selector;
use crate::net::connection::UpstreamConnection;
use crate::net::pool::ConnectionPool;
use crate::observability::metrics;
use crate::resilience::{AttemptOutcome, Deadline, FailureKind, RequestAttempt, RetryPolicy};

/// Error returned to the client when no backend produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("no backend available")]
    NoBackendAvailable { attempts: u32 },

    #[error("upstream failed after {attempts} attempt(s)")]
    Exhausted {
        attempts: u32,
        last: Option<FailureKind>,
    },
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoBackendAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Exhausted {
                last: Some(FailureKind::Timeout),
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Exhausted { .. } => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            GatewayError::NoBackendAvailable { attempts } | GatewayError::Exhausted { attempts, .. } => *attempts,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

/// Forwards requests to backends, retrying on qualifying failures.
#[derive(Debug)]
pub struct Dispatcher {
    selector: Selector,
    pool: Arc<ConnectionPool>,
    policy: RetryPolicy,
    read_timeout: Duration,
    next_upstream_timeout: Duration,
}

impl Dispatcher {
    pub fn new(tracker: Arc<HealthTracker>, pool: Arc<ConnectionPool>, config: &UpstreamConfig) -> Self {
        Self {
            selector: Selector::new(tracker),
            pool,
            policy: RetryPolicy::from_config(config),
            read_timeout: config.read_timeout(),
            next_upstream_timeout: config.next_upstream_timeout(),
        }
    }

    /// Proxy `request`, returning the first terminal backend response.
    pub async fn dispatch(&self, request: &UpstreamRequest) -> Result<Response<Body>, GatewayError> {
        let watch = DisconnectWatch::armed(request);
        let result = self.run(request).await;
        watch.disarm();
        result
    }

    async fn run(&self, request: &UpstreamRequest) -> Result<Response<Body>, GatewayError> {
        let deadline = Deadline::new(self.next_upstream_timeout);
        let mut excluded = HashSet::new();
        let mut attempts = 0u32;
        let mut last = None;

        loop {
            if attempts >= self.policy.max_attempts() || deadline.is_expired() {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path_and_query,
                    attempts,
                    elapsed = ?deadline.elapsed(),
                    "Upstream attempts exhausted"
                );
                return Err(GatewayError::Exhausted { attempts, last });
            }

            let mut guard = self.selector.select(&excluded).map_err(|_| {
                tracing::warn!(method = %request.method, path = %request.path_and_query, attempts, "No backend available");
                GatewayError::NoBackendAvailable { attempts }
            })?;
            attempts += 1;
            let started = Instant::now();

            let failure = match self.attempt(request, &guard, &deadline).await {
                Err(AttemptError::DeadlineExpired) => {
                    // The proxy's own budget ran out, not the backend's read timeout.
                    tracing::warn!(
                        method = %request.method,
                        path = %request.path_and_query,
                        backend = %guard.id(),
                        attempts,
                        elapsed = ?deadline.elapsed(),
                        "Upstream deadline expired during attempt"
                    );
                    return Err(GatewayError::Exhausted {
                        attempts,
                        last: Some(FailureKind::Timeout),
                    });
                }
                Ok((response, connection)) => {
                    let status = response.status();
                    if !self.policy.is_retryable_status(status) {
                        guard.record(Outcome::Success);
                        self.observe(RequestAttempt::new(guard.id(), started, AttemptOutcome::Success), &guard);
                        return Ok(into_client_response(
                            response,
                            connection,
                            guard,
                            Arc::clone(&self.pool),
                            self.read_timeout,
                        ));
                    }

                    let failure = FailureKind::Status(status);
                    if !self.policy.may_retry(&request.method, failure) {
                        // Not safe to replay; the backend's answer is final.
                        guard.record(Outcome::Failure);
                        self.observe(
                            RequestAttempt::new(guard.id(), started, AttemptOutcome::Failure(failure)),
                            &guard,
                        );
                        return Ok(into_client_response(
                            response,
                            connection,
                            guard,
                            Arc::clone(&self.pool),
                            self.read_timeout,
                        ));
                    }
                    drop(connection);
                    failure
                }
                Err(AttemptError::Failed(failure)) => failure,
            };

            guard.record(Outcome::Failure);
            self.observe(
                RequestAttempt::new(guard.id(), started, AttemptOutcome::Failure(failure)),
                &guard,
            );
            excluded.insert(guard.id());
            last = Some(failure);

            if !self.policy.may_retry(&request.method, failure) {
                tracing::warn!(
                    method = %request.method,
                    path = %request.path_and_query,
                    failure = %failure,
                    "Request not retryable after upstream failure"
                );
                return Err(GatewayError::Exhausted { attempts, last });
            }
        }
    }

    /// One attempt up to the response head.
    async fn attempt(
        &self,
        request: &UpstreamRequest,
        backend: &BackendConnectionGuard,
        deadline: &Deadline,
    ) -> Result<(Response<Incoming>, UpstreamConnection), AttemptError> {
        let mut upstream_request = request.to_request(backend).map_err(|e| {
            tracing::error!(backend = %backend.id(), error = %e, "Failed to build upstream request");
            FailureKind::Io
        })?;

        loop {
            let mut connection = self.checkout(backend, deadline).await?;
            let reused = connection.requests() > 0;

            let read_timeout = deadline.cap(self.read_timeout).ok_or(AttemptError::DeadlineExpired)?;
            let mut error = match tokio::time::timeout(read_timeout, connection.send(upstream_request)).await {
                Ok(Ok(response)) => return Ok((response, connection)),
                Ok(Err(error)) => error,
                Err(_) if read_timeout < self.read_timeout => return Err(AttemptError::DeadlineExpired),
                Err(_) => {
                    tracing::debug!(backend = %backend.id(), timeout = ?read_timeout, "Upstream read timed out");
                    return Err(FailureKind::Timeout.into());
                }
            };

            match error.take_message() {
                Some(unsent) if reused => {
                    tracing::debug!(
                        backend = %backend.id(),
                        connection_id = %connection.id(),
                        error = %error.error(),
                        "Pooled connection closed before the request was written"
                    );
                    upstream_request = unsent;
                }
                Some(_) => {
                    tracing::debug!(backend = %backend.id(), error = %error.error(), "Fresh connection closed before the request was written");
                    return Err(FailureKind::Connect.into());
                }
                None => {
                    tracing::debug!(
                        backend = %backend.id(),
                        connection_id = %connection.id(),
                        error = %error.error(),
                        "Upstream I/O error"
                    );
                    return Err(FailureKind::Io.into());
                }
            }
        }
    }

    async fn checkout(
        &self,
        backend: &BackendConnectionGuard,
        deadline: &Deadline,
    ) -> Result<UpstreamConnection, AttemptError> {
        let remaining = deadline.remaining().ok_or(AttemptError::DeadlineExpired)?;
        match tokio::time::timeout(remaining, self.pool.checkout(backend)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => {
                tracing::debug!(backend = %backend.id(), address = %backend.authority, error = %e, "Connect failed");
                Err(FailureKind::Connect.into())
            }
            Err(_) => Err(AttemptError::DeadlineExpired),
        }
    }

    fn observe(&self, attempt: RequestAttempt, backend: &BackendConnectionGuard) {
        let elapsed = attempt.started.elapsed();
        match attempt.outcome {
            AttemptOutcome::Success => {
                tracing::debug!(backend = %attempt.backend, address = %backend.authority, ?elapsed, "Attempt succeeded");
            }
            AttemptOutcome::Failure(failure) => {
                tracing::warn!(
                    backend = %attempt.backend,
                    address = %backend.authority,
                    failure = %failure,
                    ?elapsed,
                    "Attempt failed"
                );
            }
        }
        metrics::record_attempt(backend, attempt.outcome);
    }
}

/// Why an attempt produced no response head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptError {
    /// The backend failed; counts against its health.
    Failed(FailureKind),
    /// The request's cumulative deadline ran out first; the backend is not charged.
    DeadlineExpired,
}

impl From<FailureKind> for AttemptError {
    fn from(failure: FailureKind) -> Self {
        AttemptError::Failed(failure)
    }
}

/// Logs when a request is abandoned because the client went away.
struct DisconnectWatch {
    method: Method,
    path: String,
    armed: bool,
}

impl DisconnectWatch {
    fn armed(request: &UpstreamRequest) -> Self {
        Self {
            method: request.method.clone(),
            path: request.path_and_query.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DisconnectWatch {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(method = %self.method, path = %self.path, "Client disconnected; upstream attempt abandoned");
        }
    }
}
