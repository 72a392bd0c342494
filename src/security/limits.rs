//! Per-client concurrency limits.
//!
//! # Responsibilities
//! - Count in-flight requests per client IP
//! - Reject requests beyond the ceiling before any backend is selected
//! - Collect idle zero-count entries after a grace period
//!
//! # Design Decisions
//! - The permit lives as long as the response body, not only the handler
//! - Entries are sharded in a `DashMap`; no lock is held across `.await`
//! - Rejection is an immediate 503, never a queue

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use hyper::body::{Body as HttpBody, Frame, SizeHint};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::ClientLimitConfig;
use crate::observability::metrics;

#[derive(Debug)]
struct ClientCounter {
    active: usize,
    last_active: Instant,
}

/// Per-IP in-flight request counters.
#[derive(Debug)]
pub struct ClientLimiter {
    counters: DashMap<IpAddr, ClientCounter>,
    max_per_client: usize,
    idle_grace: Duration,
}

impl ClientLimiter {
    pub fn new(config: &ClientLimitConfig) -> Self {
        Self {
            counters: DashMap::new(),
            max_per_client: config.max_client_connections,
            idle_grace: config.idle_grace(),
        }
    }

    /// Take a slot for `client`, or `None` when its ceiling is reached.
    pub fn try_acquire(self: &Arc<Self>, client: IpAddr) -> Option<ClientPermit> {
        let mut counter = self.counters.entry(client).or_insert_with(|| ClientCounter {
            active: 0,
            last_active: Instant::now(),
        });
        if counter.active >= self.max_per_client {
            return None;
        }
        counter.active += 1;
        counter.last_active = Instant::now();
        Some(ClientPermit {
            limiter: Arc::clone(self),
            client,
        })
    }

    fn release(&self, client: IpAddr) {
        if let Some(mut counter) = self.counters.get_mut(&client) {
            counter.active = counter.active.saturating_sub(1);
            counter.last_active = Instant::now();
        }
    }

    /// In-flight requests currently counted for `client`.
    pub fn active(&self, client: IpAddr) -> usize {
        self.counters.get(&client).map_or(0, |c| c.active)
    }

    /// Number of clients with a live counter entry.
    pub fn tracked_clients(&self) -> usize {
        self.counters.len()
    }

    /// Drop entries that are at zero and idle past the grace period.
    pub fn sweep(&self) -> usize {
        let before = self.counters.len();
        self.counters
            .retain(|_, c| c.active > 0 || c.last_active.elapsed() < self.idle_grace);
        before - self.counters.len()
    }

    /// Periodically sweep until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep();
                    if removed > 0 {
                        tracing::debug!(removed, remaining = self.tracked_clients(), "Swept idle client counters");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::debug!("Client limiter sweeper exiting");
                    break;
                }
            }
        }
    }
}

/// One counted in-flight request; released on drop.
#[derive(Debug)]
pub struct ClientPermit {
    limiter: Arc<ClientLimiter>,
    client: IpAddr,
}

impl Drop for ClientPermit {
    fn drop(&mut self) {
        self.limiter.release(self.client);
    }
}

/// Response body that keeps the client's permit until streaming ends.
struct PermitBody {
    inner: Body,
    _permit: ClientPermit,
}

impl HttpBody for PermitBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        Pin::new(&mut self.inner).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Middleware enforcing the per-client ceiling.
pub async fn client_limit_middleware(
    State(limiter): State<Arc<ClientLimiter>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client = addr.ip();
    let Some(permit) = limiter.try_acquire(client) else {
        tracing::warn!(client = %client, limit = limiter.max_per_client, "Client connection limit exceeded");
        metrics::record_client_rejected();
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many concurrent requests").into_response();
    };

    next.run(request).await.map(|body| {
        Body::new(PermitBody {
            inner: body,
            _permit: permit,
        })
    })
}
