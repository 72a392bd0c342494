//! Upstream connection establishment and identity.
//!
//! # Responsibilities
//! - Open TCP connections to backends under a connect timeout
//! - Perform the HTTP/1.1 client handshake and drive the connection task
//! - Generate unique connection IDs for tracing
//! - Count requests served per connection

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::client::conn::TrySendError;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::load_balancer::backend::{Backend, BackendId};

/// Source of connection IDs; only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upstream-{}", self.0)
    }
}

/// Error establishing an upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connect failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] hyper::Error),
}

/// A persistent HTTP/1.1 connection to one backend.
///
/// Dropping it closes the connection.
#[derive(Debug)]
pub struct UpstreamConnection {
    id: ConnectionId,
    backend: BackendId,
    sender: SendRequest<Body>,
    requests: u32,
    idle_since: Instant,
}

impl UpstreamConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn backend(&self) -> BackendId {
        self.backend
    }

    /// Requests sent over this connection so far.
    pub fn requests(&self) -> u32 {
        self.requests
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub(crate) fn idle_since(&self) -> Instant {
        self.idle_since
    }

    pub(crate) fn mark_idle(&mut self) {
        self.idle_since = Instant::now();
    }

    /// Wait until the connection can carry another request.
    pub async fn ready(&mut self) -> Result<(), hyper::Error> {
        self.sender.ready().await
    }

    /// Send one request and wait for the response head.
    ///
    /// If the connection died before the request was written, the error
    /// hands the request back and it is safe to send elsewhere.
    pub async fn send(
        &mut self,
        request: Request<Body>,
    ) -> Result<Response<Incoming>, TrySendError<Request<Body>>> {
        self.requests += 1;
        self.sender.try_send_request(request).await
    }
}

/// Open a new connection to `backend`.
pub async fn connect(backend: &Backend, connect_timeout: Duration) -> Result<UpstreamConnection, ConnectError> {
    let stream = timeout(
        connect_timeout,
        TcpStream::connect((backend.connect_host(), backend.port)),
    )
    .await
    .map_err(|_| ConnectError::Timeout(connect_timeout))??;
    stream.set_nodelay(true)?;

    let (sender, connection) = http1::handshake::<_, Body>(TokioIo::new(stream)).await?;
    let id = ConnectionId::new();

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!(connection_id = %id, error = %e, "Upstream connection closed with error");
        }
    });

    tracing::debug!(connection_id = %id, backend = %backend, "Upstream connection established");

    Ok(UpstreamConnection {
        id,
        backend: backend.id,
        sender,
        requests: 0,
        idle_since: Instant::now(),
    })
}
