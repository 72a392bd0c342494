//! Response handling and transformation.
//!
//! # Responsibilities
//! - Transform backend response for client
//! - Stream the backend body with a read timeout between frames
//! - Return the upstream connection to the pool once the body completes
//! - Report mid-stream failures to passive health
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Hop-by-hop headers stripped automatically
//! - Once headers are sent the response is committed; a mid-stream failure
//!   aborts the client response instead of retrying

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::Version;
use axum::response::Response;
use hyper::body::{Body as HttpBody, Frame, Incoming, SizeHint};
use tokio::time::{Instant, Sleep};

use crate::health::{BackendConnectionGuard, Outcome};
use crate::net::connection::UpstreamConnection;
use crate::net::pool::ConnectionPool;
use crate::security::headers::{strip_hop_by_hop, wants_close};

/// Error surfaced to the client connection when the upstream body fails.
#[derive(Debug, thiserror::Error)]
pub enum ProxyBodyError {
    #[error("upstream body error: {0}")]
    Upstream(#[from] hyper::Error),

    #[error("upstream read timed out after {0:?}")]
    ReadTimeout(Duration),
}

/// Streaming body that owns the upstream connection and backend lease
/// until the last frame has been forwarded.
pub struct ProxyBody {
    inner: Incoming,
    connection: Option<UpstreamConnection>,
    guard: Option<BackendConnectionGuard>,
    pool: Arc<ConnectionPool>,
    reusable: bool,
    read_timeout: Duration,
    timer: Pin<Box<Sleep>>,
    rearm: bool,
    done: bool,
}

impl ProxyBody {
    pub fn new(
        inner: Incoming,
        connection: UpstreamConnection,
        guard: BackendConnectionGuard,
        pool: Arc<ConnectionPool>,
        reusable: bool,
        read_timeout: Duration,
    ) -> Self {
        let mut body = Self {
            inner,
            connection: Some(connection),
            guard: Some(guard),
            pool,
            reusable,
            read_timeout,
            timer: Box::pin(tokio::time::sleep(read_timeout)),
            rearm: true,
            done: false,
        };
        if body.inner.is_end_stream() {
            body.complete();
        }
        body
    }

    fn complete(&mut self) {
        self.done = true;
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection, self.reusable);
        }
        // Dropping the guard frees the backend slot.
        self.guard = None;
    }

    fn fail(&mut self, error: &ProxyBodyError) {
        self.done = true;
        if let Some(mut guard) = self.guard.take() {
            tracing::warn!(
                backend = %guard.id(),
                address = %guard.authority,
                error = %error,
                "Upstream failed mid-response; aborting client response"
            );
            // A passed-through error response was already charged.
            if guard.recorded() != Some(Outcome::Failure) {
                guard.record(Outcome::Failure);
            }
        }
        self.connection = None;
    }
}

impl HttpBody for ProxyBody {
    type Data = Bytes;
    type Error = ProxyBodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(None);
        }
        if this.rearm {
            this.timer.as_mut().reset(Instant::now() + this.read_timeout);
            this.rearm = false;
        }

        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                this.rearm = true;
                if this.inner.is_end_stream() {
                    this.complete();
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(e))) => {
                let error = ProxyBodyError::Upstream(e);
                this.fail(&error);
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.timer.as_mut().poll(cx).is_pending() {
                    return Poll::Pending;
                }
                let error = ProxyBodyError::ReadTimeout(this.read_timeout);
                this.fail(&error);
                Poll::Ready(Some(Err(error)))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.done || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ProxyBody {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            tracing::debug!(
                connection_id = %connection.id(),
                "Client stopped reading response; discarding upstream connection"
            );
        }
    }
}

/// Turn a committed backend response into the client response.
pub fn into_client_response(
    response: Response<Incoming>,
    connection: UpstreamConnection,
    guard: BackendConnectionGuard,
    pool: Arc<ConnectionPool>,
    read_timeout: Duration,
) -> Response<Body> {
    let (mut parts, incoming) = response.into_parts();
    let reusable = parts.version == Version::HTTP_11 && !wants_close(&parts.headers);
    strip_hop_by_hop(&mut parts.headers);

    let body = ProxyBody::new(incoming, connection, guard, pool, reusable, read_timeout);
    Response::from_parts(parts, Body::new(body))
}
