//! Keep-alive connection pool.
//!
//! # Responsibilities
//! - Hand out a live connection per attempt (reuse idle, else connect)
//! - Take connections back only after a clean exchange
//! - Bound the idle set per backend and retire old or overused connections
//!
//! # Design Decisions
//! - Idle sets are created lazily and sharded in a `DashMap`, so backends
//!   never contend on one lock; no lock is held across an `.await`
//! - A connection whose state is unknown (I/O error, timeout, early drop,
//!   `Connection: close`) is never pooled; dropping it closes the socket
//! - Most recently used connection is reused first; the oldest is evicted

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::KeepaliveConfig;
use crate::load_balancer::backend::{Backend, BackendId};
use crate::net::connection::{connect, ConnectError, UpstreamConnection};
use crate::observability::metrics;

/// Per-backend pools of idle upstream connections.
#[derive(Debug)]
pub struct ConnectionPool {
    idle: DashMap<BackendId, VecDeque<UpstreamConnection>>,
    max_idle: usize,
    idle_timeout: Duration,
    max_requests: u32,
    connect_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: &KeepaliveConfig, connect_timeout: Duration) -> Self {
        Self {
            idle: DashMap::new(),
            max_idle: config.pool_size,
            idle_timeout: config.idle_timeout(),
            max_requests: config.max_requests,
            connect_timeout,
        }
    }

    /// Get a connection ready to carry a request to `backend`.
    pub async fn checkout(&self, backend: &Backend) -> Result<UpstreamConnection, ConnectError> {
        while let Some(mut conn) = self.pop_idle(backend.id) {
            // A reused connection that fails here was closed by the backend
            // while idle; it says nothing about the backend's health.
            match conn.ready().await {
                Ok(()) => {
                    tracing::trace!(connection_id = %conn.id(), backend = %backend, "Reusing pooled connection");
                    metrics::record_pool_checkout(backend, true);
                    return Ok(conn);
                }
                Err(e) => {
                    tracing::debug!(connection_id = %conn.id(), error = %e, "Discarding stale pooled connection");
                }
            }
        }

        let conn = connect(backend, self.connect_timeout).await?;
        metrics::record_pool_checkout(backend, false);
        Ok(conn)
    }

    fn pop_idle(&self, backend: BackendId) -> Option<UpstreamConnection> {
        let mut idle = self.idle.get_mut(&backend)?;
        while let Some(conn) = idle.pop_back() {
            if conn.is_closed() || conn.idle_since().elapsed() >= self.idle_timeout {
                continue;
            }
            return Some(conn);
        }
        None
    }

    /// Return a connection after an exchange.
    ///
    /// Only a `clean` exchange (complete response, no protocol error, backend
    /// willing to keep the connection) makes it eligible for reuse.
    pub fn release(&self, mut conn: UpstreamConnection, clean: bool) {
        if !clean {
            tracing::debug!(connection_id = %conn.id(), "Discarding connection after unclean exchange");
            return;
        }
        if self.max_idle == 0 || conn.is_closed() || conn.requests() >= self.max_requests {
            return;
        }

        conn.mark_idle();
        let mut idle = self.idle.entry(conn.backend()).or_default();
        if idle.len() >= self.max_idle {
            idle.pop_front();
        }
        idle.push_back(conn);
    }

    /// Number of idle connections currently pooled for `backend`.
    pub fn idle_count(&self, backend: BackendId) -> usize {
        self.idle.get(&backend).map_or(0, |idle| idle.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Keep-alive backend answering every request on a connection with "ok".
    async fn keepalive_backend(accepted: Arc<AtomicUsize>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        let n = match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => n,
                        };
                        buf.extend_from_slice(&chunk[..n]);
                        while let Some(end) = find_head_end(&buf) {
                            buf.drain(..end);
                            let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                            if socket.write_all(reply).await.is_err() {
                                return;
                            }
                        }
                    }
                });
            }
        });
        port
    }

    fn find_head_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
    }

    fn backend(port: u16) -> Backend {
        Backend::from_config(BackendId::new(0), &BackendConfig::new("127.0.0.1", port)).unwrap()
    }

    fn pool(pool_size: usize) -> ConnectionPool {
        let config = KeepaliveConfig {
            pool_size,
            ..KeepaliveConfig::default()
        };
        ConnectionPool::new(&config, Duration::from_secs(1))
    }

    async fn exchange(conn: &mut UpstreamConnection, backend: &Backend) {
        let request = Request::get("/")
            .header("host", backend.authority.as_str())
            .body(Body::empty())
            .unwrap();
        let response = conn.send(request).await.unwrap();
        let body = axum::body::to_bytes(Body::new(response.into_body()), 1024).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn clean_release_reuses_connection() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let backend = backend(keepalive_backend(accepted.clone()).await);
        let pool = pool(4);

        for _ in 0..3 {
            let mut conn = pool.checkout(&backend).await.unwrap();
            exchange(&mut conn, &backend).await;
            pool.release(conn, true);
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(backend.id), 1);
    }

    #[tokio::test]
    async fn dirty_release_discards_connection() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let backend = backend(keepalive_backend(accepted.clone()).await);
        let pool = pool(4);

        for _ in 0..2 {
            let mut conn = pool.checkout(&backend).await.unwrap();
            exchange(&mut conn, &backend).await;
            pool.release(conn, false);
            assert_eq!(pool.idle_count(backend.id), 0);
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn idle_set_is_bounded() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let backend = backend(keepalive_backend(accepted).await);
        let pool = pool(2);

        let mut held = Vec::new();
        for _ in 0..3 {
            let mut conn = pool.checkout(&backend).await.unwrap();
            exchange(&mut conn, &backend).await;
            held.push(conn);
        }
        for conn in held {
            pool.release(conn, true);
        }

        assert_eq!(pool.idle_count(backend.id), 2);
    }

    #[tokio::test]
    async fn retired_after_max_requests() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let backend = backend(keepalive_backend(accepted.clone()).await);
        let config = KeepaliveConfig {
            max_requests: 2,
            ..KeepaliveConfig::default()
        };
        let pool = ConnectionPool::new(&config, Duration::from_secs(1));

        for _ in 0..4 {
            let mut conn = pool.checkout(&backend).await.unwrap();
            exchange(&mut conn, &backend).await;
            pool.release(conn, true);
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn disabled_pool_keeps_nothing() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let backend = backend(keepalive_backend(accepted).await);
        let pool = pool(0);

        let mut conn = pool.checkout(&backend).await.unwrap();
        exchange(&mut conn, &backend).await;
        pool.release(conn, true);
        assert_eq!(pool.idle_count(backend.id), 0);
    }
}
