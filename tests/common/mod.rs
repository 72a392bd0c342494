//! Shared utilities for integration and load testing.

#![allow(dead_code)]

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http_balancer::config::{BackendConfig, BalancerConfig};
use http_balancer::health::HealthTracker;
use http_balancer::net::ConnectionPool;
use http_balancer::security::ClientLimiter;
use http_balancer::{HttpServer, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// What a mock backend does with one request.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Full response, sent after `delay`.
    Full {
        status: u16,
        body: String,
        delay: Duration,
    },
    /// Headers announcing `declared` bytes, then `sent` bytes, then close.
    Truncated { declared: usize, sent: usize },
}

impl Reply {
    pub fn status(status: u16, body: &str) -> Self {
        Reply::Full {
            status,
            body: body.to_string(),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(status: u16, body: &str, delay: Duration) -> Self {
        Reply::Full {
            status,
            body: body.to_string(),
            delay,
        }
    }
}

/// A raw-TCP backend answering every request per a programmable closure.
pub struct MockBackend {
    pub addr: SocketAddr,
    hits: Arc<AtomicU32>,
}

impl MockBackend {
    /// Requests received so far.
    pub fn hits(&self) -> u32 {
        self.hits.load(Ordering::SeqCst)
    }
}

/// Start a backend that always gives the same reply.
pub async fn start_backend(reply: Reply) -> MockBackend {
    start_programmable_backend(move |_| {
        let reply = reply.clone();
        async move { reply }
    })
    .await
}

/// Start a backend whose reply depends on the zero-based hit index.
pub async fn start_programmable_backend<F, Fut>(f: F) -> MockBackend
where
    F: Fn(u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU32::new(0));
    let f = Arc::new(f);

    let counter = Arc::clone(&hits);
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let f = Arc::clone(&f);
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                if read_request(&mut socket).await.is_none() {
                    return;
                }
                let hit = counter.fetch_add(1, Ordering::SeqCst);
                let reply = f(hit).await;
                write_reply(&mut socket, reply).await;
            });
        }
    });

    MockBackend { addr, hits }
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap()
}

async fn read_request(socket: &mut TcpStream) -> Option<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);

        let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut received = buf.len() - (end + 4);
        while received < length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            received += n;
        }
        return Some(());
    }
}

async fn write_reply(socket: &mut TcpStream, reply: Reply) {
    match reply {
        Reply::Full { status, body, delay } => {
            tokio::time::sleep(delay).await;
            let response = format!(
                "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                reason(status),
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        }
        Reply::Truncated { declared, sent } => {
            let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n");
            let _ = socket.write_all(head.as_bytes()).await;
            let _ = socket.write_all(&vec![b'x'; sent]).await;
            let _ = socket.flush().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
    let _ = socket.shutdown().await;
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

/// Balancer configuration over `backends` with test-friendly timeouts.
pub fn config_for(backends: &[SocketAddr]) -> BalancerConfig {
    let mut config = BalancerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".to_string();
    config.upstream.connect_timeout_ms = 500;
    config.upstream.read_timeout_ms = 500;
    config.upstream.next_upstream_timeout_ms = 3_000;
    config.backends = backends
        .iter()
        .map(|addr| BackendConfig::new(addr.ip().to_string(), addr.port()))
        .collect();
    config
}

/// A running balancer, stopped when dropped.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub tracker: Arc<HealthTracker>,
    pub pool: Arc<ConnectionPool>,
    pub limiter: Arc<ClientLimiter>,
    shutdown: Shutdown,
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Wait until no backend has an active connection, or give up.
    pub async fn wait_idle(&self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if self.tracker.total_active() == 0 && self.limiter.active(LOCALHOST) == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn start_proxy(config: BalancerConfig) -> TestProxy {
    let server = HttpServer::new(config).unwrap();
    let tracker = server.tracker();
    let pool = server.pool();
    let limiter = server.limiter();

    let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Shutdown::new();
    let receiver = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, receiver).await;
    });

    TestProxy {
        addr,
        tracker,
        pool,
        limiter,
        shutdown,
    }
}

/// A client that never reuses connections to the balancer.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
