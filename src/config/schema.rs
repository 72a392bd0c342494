//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the balancer.
//! All types derive Serde traits for deserialization from config files.
//! Durations are expressed in milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the load balancer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct BalancerConfig {
    /// Listener configuration (bind address, health path, body limit).
    pub listener: ListenerConfig,

    /// Backend server definitions, in selection tie-break order.
    pub backends: Vec<BackendConfig>,

    /// Upstream timeouts and retry policy.
    pub upstream: UpstreamConfig,

    /// Keep-alive connection pool settings.
    pub keepalive: KeepaliveConfig,

    /// Per-client concurrency limits.
    pub limits: ClientLimitConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Path answered locally by the balancer itself.
    pub health_path: String,

    /// Maximum buffered request body in bytes.
    pub max_body_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            health_path: "/health".to_string(),
            max_body_size: 2 * 1024 * 1024,
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Hostname or IP address of the backend.
    pub host: String,

    /// TCP port of the backend.
    pub port: u16,

    /// Relative traffic share (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Consecutive failures before ejection. Zero disables ejection.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// How long an ejected backend stays out of rotation.
    #[serde(default = "default_fail_timeout_ms")]
    pub fail_timeout_ms: u64,

    /// Maximum concurrent requests (and therefore connections) to this backend.
    #[serde(default = "default_max_backend_conns")]
    pub max_connections: usize,
}

impl BackendConfig {
    /// Backend with default weight and thresholds.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            max_fails: default_max_fails(),
            fail_timeout_ms: default_fail_timeout_ms(),
            max_connections: default_max_backend_conns(),
        }
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_fails() -> u32 {
    1
}

fn default_fail_timeout_ms() -> u64 {
    10_000
}

fn default_max_backend_conns() -> usize {
    100
}

/// Upstream timeouts and retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// TCP connect + handshake timeout per attempt.
    pub connect_timeout_ms: u64,

    /// Time allowed to wait for the response head, and between body frames.
    pub read_timeout_ms: u64,

    /// Maximum number of attempts per request, the first one included.
    pub next_upstream_tries: u32,

    /// Cumulative time budget for all attempts of one request.
    pub next_upstream_timeout_ms: u64,

    /// Response statuses treated as retryable backend failures.
    pub retry_statuses: Vec<u16>,

    /// Allow retrying non-idempotent methods after the request was sent.
    pub retry_non_idempotent: bool,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn next_upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.next_upstream_timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1_000,
            read_timeout_ms: 2_000,
            next_upstream_tries: 3,
            next_upstream_timeout_ms: 6_000,
            retry_statuses: vec![500, 502, 503, 504],
            retry_non_idempotent: false,
        }
    }
}

/// Keep-alive pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Maximum idle connections kept per backend. Zero disables pooling.
    pub pool_size: usize,

    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout_ms: u64,

    /// Requests served by one connection before it is retired.
    pub max_requests: u32,
}

impl KeepaliveConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            pool_size: 32,
            idle_timeout_ms: 60_000,
            max_requests: 1_000,
        }
    }
}

/// Per-client concurrency limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientLimitConfig {
    /// Maximum concurrent in-flight requests per client IP.
    pub max_client_connections: usize,

    /// How long an idle zero-count entry is kept before collection.
    pub idle_grace_ms: u64,

    /// Interval of the background sweep.
    pub sweep_interval_ms: u64,
}

impl ClientLimitConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for ClientLimitConfig {
    fn default() -> Self {
        Self {
            max_client_connections: 100,
            idle_grace_ms: 30_000,
            sweep_interval_ms: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable the Prometheus scrape endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
