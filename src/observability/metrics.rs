//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define balancer metrics (requests, attempts, health, pool, limits)
//! - Expose Prometheus-compatible metrics endpoint
//! - Track per-backend and aggregate metrics
//!
//! # Metrics
//! - `balancer_requests_total` (counter): client requests by method, status
//! - `balancer_request_duration_seconds` (histogram): end-to-end latency
//! - `balancer_attempts_total` (counter): attempts by backend, outcome
//! - `balancer_active_connections` (gauge): in-flight requests per backend
//! - `balancer_backend_healthy` (gauge): 1=healthy, 0=ejected
//! - `balancer_pool_checkouts_total` (counter): checkouts by backend, reused
//! - `balancer_client_rejections_total` (counter): per-client limit rejections
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests and
//!   deployments without the exporter pay nothing
//! - Labels for backend address, method, status code

use std::net::SocketAddr;

use ::metrics::{counter, gauge, histogram};
use axum::http::{Method, StatusCode};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tokio::time::Instant;

use crate::load_balancer::backend::Backend;
use crate::resilience::AttemptOutcome;

/// Install the Prometheus recorder and its scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Prometheus metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &Method, status: StatusCode, started: Instant) {
    let method = method.to_string();
    let status = status.as_u16().to_string();
    counter!("balancer_requests_total", "method" => method.clone(), "status" => status).increment(1);
    histogram!("balancer_request_duration_seconds", "method" => method).record(started.elapsed().as_secs_f64());
}

pub fn record_attempt(backend: &Backend, outcome: AttemptOutcome) {
    let outcome = match outcome {
        AttemptOutcome::Success => "success",
        AttemptOutcome::Failure(failure) => failure.as_label(),
    };
    counter!(
        "balancer_attempts_total",
        "backend" => backend.authority.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_active_connections(backend: &Backend, active: usize) {
    gauge!("balancer_active_connections", "backend" => backend.authority.to_string()).set(active as f64);
}

pub fn record_backend_health(backend: &Backend, healthy: bool) {
    gauge!("balancer_backend_healthy", "backend" => backend.authority.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_pool_checkout(backend: &Backend, reused: bool) {
    counter!(
        "balancer_pool_checkouts_total",
        "backend" => backend.authority.to_string(),
        "reused" => if reused { "true" } else { "false" }
    )
    .increment(1);
}

pub fn record_client_rejected() {
    counter!("balancer_client_rejections_total").increment(1);
}
