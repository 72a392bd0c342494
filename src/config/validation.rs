//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate backend definitions (weight, host/port)
//! - Validate value ranges (timeouts > 0, tries > 0, statuses are 5xx/4xx codes)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: BalancerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use axum::http::StatusCode;

use crate::config::schema::BalancerConfig;
use crate::load_balancer::backend::{Backend, BackendId};

/// A single semantic problem found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("at least one backend must be configured")]
    NoBackends,

    #[error("backend #{index}: weight must be positive")]
    InvalidWeight { index: usize },

    #[error("backend #{index}: invalid address {host:?}:{port}")]
    InvalidAddress { index: usize, host: String, port: u16 },

    #[error("backend #{index}: max_connections must be positive")]
    InvalidBackendConnections { index: usize },

    #[error("invalid bind address {0:?}")]
    InvalidBindAddress(String),

    #[error("health path {0:?} must be a literal path below '/'")]
    InvalidHealthPath(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("retry status {0} is not a valid HTTP status")]
    InvalidRetryStatus(u16),
}

/// Validate a parsed configuration, collecting every error.
pub fn validate_config(config: &BalancerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }
    let health_path = &config.listener.health_path;
    if !health_path.starts_with('/')
        || health_path.len() < 2
        || health_path.contains(['{', '}', '*'])
    {
        errors.push(ValidationError::InvalidHealthPath(
            config.listener.health_path.clone(),
        ));
    }

    if config.backends.is_empty() {
        errors.push(ValidationError::NoBackends);
    }
    for (index, backend) in config.backends.iter().enumerate() {
        if let Err(e) = Backend::from_config(BackendId::new(index), backend) {
            errors.extend(e);
        }
    }

    let upstream = &config.upstream;
    let ranges = [
        (upstream.connect_timeout_ms == 0, "upstream.connect_timeout_ms"),
        (upstream.read_timeout_ms == 0, "upstream.read_timeout_ms"),
        (upstream.next_upstream_tries == 0, "upstream.next_upstream_tries"),
        (upstream.next_upstream_timeout_ms == 0, "upstream.next_upstream_timeout_ms"),
        (config.keepalive.max_requests == 0, "keepalive.max_requests"),
        (config.limits.max_client_connections == 0, "limits.max_client_connections"),
        (config.limits.sweep_interval_ms == 0, "limits.sweep_interval_ms"),
    ];
    errors.extend(
        ranges
            .into_iter()
            .filter(|(is_zero, _)| *is_zero)
            .map(|(_, field)| ValidationError::Zero(field)),
    );

    for &status in &upstream.retry_statuses {
        if StatusCode::from_u16(status).is_err() {
            errors.push(ValidationError::InvalidRetryStatus(status));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
