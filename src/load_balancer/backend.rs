//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single configured backend server
//! - Validate host/port and weight at construction
//! - Carry the thresholds the health tracker applies to it
//!
//! A `Backend` is immutable once built; all mutable per-backend state lives
//! in [`crate::health::state::BackendState`].

use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::time::Duration;

use axum::http::uri::Authority;

use crate::config::BackendConfig;
use crate::config::validation::ValidationError;

/// Position of a backend in the registry (configuration order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(usize);

impl BackendId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend-{}", self.0)
    }
}

/// A single backend server.
#[derive(Debug, Clone)]
pub struct Backend {
    /// Registry position, also the tie-break order.
    pub id: BackendId,
    /// Hostname or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// `host:port` as sent in the upstream `Host` header.
    pub authority: Authority,
    /// Relative traffic share.
    pub weight: NonZeroU32,
    /// Consecutive failures before ejection (0 = never eject).
    pub max_fails: u32,
    /// Ejection duration.
    pub fail_timeout: Duration,
    /// Maximum concurrent requests in flight to this backend.
    pub max_connections: usize,
}

impl Backend {
    /// Build a backend from its configuration, reporting every problem found.
    pub fn from_config(id: BackendId, config: &BackendConfig) -> Result<Self, Vec<ValidationError>> {
        let mut errors = Vec::new();
        let index = id.index();

        let weight = NonZeroU32::new(config.weight);
        if weight.is_none() {
            errors.push(ValidationError::InvalidWeight { index });
        }

        let authority = parse_authority(&config.host, config.port);
        if authority.is_none() {
            errors.push(ValidationError::InvalidAddress {
                index,
                host: config.host.clone(),
                port: config.port,
            });
        }

        if config.max_connections == 0 {
            errors.push(ValidationError::InvalidBackendConnections { index });
        }

        match (weight, authority) {
            (Some(weight), Some(authority)) if errors.is_empty() => Ok(Self {
                id,
                host: config.host.clone(),
                port: config.port,
                authority,
                weight,
                max_fails: config.max_fails,
                fail_timeout: Duration::from_millis(config.fail_timeout_ms),
                max_connections: config.max_connections,
            }),
            _ => Err(errors),
        }
    }

    /// Host part usable with `TcpStream::connect`, without IPv6 brackets.
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.authority)
    }
}

fn parse_authority(host: &str, port: u16) -> Option<Authority> {
    if port == 0 || host.is_empty() || host.contains(['/', '@', ' ']) {
        return None;
    }
    let raw = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    Authority::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_from_config() {
        let mut config = BackendConfig::new("10.0.0.7", 8080);
        config.weight = 5;
        config.max_fails = 2;
        config.fail_timeout_ms = 1500;

        let backend = Backend::from_config(BackendId::new(3), &config).unwrap();
        assert_eq!(backend.id.index(), 3);
        assert_eq!(backend.authority.as_str(), "10.0.0.7:8080");
        assert_eq!(backend.weight.get(), 5);
        assert_eq!(backend.fail_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let backend = Backend::from_config(BackendId::new(0), &BackendConfig::new("::1", 80)).unwrap();
        assert_eq!(backend.authority.as_str(), "[::1]:80");
        assert_eq!(backend.connect_host(), "::1");
    }

    #[test]
    fn rejects_zero_weight_and_bad_address() {
        let mut config = BackendConfig::new("bad host", 0);
        config.weight = 0;

        let errors = Backend::from_config(BackendId::new(1), &config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.contains(&ValidationError::InvalidWeight { index: 1 }));
    }
}
