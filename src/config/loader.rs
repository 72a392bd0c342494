//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::BalancerConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

impl From<Vec<ValidationError>> for ConfigError {
    fn from(errors: Vec<ValidationError>) -> Self {
        ConfigError::Validation(errors)
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<BalancerConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<BalancerConfig, ConfigError> {
    let config: BalancerConfig = toml::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_document() {
        let config = parse_config(
            r#"
            [listener]
            bind_address = "127.0.0.1:8080"

            [upstream]
            read_timeout_ms = 500
            next_upstream_tries = 2

            [keepalive]
            pool_size = 4

            [limits]
            max_client_connections = 20

            [[backends]]
            host = "10.0.0.1"
            port = 80
            weight = 95
            max_fails = 2
            fail_timeout_ms = 10000

            [[backends]]
            host = "backend-b.internal"
            port = 8080
            "#,
        )
        .unwrap();

        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.backends[0].weight, 95);
        assert_eq!(config.backends[1].weight, 1);
        assert_eq!(config.backends[1].max_fails, 1);
        assert_eq!(config.upstream.read_timeout_ms, 500);
        assert_eq!(config.upstream.next_upstream_tries, 2);
        assert_eq!(config.upstream.next_upstream_timeout_ms, 6_000);
        assert_eq!(config.keepalive.pool_size, 4);
        assert_eq!(config.limits.max_client_connections, 20);
    }

    #[test]
    fn validation_errors_are_reported() {
        let err = parse_config(
            r#"
            [[backends]]
            host = "10.0.0.1"
            port = 80
            weight = 0
            "#,
        )
        .unwrap_err();

        assert!(matches!(err, ConfigError::Validation(_)));
        assert!(err.to_string().contains("weight must be positive"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        let err = parse_config("[[backends]\nhost=").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
