//! Backend registry.
//!
//! # Responsibilities
//! - Build the static backend set from configuration
//! - Serve read-only lookups to every request task
//!
//! # Design Decisions
//! - Immutable after construction; shared behind `Arc` without locks
//! - Backend ids are list positions, so lookups are plain indexing

use crate::config::{BackendConfig, ConfigError};
use crate::config::validation::ValidationError;
use crate::load_balancer::backend::{Backend, BackendId};

/// The static set of backends, in configuration order.
#[derive(Debug)]
pub struct BackendRegistry {
    backends: Vec<Backend>,
}

impl BackendRegistry {
    /// Build the registry, failing on any invalid backend definition.
    pub fn load(configs: &[BackendConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::Validation(vec![ValidationError::NoBackends]));
        }

        let mut backends = Vec::with_capacity(configs.len());
        let mut errors = Vec::new();
        for (index, config) in configs.iter().enumerate() {
            match Backend::from_config(BackendId::new(index), config) {
                Ok(backend) => backends.push(backend),
                Err(e) => errors.extend(e),
            }
        }

        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        for backend in &backends {
            tracing::info!(
                backend = %backend,
                id = %backend.id,
                weight = backend.weight.get(),
                max_fails = backend.max_fails,
                fail_timeout = ?backend.fail_timeout,
                "Backend registered"
            );
        }

        Ok(Self { backends })
    }

    pub fn get(&self, id: BackendId) -> Option<&Backend> {
        self.backends.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Backend> {
        self.backends.iter()
    }

    pub fn as_slice(&self) -> &[Backend] {
        &self.backends
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_in_order() {
        let registry = BackendRegistry::load(&[
            BackendConfig::new("127.0.0.1", 9001),
            BackendConfig::new("127.0.0.1", 9002),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        let ports: Vec<u16> = registry.iter().map(|b| b.port).collect();
        assert_eq!(ports, vec![9001, 9002]);
        assert_eq!(registry.get(BackendId::new(1)).unwrap().port, 9002);
        assert!(registry.get(BackendId::new(2)).is_none());
    }

    #[test]
    fn rejects_invalid_backend() {
        let mut bad = BackendConfig::new("127.0.0.1", 9002);
        bad.weight = 0;

        let err = BackendRegistry::load(&[BackendConfig::new("127.0.0.1", 9001), bad]).unwrap_err();
        match err {
            ConfigError::Validation(errors) => {
                assert_eq!(errors, vec![ValidationError::InvalidWeight { index: 1 }]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rejects_empty_set() {
        assert!(BackendRegistry::load(&[]).is_err());
    }
}
