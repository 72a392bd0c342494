//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes
//! - Track consecutive failures
//! - Trigger state transition on threshold breach
//! - Own the per-backend active-connection counters
//!
//! # Design Decisions
//! - Connection errors, timeouts and retryable 5xx count as failures
//! - 4xx are NOT failures (client error, not backend)
//! - Per-backend state, so request tasks never share a global lock

use std::ops::Deref;
use std::sync::Arc;

use tokio::time::Instant;

use crate::health::state::{Admission, BackendSnapshot, BackendState, HealthTransition};
use crate::load_balancer::backend::{Backend, BackendId};
use crate::load_balancer::registry::BackendRegistry;
use crate::observability::metrics;

/// Result of one request as seen by the health tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Owner and only writer of every [`BackendState`].
#[derive(Debug)]
pub struct HealthTracker {
    registry: Arc<BackendRegistry>,
    states: Vec<BackendState>,
}

impl HealthTracker {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        let states = registry.iter().map(|_| BackendState::new()).collect();
        Self { registry, states }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn entry(&self, id: BackendId) -> Option<(&Backend, &BackendState)> {
        Some((self.registry.get(id)?, self.states.get(id.index())?))
    }

    /// Feed a request outcome into the backend's state machine.
    pub fn record_outcome(&self, id: BackendId, outcome: Outcome) {
        self.record_outcome_at(id, outcome, Instant::now());
    }

    pub(crate) fn record_outcome_at(&self, id: BackendId, outcome: Outcome, now: Instant) {
        let Some((backend, state)) = self.entry(id) else {
            return;
        };

        let transition = match outcome {
            Outcome::Success => state.record_success(backend, now),
            Outcome::Failure => state.record_failure(backend, now),
        };

        match transition {
            Some(HealthTransition::Ejected) => {
                tracing::warn!(
                    backend = %backend,
                    max_fails = backend.max_fails,
                    fail_timeout = ?backend.fail_timeout,
                    "Backend ejected after consecutive failures"
                );
                metrics::record_backend_health(backend, false);
            }
            Some(HealthTransition::Recovered) => {
                tracing::info!(backend = %backend, "Backend recovered");
                metrics::record_backend_health(backend, true);
            }
            None => {}
        }
    }

    /// Whether the backend may receive a new request right now.
    pub fn is_eligible(&self, id: BackendId) -> bool {
        self.is_eligible_at(id, Instant::now())
    }

    pub(crate) fn is_eligible_at(&self, id: BackendId, now: Instant) -> bool {
        self.entry(id)
            .is_some_and(|(backend, state)| state.is_eligible(backend, now))
    }

    pub fn increment_active(&self, id: BackendId) {
        if let Some(state) = self.states.get(id.index()) {
            state.increment_active();
        }
    }

    pub fn decrement_active(&self, id: BackendId) {
        if let Some(state) = self.states.get(id.index()) {
            state.decrement_active();
        }
    }

    pub fn active_connections(&self, id: BackendId) -> usize {
        self.states
            .get(id.index())
            .map_or(0, BackendState::active_connections)
    }

    /// Admit the backend for one request and take an active-connection slot.
    ///
    /// Returns `None` when the backend is ineligible, its probe slot is taken,
    /// or it is at its connection ceiling.
    pub(crate) fn try_lease(
        self: &Arc<Self>,
        id: BackendId,
        now: Instant,
    ) -> Option<BackendConnectionGuard> {
        let (backend, state) = self.entry(id)?;
        if !state.try_increment_active(backend.max_connections) {
            return None;
        }
        match state.try_admit(backend, now) {
            Some(admission) => {
                metrics::record_active_connections(backend, state.active_connections());
                Some(BackendConnectionGuard {
                    tracker: Arc::clone(self),
                    id,
                    probe_pending: admission == Admission::Probe,
                    recorded: None,
                })
            }
            None => {
                state.decrement_active();
                None
            }
        }
    }

    pub fn snapshot(&self, id: BackendId) -> Option<BackendSnapshot> {
        self.states.get(id.index()).map(BackendState::snapshot)
    }

    /// Snapshot of every backend, in registry order.
    pub fn snapshots(&self) -> Vec<(BackendId, BackendSnapshot)> {
        self.registry
            .iter()
            .zip(&self.states)
            .map(|(backend, state)| (backend.id, state.snapshot()))
            .collect()
    }

    /// Sum of the active counters of all backends.
    pub fn total_active(&self) -> usize {
        self.states.iter().map(BackendState::active_connections).sum()
    }
}

/// A RAII guard for one request's claim on a backend.
///
/// Holds one active-connection slot for its lifetime. A probe claim that was
/// never resolved by an outcome is released on drop.
#[derive(Debug)]
pub struct BackendConnectionGuard {
    tracker: Arc<HealthTracker>,
    id: BackendId,
    probe_pending: bool,
    recorded: Option<Outcome>,
}

impl BackendConnectionGuard {
    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn is_probe(&self) -> bool {
        self.probe_pending
    }

    /// Record the request outcome against this backend.
    pub fn record(&mut self, outcome: Outcome) {
        self.tracker.record_outcome(self.id, outcome);
        self.probe_pending = false;
        self.recorded = Some(outcome);
    }

    /// Outcome most recently recorded through this guard.
    pub fn recorded(&self) -> Option<Outcome> {
        self.recorded
    }
}

impl Deref for BackendConnectionGuard {
    type Target = Backend;

    fn deref(&self) -> &Self::Target {
        // Guards are only minted for ids present in the registry.
        &self.tracker.registry.as_slice()[self.id.index()]
    }
}

impl Drop for BackendConnectionGuard {
    fn drop(&mut self) {
        if let Some((backend, state)) = self.tracker.entry(self.id) {
            if self.probe_pending {
                state.abandon_probe();
            }
            state.decrement_active();
            metrics::record_active_connections(backend, state.active_connections());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::health::state::HealthStatus;
    use std::time::Duration;

    fn tracker(max_fails: u32) -> Arc<HealthTracker> {
        let mut config = BackendConfig::new("127.0.0.1", 9000);
        config.max_fails = max_fails;
        config.max_connections = 2;
        let registry = Arc::new(BackendRegistry::load(&[config]).unwrap());
        Arc::new(HealthTracker::new(registry))
    }

    #[test]
    fn record_outcome_drives_state() {
        let tracker = tracker(2);
        let id = BackendId::new(0);

        tracker.record_outcome(id, Outcome::Failure);
        assert!(tracker.is_eligible(id));
        tracker.record_outcome(id, Outcome::Failure);
        assert!(!tracker.is_eligible(id));
        assert_eq!(tracker.snapshot(id).unwrap().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn guard_releases_active_slot() {
        let tracker = tracker(1);
        let id = BackendId::new(0);
        let now = Instant::now();

        let g1 = tracker.try_lease(id, now).unwrap();
        let g2 = tracker.try_lease(id, now).unwrap();
        assert_eq!(tracker.active_connections(id), 2);
        assert!(tracker.try_lease(id, now).is_none(), "ceiling reached");
        assert_eq!(tracker.active_connections(id), 2);

        drop(g1);
        drop(g2);
        assert_eq!(tracker.active_connections(id), 0);
    }

    #[test]
    fn dropped_probe_guard_frees_probe() {
        let tracker = tracker(1);
        let id = BackendId::new(0);
        let t0 = Instant::now();
        tracker.record_outcome_at(id, Outcome::Failure, t0);

        let probe_at = t0 + Duration::from_secs(11);
        let guard = tracker.try_lease(id, probe_at).unwrap();
        assert!(guard.is_probe());
        assert!(tracker.try_lease(id, probe_at).is_none());
        assert_eq!(tracker.active_connections(id), 1);

        drop(guard);
        assert!(tracker.try_lease(id, probe_at).is_some());
    }

    #[test]
    fn explicit_counters() {
        let tracker = tracker(1);
        let id = BackendId::new(0);
        tracker.increment_active(id);
        tracker.increment_active(id);
        tracker.decrement_active(id);
        assert_eq!(tracker.active_connections(id), 1);
        tracker.decrement_active(id);
        tracker.decrement_active(id);
        assert_eq!(tracker.total_active(), 0);
    }
}
