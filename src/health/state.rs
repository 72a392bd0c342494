//! Backend health state machine.
//!
//! # States
//! - Healthy: backend receives traffic
//! - Unhealthy: backend excluded from load balancing until probation
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= max_fails
//! Unhealthy → (probation): fail_timeout elapsed since last failure
//! (probation) → Healthy: the single probe request succeeds
//! (probation) → Unhealthy: the probe fails, ejection timer restarts
//! ```
//!
//! Every method takes the observation instant explicitly so the machine is
//! deterministic under test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use crate::load_balancer::backend::Backend;

/// Externally visible health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// A status change produced by an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Ejected,
    Recovered,
}

/// How a backend was admitted for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal traffic to a healthy backend.
    Regular,
    /// The single trial request of an ejected backend.
    Probe,
}

/// Point-in-time copy of a backend's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendSnapshot {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub active_connections: usize,
    pub probing: bool,
}

#[derive(Debug)]
struct HealthRecord {
    status: HealthStatus,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

/// Mutable state of one backend.
///
/// The health record sits behind its own mutex and the active counter is a
/// lone atomic, so backends never contend with each other.
#[derive(Debug)]
pub struct BackendState {
    health: Mutex<HealthRecord>,
    active: AtomicUsize,
}

impl Default for BackendState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendState {
    pub fn new() -> Self {
        Self {
            health: Mutex::new(HealthRecord {
                status: HealthStatus::Healthy,
                consecutive_failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
            active: AtomicUsize::new(0),
        }
    }

    // The record holds only counters and flags, so a panic elsewhere cannot
    // leave it logically torn.
    fn health(&self) -> MutexGuard<'_, HealthRecord> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report a failed request.
    pub fn record_failure(&self, backend: &Backend, now: Instant) -> Option<HealthTransition> {
        let mut health = self.health();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        health.last_failure = Some(now);
        health.probe_in_flight = false;

        if health.status == HealthStatus::Healthy
            && backend.max_fails > 0
            && health.consecutive_failures >= backend.max_fails
        {
            health.status = HealthStatus::Unhealthy;
            return Some(HealthTransition::Ejected);
        }
        None
    }

    /// Report a successful request.
    ///
    /// A success that lands inside the ejection window comes from a request
    /// dispatched before the ejection and does not restore the backend.
    pub fn record_success(&self, backend: &Backend, now: Instant) -> Option<HealthTransition> {
        let mut health = self.health();
        match health.status {
            HealthStatus::Healthy => {
                health.consecutive_failures = 0;
                None
            }
            HealthStatus::Unhealthy => {
                if !probation_open(&health, backend, now) {
                    return None;
                }
                health.status = HealthStatus::Healthy;
                health.consecutive_failures = 0;
                health.probe_in_flight = false;
                Some(HealthTransition::Recovered)
            }
        }
    }

    /// Whether a new request may be sent to this backend.
    pub fn is_eligible(&self, backend: &Backend, now: Instant) -> bool {
        let health = self.health();
        match health.status {
            HealthStatus::Healthy => true,
            HealthStatus::Unhealthy => !health.probe_in_flight && probation_open(&health, backend, now),
        }
    }

    /// Claim the backend for one request, reserving the probe slot when the
    /// backend is in probation.
    pub fn try_admit(&self, backend: &Backend, now: Instant) -> Option<Admission> {
        let mut health = self.health();
        match health.status {
            HealthStatus::Healthy => Some(Admission::Regular),
            HealthStatus::Unhealthy => {
                if health.probe_in_flight || !probation_open(&health, backend, now) {
                    return None;
                }
                health.probe_in_flight = true;
                Some(Admission::Probe)
            }
        }
    }

    /// Release a probe slot whose request ended without an outcome.
    pub fn abandon_probe(&self) {
        self.health().probe_in_flight = false;
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Increment the active counter unless it already reached `limit`.
    pub fn try_increment_active(&self, limit: usize) -> bool {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    pub fn increment_active(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the active counter, saturating at zero.
    pub fn decrement_active(&self) {
        let result = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if result.is_err() {
            tracing::error!("Active connection counter decremented below zero");
        }
    }

    pub fn snapshot(&self) -> BackendSnapshot {
        let health = self.health();
        BackendSnapshot {
            status: health.status,
            consecutive_failures: health.consecutive_failures,
            active_connections: self.active_connections(),
            probing: health.probe_in_flight,
        }
    }
}

fn probation_open(health: &HealthRecord, backend: &Backend, now: Instant) -> bool {
    match health.last_failure {
        Some(at) => now.saturating_duration_since(at) >= backend.fail_timeout,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::load_balancer::backend::BackendId;
    use std::time::Duration;

    fn backend(max_fails: u32, fail_timeout_ms: u64) -> Backend {
        let mut config = BackendConfig::new("127.0.0.1", 9000);
        config.max_fails = max_fails;
        config.fail_timeout_ms = fail_timeout_ms;
        Backend::from_config(BackendId::new(0), &config).unwrap()
    }

    #[test]
    fn ejects_after_max_fails() {
        let b = backend(2, 10_000);
        let state = BackendState::new();
        let t0 = Instant::now();

        assert_eq!(state.record_failure(&b, t0), None);
        assert!(state.is_eligible(&b, t0));
        assert_eq!(state.record_failure(&b, t0), Some(HealthTransition::Ejected));
        assert!(!state.is_eligible(&b, t0));
        assert_eq!(state.snapshot().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let b = backend(2, 10_000);
        let state = BackendState::new();
        let t0 = Instant::now();

        state.record_failure(&b, t0);
        state.record_success(&b, t0);
        state.record_failure(&b, t0);
        assert_eq!(state.snapshot().status, HealthStatus::Healthy);
        assert_eq!(state.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn ineligible_for_exactly_fail_timeout_then_one_probe() {
        let b = backend(2, 10_000);
        let state = BackendState::new();
        let t0 = Instant::now();
        state.record_failure(&b, t0);
        state.record_failure(&b, t0);

        assert!(!state.is_eligible(&b, t0 + Duration::from_millis(9_999)));
        assert_eq!(state.try_admit(&b, t0 + Duration::from_millis(9_999)), None);

        let t1 = t0 + Duration::from_millis(10_100);
        assert!(state.is_eligible(&b, t1));
        assert_eq!(state.try_admit(&b, t1), Some(Admission::Probe));
        // The probe slot is taken: no second trial request.
        assert!(!state.is_eligible(&b, t1));
        assert_eq!(state.try_admit(&b, t1), None);

        assert_eq!(state.record_success(&b, t1), Some(HealthTransition::Recovered));
        assert_eq!(state.try_admit(&b, t1), Some(Admission::Regular));
        assert_eq!(state.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn failed_probe_restarts_ejection() {
        let b = backend(1, 10_000);
        let state = BackendState::new();
        let t0 = Instant::now();
        state.record_failure(&b, t0);

        let t1 = t0 + Duration::from_secs(11);
        assert_eq!(state.try_admit(&b, t1), Some(Admission::Probe));
        assert_eq!(state.record_failure(&b, t1), None);

        assert!(!state.is_eligible(&b, t1 + Duration::from_secs(9)));
        assert!(state.is_eligible(&b, t1 + Duration::from_secs(10)));
    }

    #[test]
    fn late_success_inside_window_does_not_recover() {
        let b = backend(1, 10_000);
        let state = BackendState::new();
        let t0 = Instant::now();
        state.record_failure(&b, t0);

        assert_eq!(state.record_success(&b, t0 + Duration::from_secs(1)), None);
        assert_eq!(state.snapshot().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn abandoned_probe_frees_the_slot() {
        let b = backend(1, 0);
        let state = BackendState::new();
        let t0 = Instant::now();
        state.record_failure(&b, t0);

        assert_eq!(state.try_admit(&b, t0), Some(Admission::Probe));
        assert_eq!(state.try_admit(&b, t0), None);
        state.abandon_probe();
        assert_eq!(state.try_admit(&b, t0), Some(Admission::Probe));
    }

    #[test]
    fn zero_max_fails_never_ejects() {
        let b = backend(0, 10_000);
        let state = BackendState::new();
        let t0 = Instant::now();
        for _ in 0..10 {
            assert_eq!(state.record_failure(&b, t0), None);
        }
        assert!(state.is_eligible(&b, t0));
    }

    #[test]
    fn active_counter_never_negative() {
        let state = BackendState::new();
        state.increment_active();
        state.decrement_active();
        state.decrement_active();
        assert_eq!(state.active_connections(), 0);

        assert!(state.try_increment_active(1));
        assert!(!state.try_increment_active(1));
        assert_eq!(state.active_connections(), 1);
    }
}
