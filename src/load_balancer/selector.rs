//! Weighted least-connections selection.
//!
//! Score = active_connections / weight, lower wins. Scores are compared by
//! cross multiplication so no floating point is involved. Equal scores keep
//! configuration order, which makes selection reproducible.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Instant;

use crate::health::passive::{BackendConnectionGuard, HealthTracker};
use crate::load_balancer::backend::{Backend, BackendId};

/// No backend is eligible for this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no backend available")]
pub struct NoBackendAvailable;

/// Chooses a backend for each attempt.
#[derive(Debug, Clone)]
pub struct Selector {
    tracker: Arc<HealthTracker>,
}

impl Selector {
    pub fn new(tracker: Arc<HealthTracker>) -> Self {
        Self { tracker }
    }

    /// Pick the least relatively-loaded eligible backend not in `excluded`.
    pub fn select(
        &self,
        excluded: &HashSet<BackendId>,
    ) -> Result<BackendConnectionGuard, NoBackendAvailable> {
        self.select_at(excluded, Instant::now())
    }

    pub(crate) fn select_at(
        &self,
        excluded: &HashSet<BackendId>,
        now: Instant,
    ) -> Result<BackendConnectionGuard, NoBackendAvailable> {
        let registry = self.tracker.registry();
        let mut candidates: Vec<(&Backend, usize)> = registry
            .iter()
            .filter(|b| !excluded.contains(&b.id))
            .filter(|b| self.tracker.is_eligible_at(b.id, now))
            .map(|b| (b, self.tracker.active_connections(b.id)))
            .collect();

        // Stable sort: ties stay in configuration order.
        candidates.sort_by(|a, b| compare_load(a, b));

        // A candidate can be lost to a concurrent request between the read
        // above and the claim (probe slot taken, ceiling reached).
        for (backend, _) in candidates {
            if let Some(guard) = self.tracker.try_lease(backend.id, now) {
                tracing::trace!(backend = %backend, probe = guard.is_probe(), "Backend selected");
                return Ok(guard);
            }
        }

        tracing::debug!(excluded = excluded.len(), "No eligible backend");
        Err(NoBackendAvailable)
    }
}

fn compare_load((a, a_active): &(&Backend, usize), (b, b_active): &(&Backend, usize)) -> Ordering {
    let lhs = *a_active as u128 * u128::from(b.weight.get());
    let rhs = *b_active as u128 * u128::from(a.weight.get());
    lhs.cmp(&rhs)
}
