//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Passive health checks (passive.rs):
//!     Request outcome observed
//!     → Increment or reset failure count
//!     → Update state.rs if threshold exceeded
//!
//! State machine (state.rs):
//!     Healthy → Unhealthy → probation → Healthy | Unhealthy
//! ```
//!
//! # Design Decisions
//! - No background prober: an ejected backend is re-evaluated by live traffic
//! - Probation admits exactly one trial request
//! - Health state is per-backend, each record independently synchronized

pub mod passive;
pub mod state;

pub use passive::{BackendConnectionGuard, HealthTracker, Outcome};
pub use state::{BackendSnapshot, HealthStatus};
