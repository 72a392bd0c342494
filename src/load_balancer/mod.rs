//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Attempt needs a backend (with the set already tried)
//!     → registry.rs (static backend set)
//!     → health tracker filters eligible backends
//!     → selector.rs (weighted least connections)
//!     → BackendConnectionGuard (active slot held for the attempt)
//!     → or NoBackendAvailable
//! ```
//!
//! # Design Decisions
//! - Selector is stateless; the health tracker holds all counters
//! - Weight biases toward capacity, active count biases toward idleness
//! - Unhealthy backends excluded from selection until probation
//! - Deterministic tie-break by configuration order

pub mod backend;
pub mod registry;
pub mod selector;

pub use backend::{Backend, BackendId};
pub use registry::BackendRegistry;
pub use selector::{NoBackendAvailable, Selector};
