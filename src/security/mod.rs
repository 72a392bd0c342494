//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → limits.rs (per-client concurrency ceiling)
//!     → headers.rs (strip hop-by-hop, add X-Forwarded-*)
//!     → Pass to dispatcher
//! ```
//!
//! # Design Decisions
//! - Fail closed: over-limit clients get an immediate 503
//! - The health endpoint sits outside the limiter

pub mod headers;
pub mod limits;

pub use limits::{client_limit_middleware, ClientLimiter, ClientPermit};
