//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to backend:
//!     → timeouts.rs (cumulative deadline, per-attempt read timeout)
//!     → On failure: retries.rs (classify, decide whether to try another backend)
//!     → Health tracker records the failure; the backend is excluded for this request
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every attempt has a deadline
//! - Retries go to a different backend, immediately, one at a time
//! - Nothing is retried once response bytes reached the client

pub mod retries;
pub mod timeouts;

pub use retries::{AttemptOutcome, FailureKind, RequestAttempt, RetryPolicy};
pub use timeouts::Deadline;
