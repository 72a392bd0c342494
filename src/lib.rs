//! HTTP Layer-7 load balancer core.
//!
//! Distributes client requests across a static set of backends using
//! weighted least-connections, ejects backends passively after consecutive
//! failures, and retries failed attempts on a different backend.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client Request
//!     ──────────────▶ security::limits ──▶ http::server ──▶ http::dispatcher
//!                                                              │      ▲
//!                                          load_balancer ◀─────┤      │ outcome
//!                                          (selector)          │      │
//!                                                              ▼      │
//!                                                          net::pool ─┴──▶ Backend
//!     Client Response                                          │
//!     ◀────────────── http::response (streaming body) ◀────────┘
//!
//!     Cross-cutting: config, health, resilience, observability, lifecycle
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;

// Traffic management
pub mod health;
pub mod load_balancer;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;

pub use config::BalancerConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
