//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher attempt
//!     → pool.rs (reuse an idle keep-alive connection, or open one)
//!     → connection.rs (TCP connect, HTTP/1.1 handshake, driver task)
//!     → request/response exchange
//!     → pool.rs (return if the exchange was clean, otherwise drop)
//! ```
//!
//! # Design Decisions
//! - One connection carries one request at a time
//! - Idle connections are reused most-recent first
//! - Every connect is bounded by `connect_timeout`

pub mod connection;
pub mod pool;

pub use connection::{ConnectError, ConnectionId, UpstreamConnection};
pub use pool::ConnectionPool;
