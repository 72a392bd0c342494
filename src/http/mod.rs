//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Client connection (HTTP/1.1 or HTTP/2)
//!     → server.rs (Axum setup, request ID, client limit)
//!     → request.rs (buffer body, strip hop-by-hop, add X-Forwarded-*)
//!     → dispatcher.rs (select backend, forward, retry)
//!     → response.rs (stream body, release connection)
//!     → Send to client
//! ```

pub mod dispatcher;
pub mod request;
pub mod response;
pub mod server;

pub use dispatcher::{Dispatcher, GatewayError};
pub use request::{RequestError, UpstreamRequest};
pub use server::HttpServer;
