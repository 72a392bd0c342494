//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy and health handlers
//! - Configure HTTP/1.1 and HTTP/2 support
//! - Wire up middleware (request ID, tracing, per-client limits)
//! - Bind server to listener
//! - Start background tasks and stop them on shutdown

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::config::{validate_config, BalancerConfig, ConfigError};
use crate::health::HealthTracker;
use crate::http::dispatcher::Dispatcher;
use crate::http::request::UpstreamRequest;
use crate::load_balancer::BackendRegistry;
use crate::net::pool::ConnectionPool;
use crate::observability::metrics;
use crate::security::{client_limit_middleware, ClientLimiter};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub max_body_size: usize,
}

/// HTTP server for the load balancer.
pub struct HttpServer {
    router: Router,
    config: BalancerConfig,
    tracker: Arc<HealthTracker>,
    pool: Arc<ConnectionPool>,
    limiter: Arc<ClientLimiter>,
}

impl HttpServer {
    /// Validate `config` and build every subsystem.
    pub fn new(config: BalancerConfig) -> Result<Self, ConfigError> {
        validate_config(&config)?;

        let registry = Arc::new(BackendRegistry::load(&config.backends)?);
        let tracker = Arc::new(HealthTracker::new(registry));
        let pool = Arc::new(ConnectionPool::new(
            &config.keepalive,
            config.upstream.connect_timeout(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&tracker),
            Arc::clone(&pool),
            &config.upstream,
        ));
        let limiter = Arc::new(ClientLimiter::new(&config.limits));

        let state = AppState {
            dispatcher,
            max_body_size: config.listener.max_body_size,
        };
        let router = Self::build_router(&config, state, Arc::clone(&limiter));

        Ok(Self {
            router,
            config,
            tracker,
            pool,
            limiter,
        })
    }

    /// Build the Axum router with all middleware layers.
    ///
    /// The health route is merged outside the client limiter.
    fn build_router(config: &BalancerConfig, state: AppState, limiter: Arc<ClientLimiter>) -> Router {
        let proxy = Router::new()
            .route("/", any(proxy_handler))
            .route("/{*path}", any(proxy_handler))
            .route_layer(middleware::from_fn_with_state(limiter, client_limit_middleware))
            .with_state(state);

        Router::new()
            .route(&config.listener.health_path, get(health_handler))
            .merge(proxy)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Run the server until `shutdown` fires, then drain in-flight requests.
    pub async fn run(self, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            backends = self.tracker.registry().len(),
            "HTTP server starting"
        );

        tokio::spawn(
            Arc::clone(&self.limiter)
                .run_sweeper(self.config.limits.sweep_interval(), shutdown.resubscribe()),
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Draining in-flight requests");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    /// Shared health state, for inspection.
    pub fn tracker(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn pool(&self) -> Arc<ConnectionPool> {
        Arc::clone(&self.pool)
    }

    pub fn limiter(&self) -> Arc<ClientLimiter> {
        Arc::clone(&self.limiter)
    }
}

/// Main proxy handler.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let started = Instant::now();
    let method = request.method().clone();

    let response = match UpstreamRequest::from_client(request, addr, state.max_body_size).await {
        Ok(upstream) => match state.dispatcher.dispatch(&upstream).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(client = %addr, error = %e, status = %e.status(), "Gateway error");
                e.into_response()
            }
        },
        Err(e) => {
            tracing::warn!(client = %addr, error = %e, "Rejected client request");
            e.into_response()
        }
    };

    metrics::record_request(&method, response.status(), started);
    response
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;

    #[test]
    fn rejects_invalid_config() {
        let err = HttpServer::new(BalancerConfig::default()).err().unwrap();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[tokio::test]
    async fn builds_from_valid_config() {
        let mut config = BalancerConfig::default();
        config.backends.push(BackendConfig::new("127.0.0.1", 9001));
        config.backends.push(BackendConfig::new("127.0.0.1", 9002));

        let server = HttpServer::new(config).unwrap();
        assert_eq!(server.tracker().registry().len(), 2);
        assert_eq!(server.tracker().total_active(), 0);
        assert_eq!(server.limiter().tracked_clients(), 0);
    }
}
