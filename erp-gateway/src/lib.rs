//! ERP Gateway - the API gateway's forwarding core.
//!
//! This crate provides:
//! - Route resolution against a validated route table
//! - Upstream path rewriting
//! - Per-route circuit breaking
//! - Reverse proxying with timeouts, retries and hop-by-hop header filtering
//! - Fixed-window rate limiting with abuse detection and store-backed overrides
//! - Prometheus metrics for requests, breaker transitions and limit denials
//!
//! ## Architecture
//!
//! ```text
//! Client → Gateway (IP limit → resolve → auth → user limit) → breaker → upstream
//!                                                               ↓
//!                                                       record outcome
//! ```

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod auth;
pub mod circuit_breaker;
pub mod error;
pub mod metrics;
pub mod overrides;
pub mod proxy;
pub mod rate_limit;
pub mod routes;
pub mod routing;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit, CircuitState};
pub use error::{ErrorResponse, GatewayError};
pub use overrides::{InMemoryOverrideStore, LimitOverride, OverrideReader, OverrideStore};
pub use proxy::{ProxyForwarder, ProxyRequest, ProxyResponse};
pub use rate_limit::{KeyType, RateLimitBucket, RateLimitDecision, RateLimiter};
pub use routes::AppState;
pub use routing::{map_upstream_path, PathRewrite, RouteResolver, ServiceRoute, ServiceTarget};

use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;

use erp_common::config::Config;

/// Build the gateway router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let max_body_bytes = state.max_body_bytes;

    // The body limit sits outside CORS so the CORS layer wraps a plain `Body`.
    routes::build_routes(state).layer(
        ServiceBuilder::new()
            .layer(RequestBodyLimitLayer::new(max_body_bytes))
            .layer(cors),
    )
}

/// Open the configured override store.
///
/// Falls back to an empty in-memory store when no Redis URL is set or when
/// the connection cannot be established; overrides are never required to serve.
pub async fn build_override_store(config: &Config) -> Arc<dyn OverrideStore> {
    let Some(url) = config.overrides.redis_url.as_deref() else {
        return Arc::new(InMemoryOverrideStore::new());
    };

    #[cfg(feature = "redis-backend")]
    {
        match overrides::RedisOverrideStore::connect(url).await {
            Ok(store) => {
                tracing::info!("Reading rate-limit overrides from Redis");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!(error = %e, "Override store unavailable, using in-memory overrides");
            }
        }
    }
    #[cfg(not(feature = "redis-backend"))]
    {
        let _ = url;
        tracing::warn!("Redis URL configured but the redis-backend feature is disabled");
    }

    Arc::new(InMemoryOverrideStore::new())
}

/// Periodically drop expired rate-limit state.
pub fn spawn_prune_task(limiter: Arc<RateLimiter>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            limiter.prune_expired();
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Start the gateway server.
pub async fn start_server(config: &Config) -> anyhow::Result<()> {
    let store = build_override_store(config).await;
    let mut state = AppState::from_config(config, store)?;
    if config.observability.metrics_enabled {
        match metrics::install_recorder() {
            Ok(handle) => state = state.with_metrics(handle),
            Err(e) => tracing::warn!(error = %e, "Metrics recorder not installed"),
        }
    }
    for route in state.resolver.routes() {
        metrics::set_circuit_state(&route.pattern, route.breaker.state());
        tracing::info!(
            pattern = %route.pattern,
            base_url = %route.target.base_url,
            auth_required = route.auth_required,
            retries = route.target.retries,
            "Route registered"
        );
    }

    let pruner = spawn_prune_task(
        Arc::clone(&state.limiter),
        Duration::from_secs(config.rate_limits.prune_interval_secs.max(1)),
    );
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    tracing::info!("Starting ERP Gateway on {}", listener.local_addr()?);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pruner.abort();
    Ok(())
}
