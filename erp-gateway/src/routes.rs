//! HTTP routes for the gateway.
//!
//! Everything that is not a gateway-owned endpoint falls through to the proxy
//! handler, which runs the request pipeline:
//!
//! ```text
//! trace id → IP limit → resolve route → auth → user limit → forward
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::Instrument;

use erp_common::config::Config;
use erp_common::logging::{RequestContext, REQUEST_ID_HEADER};

use crate::auth::{tenant_of, AuthState, AuthUser};
use crate::circuit_breaker::CircuitBreakerStats;
use crate::error::GatewayError;
use crate::metrics;
use crate::overrides::{LimitOverride, OverrideReader, OverrideStore};
use crate::proxy::{ProxyForwarder, ProxyRequest};
use crate::rate_limit::RateLimiter;
use crate::routing::RouteResolver;

pub const SERVICE_NAME: &str = "erp-gateway";

/// Role required for the gateway admin read endpoints.
pub const ADMIN_ROLE: &str = "admin";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub resolver: RouteResolver,
    pub forwarder: ProxyForwarder,
    pub limiter: Arc<RateLimiter>,
    pub overrides: OverrideReader,
    pub auth: AuthState,
    pub max_body_bytes: usize,
    /// Renders `/metrics`; `None` when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Wire up the forwarding core from configuration.
    ///
    /// Fails when the route table is invalid.
    pub fn from_config(config: &Config, store: Arc<dyn OverrideStore>) -> Result<Self, GatewayError> {
        let resolver = RouteResolver::from_config(&config.routes)?;
        let overrides = OverrideReader::new(store, config.rate_limits.overrides.clone());
        let limiter = RateLimiter::new(config.rate_limits.clone()).with_overrides(overrides.clone());

        Ok(Self {
            resolver,
            forwarder: ProxyForwarder::new()?,
            limiter: Arc::new(limiter),
            overrides,
            auth: AuthState::new(config.auth.jwt_secret.clone(), &config.auth.public_prefixes),
            max_body_bytes: config.server.max_body_bytes,
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Build all gateway routes.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/gateway/routes", get(list_routes_handler))
        .route(
            "/api/v1/gateway/rate-limits/overrides/tenants",
            get(list_tenant_overrides_handler),
        )
        .route(
            "/api/v1/gateway/rate-limits/overrides/tenant/:tenant",
            get(get_tenant_override_handler),
        )
        .route(
            "/api/v1/gateway/rate-limits/overrides/endpoints",
            get(list_endpoint_overrides_handler),
        )
        .route(
            "/api/v1/gateway/rate-limits/overrides/endpoint",
            get(get_endpoint_override_handler),
        )
        .fallback(proxy_handler)
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Proxy
// ─────────────────────────────────────────────────────────────────────────────

/// Client address: first `X-Forwarded-For` entry, then `X-Real-IP`, then the peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> String {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(String::from)
    };

    header_value("x-forwarded-for")
        .or_else(|| header_value("x-real-ip"))
        .or_else(|| peer.map(|ConnectInfo(addr)| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let mut ctx = RequestContext::from_headers(request.headers(), SERVICE_NAME);
    let span = erp_common::request_span!(
        ctx.trace_id,
        service = %ctx.service,
        method = %request.method(),
        path = %request.uri().path()
    );

    async move {
        let mut response = match forward_request(&state, request, &mut ctx).await {
            Ok(response) => response,
            Err(err) => {
                tracing::info!(
                    user = ?ctx.user_id,
                    status = err.status_code().as_u16(),
                    code = err.code(),
                    error = %err,
                    "Request rejected"
                );
                return err.into_response_with_trace(Some(&ctx.trace_id));
            }
        };
        if let Ok(id) = HeaderValue::from_str(&ctx.trace_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
        response
    }
    .instrument(span)
    .await
}

async fn forward_request(
    state: &AppState,
    request: Request,
    ctx: &mut RequestContext,
) -> Result<Response, GatewayError> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();

    // A bad token only matters on protected routes; here it just means no tenant claim.
    let authenticated = state.auth.authenticate(&parts.headers);
    let principal = authenticated.as_ref().ok().and_then(Option::as_ref);
    let tenant = tenant_of(&parts.headers, principal);

    let ip_decision = if state.limiter.is_enabled() {
        let ip = client_ip(&parts.headers, parts.extensions.get::<ConnectInfo<SocketAddr>>());
        let decision = state.limiter.check_ip_limit(&ip, &path, &tenant).await;
        if !decision.allowed {
            metrics::mark_rate_limit_exceeded(&tenant, decision.bucket);
            return Err(GatewayError::RateLimitExceeded(Box::new(decision)));
        }
        Some(decision)
    } else {
        None
    };

    let route = state.resolver.resolve(&path)?;

    let user: Option<AuthUser> = if route.auth_required && !state.auth.is_public(&path) {
        match authenticated {
            Ok(Some(user)) => Some(user),
            Ok(None) | Err(_) => {
                metrics::mark_auth_failure("unauthorized");
                return Err(GatewayError::Unauthorized);
            }
        }
    } else {
        authenticated.ok().flatten()
    };
    if let Some(user) = &user {
        ctx.set_user(user.user_id.as_str());
    }

    if state.limiter.is_enabled() {
        if let Some(decision) = state
            .limiter
            .check_user_limit(user.as_ref().map(|u| u.user_id.as_str()))
        {
            if !decision.allowed {
                metrics::mark_rate_limit_exceeded(&tenant, decision.bucket);
                return Err(GatewayError::RateLimitExceeded(Box::new(decision)));
            }
        }
    }

    let body = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|_| GatewayError::InvalidRequest("Request body too large or unreadable".into()))?;

    // Backends log the gateway's trace id when the caller sent none.
    let mut headers = parts.headers;
    if !headers.contains_key(REQUEST_ID_HEADER) {
        if let Ok(id) = HeaderValue::from_str(&ctx.trace_id) {
            headers.insert(REQUEST_ID_HEADER, id);
        }
    }

    let upstream = state
        .forwarder
        .forward(
            &route,
            ProxyRequest {
                method: parts.method,
                path,
                query: parts.uri.query().map(String::from),
                headers,
                body,
            },
        )
        .await?;

    let mut response = Response::new(Body::from(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = upstream.headers;
    if let Some(decision) = ip_decision {
        decision.apply_headers(response.headers_mut());
    }
    Ok(response)
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin read endpoints
// ─────────────────────────────────────────────────────────────────────────────

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<AuthUser, GatewayError> {
    let Ok(Some(user)) = state.auth.authenticate(headers) else {
        metrics::mark_auth_failure("unauthorized");
        return Err(GatewayError::Unauthorized);
    };
    if !user.has_role(ADMIN_ROLE) {
        metrics::mark_auth_failure("forbidden");
        return Err(GatewayError::Forbidden);
    }
    Ok(user)
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewriteInfo {
    pub remove_prefix: String,
    pub add_prefix: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub pattern: String,
    pub base_url: String,
    pub auth_required: bool,
    pub timeout_ms: u64,
    pub retries: u32,
    pub health_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<RewriteInfo>,
    pub circuit_breaker: CircuitBreakerStats,
}

async fn list_routes_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<RouteInfo>>, GatewayError> {
    require_admin(&state, &headers)?;

    let routes = state
        .resolver
        .routes()
        .iter()
        .map(|route| RouteInfo {
            pattern: route.pattern.clone(),
            base_url: route.target.base_url.clone(),
            auth_required: route.auth_required,
            timeout_ms: route.target.timeout.as_millis() as u64,
            retries: route.target.retries,
            health_path: route.target.health_path.clone(),
            rewrite: route.rewrite.as_ref().map(|r| RewriteInfo {
                remove_prefix: r.remove_prefix.clone(),
                add_prefix: r.add_prefix.clone(),
            }),
            circuit_breaker: route.breaker.stats(),
        })
        .collect();

    Ok(Json(routes))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantOverrideResponse {
    pub tenant: String,
    #[serde(flatten)]
    pub limit: LimitOverride,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointOverrideResponse {
    pub pattern: String,
    #[serde(flatten)]
    pub limit: LimitOverride,
}

#[derive(Debug, Deserialize)]
pub struct EndpointQuery {
    pub pattern: Option<String>,
}

async fn get_tenant_override_handler(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TenantOverrideResponse>, GatewayError> {
    require_admin(&state, &headers)?;
    let limit = state
        .overrides
        .tenant_override(&tenant)
        .await
        .ok_or_else(|| GatewayError::NotFound("Tenant override".into()))?;
    Ok(Json(TenantOverrideResponse { tenant, limit }))
}

async fn get_endpoint_override_handler(
    State(state): State<AppState>,
    Query(query): Query<EndpointQuery>,
    headers: HeaderMap,
) -> Result<Json<EndpointOverrideResponse>, GatewayError> {
    require_admin(&state, &headers)?;
    let pattern = query
        .pattern
        .filter(|p| !p.is_empty())
        .ok_or_else(|| GatewayError::InvalidRequest("pattern query parameter is required".into()))?;
    let limit = state
        .overrides
        .endpoint_override(&pattern)
        .await
        .ok_or_else(|| GatewayError::NotFound("Endpoint override".into()))?;
    Ok(Json(EndpointOverrideResponse { pattern, limit }))
}

async fn list_tenant_overrides_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<TenantOverrideResponse>>, GatewayError> {
    require_admin(&state, &headers)?;
    let entries = state
        .overrides
        .list_tenant_overrides()
        .await
        .into_iter()
        .map(|(tenant, limit)| TenantOverrideResponse { tenant, limit })
        .collect();
    Ok(Json(entries))
}

async fn list_endpoint_overrides_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<EndpointOverrideResponse>>, GatewayError> {
    require_admin(&state, &headers)?;
    let entries = state
        .overrides
        .list_endpoint_overrides()
        .await
        .into_iter()
        .map(|(pattern, limit)| EndpointOverrideResponse { pattern, limit })
        .collect();
    Ok(Json(entries))
}

// ─────────────────────────────────────────────────────────────────────────────
// Health and metrics
// ─────────────────────────────────────────────────────────────────────────────

async fn metrics_handler(State(state): State<AppState>) -> Result<Response, GatewayError> {
    let handle = state
        .metrics
        .as_ref()
        .ok_or_else(|| GatewayError::NotFound("Metrics".into()))?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: SERVICE_NAME.into(),
    })
}
