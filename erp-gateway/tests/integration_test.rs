//! Integration tests for ERP Gateway.
//!
//! Drives the full router with `oneshot` against wiremock upstreams.

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    response::Response,
    Router,
};
use erp_common::config::{BucketLimit, Config, RewriteEntry, RouteEntry};
use erp_gateway::{build_router, AppState, CircuitState, GatewayError, InMemoryOverrideStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{body_bytes, header as header_eq, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JWT_SECRET: &str = "test-secret-key-for-integration-tests!";

/// Open route to `base_url` with fast retries.
fn open_route(pattern: &str, base_url: &str) -> RouteEntry {
    let mut entry = RouteEntry::new(pattern, base_url);
    entry.auth_required = false;
    entry.retries = 0;
    entry.backoff_initial_ms = 1;
    entry.backoff_max_ms = 5;
    entry.timeout = Duration::from_secs(2);
    entry
}

fn test_config(routes: Vec<RouteEntry>) -> Config {
    let mut config = Config::default();
    config.auth.jwt_secret = Some(JWT_SECRET.into());
    config.routes = routes;
    config
}

/// Test helper to build the router and keep a handle on the override store.
fn create_test_app(config: &Config) -> (Router, AppState, Arc<InMemoryOverrideStore>) {
    let store = Arc::new(InMemoryOverrideStore::new());
    let state = AppState::from_config(config, store.clone()).expect("valid config");
    (build_router(state.clone()), state, store)
}

fn token(state: &AppState, user: &str, roles: &[&str]) -> String {
    state
        .auth
        .generate_token(user, roles.iter().map(|r| r.to_string()).collect(), None, 3600)
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn body_bytes_of(response: Response) -> bytes::Bytes {
    axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes_of(response).await).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Health and startup
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let (app, _, _) = create_test_app(&test_config(vec![]));

    for uri in ["/health", "/api/v1/health"] {
        let response = send(&app, get(uri)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "erp-gateway");
    }
}

#[tokio::test]
async fn test_overlapping_routes_refuse_to_start() {
    let config = test_config(vec![
        open_route("/api/*", "http://a:1"),
        open_route("/api/v1/*", "http://b:1"),
    ]);
    let result = AppState::from_config(&config, Arc::new(InMemoryOverrideStore::new()));
    assert!(matches!(result, Err(GatewayError::RouteConfigInvalid(_))));
}

#[tokio::test]
async fn test_relative_health_path_refuses_to_start() {
    let mut route = open_route("/api/v1/ap/*", "http://a:1");
    route.health_path = "q/health".into();
    let result = AppState::from_config(&test_config(vec![route]), Arc::new(InMemoryOverrideStore::new()));
    assert!(matches!(result, Err(GatewayError::RouteConfigInvalid(_))));
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unmatched_path_is_not_found() {
    let (app, _, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        "http://127.0.0.1:1",
    )]));

    let request = Request::builder()
        .uri("/api/v1/nowhere")
        .header("X-Request-Id", "req-123")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.headers()["x-request-id"], "req-123");
    let json = body_json(response).await;
    assert_eq!(json["code"], "ROUTE_NOT_FOUND");
    assert_eq!(json["traceId"], "req-123");
}

#[tokio::test]
async fn test_rewritten_path_and_query_reach_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/auth/login"))
        .and(query_param("redirect", "/home"))
        .and(query_param("lang", "en"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut route = open_route("/api/v1/identity/*", &upstream.uri());
    route.rewrite = Some(RewriteEntry {
        remove_prefix: "/api/v1/identity".into(),
        add_prefix: "/api".into(),
    });
    let (app, _, _) = create_test_app(&test_config(vec![route]));

    let response = send(&app, get("/api/v1/identity/auth/login?redirect=/home&lang=en")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes_of(response).await, "ok");
}

// ─────────────────────────────────────────────────────────────────────────────
// Headers
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_auth_and_trace_headers_pass_unmodified() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header_eq("authorization", "Bearer opaque.token.value"))
        .and(header_eq(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        ))
        .and(header_eq("tracestate", "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&upstream)
        .await;

    let (app, _, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        &upstream.uri(),
    )]));

    let request = Request::builder()
        .uri("/api/v1/ap/invoices")
        .header(header::AUTHORIZATION, "Bearer opaque.token.value")
        .header(
            "traceparent",
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
        )
        .header("tracestate", "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_generated_request_id_reaches_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (app, _, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        &upstream.uri(),
    )]));

    let response = send(&app, get("/api/v1/ap/invoices")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let echoed = response.headers()["x-request-id"].to_str().unwrap().to_string();

    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].headers["x-request-id"].to_str().unwrap(), echoed);

    let request = Request::builder()
        .uri("/api/v1/ap/invoices")
        .header("x-request-id", "caller-chosen-id")
        .body(Body::empty())
        .unwrap();
    send(&app, request).await;
    let received = upstream.received_requests().await.unwrap();
    assert_eq!(received[1].headers["x-request-id"], "caller-chosen-id");
}

#[tokio::test]
async fn test_hop_by_hop_response_headers_stripped() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-upstream", "ap-service-1")
                .insert_header("connection", "keep-alive")
                .set_body_string("done"),
        )
        .mount(&upstream)
        .await;

    let (app, _, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        &upstream.uri(),
    )]));

    let response = send(&app, get("/api/v1/ap/x")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONNECTION).is_none());
    assert!(response.headers().get(header::TRANSFER_ENCODING).is_none());
    assert_eq!(response.headers()["x-upstream"], "ap-service-1");
    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-ratelimit-limit"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Methods and bodies
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_delete_without_body_returns_upstream_status() {
    let upstream = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v1/ap/vendors/42"))
        .respond_with(ResponseTemplate::new(204).insert_header("x-deleted", "42"))
        .expect(1)
        .mount(&upstream)
        .await;

    let (app, _, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        &upstream.uri(),
    )]));

    let request = Request::builder()
        .method(Method::DELETE)
        .uri("/api/v1/ap/vendors/42")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(response.headers()["x-deleted"], "42");
}

#[tokio::test]
async fn test_bodies_forwarded_byte_for_byte() {
    let upstream = MockServer::start().await;
    let payload = br#"{"vendor":"ACME","amount":"1200.50"}"#;
    let reply = r#"{"id":7,"status":"POSTED","amount":"1200.50"}"#;

    for verb in ["POST", "PUT", "PATCH"] {
        Mock::given(method(verb))
            .and(path("/api/v1/ap/invoices"))
            .and(header_eq("content-type", "application/json"))
            .and(body_bytes(payload.to_vec()))
            .respond_with(ResponseTemplate::new(201).set_body_raw(reply, "application/json"))
            .expect(1)
            .mount(&upstream)
            .await;
    }

    let (app, _, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        &upstream.uri(),
    )]));

    for verb in [Method::POST, Method::PUT, Method::PATCH] {
        let request = Request::builder()
            .method(verb.clone())
            .uri("/api/v1/ap/invoices")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_vec()))
            .unwrap();
        let response = send(&app, request).await;
        assert_eq!(response.status(), StatusCode::CREATED, "{verb}");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert_eq!(body_bytes_of(response).await, reply.as_bytes());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retries and circuit breaking
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_retry_succeeds_transparently() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut route = open_route("/api/v1/ap/*", &upstream.uri());
    route.retries = 1;
    let (app, _, _) = create_test_app(&test_config(vec![route]));

    let response = send(&app, get("/api/v1/ap/x")).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_single_failure_opens_breaker_with_threshold_one() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&upstream)
        .await;

    let mut route = open_route("/api/v1/ap/*", &upstream.uri());
    route.cb_failure_threshold = 1;
    route.cb_reset_ms = 60_000;
    let (app, _, _) = create_test_app(&test_config(vec![route]));

    let first = send(&app, get("/api/v1/ap/x")).await;
    assert_eq!(first.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_json(first).await["code"], "PROXY_EXCEPTION");

    let second = send(&app, get("/api/v1/ap/x")).await;
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(second).await["code"], "CIRCUIT_OPEN");
    // MockServer verifies on drop that the upstream saw exactly one request.
}

#[tokio::test]
async fn test_breaker_is_per_route() {
    let failing = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&failing)
        .await;
    let healthy = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&healthy)
        .await;

    let mut broken = open_route("/api/v1/ap/*", &failing.uri());
    broken.cb_failure_threshold = 1;
    let (app, _, _) = create_test_app(&test_config(vec![
        broken,
        open_route("/api/v1/ar/*", &healthy.uri()),
    ]));

    send(&app, get("/api/v1/ap/x")).await;
    assert_eq!(
        send(&app, get("/api/v1/ap/x")).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(send(&app, get("/api/v1/ar/x")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_half_open_trial_success_closes_breaker() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .mount(&upstream)
        .await;

    let mut route = open_route("/api/v1/ap/*", &upstream.uri());
    route.cb_failure_threshold = 1;
    route.cb_reset_ms = 50;
    let (app, state, _) = create_test_app(&test_config(vec![route]));
    let breaker = &state.resolver.routes()[0].breaker;

    assert_eq!(
        send(&app, get("/api/v1/ap/x")).await.status(),
        StatusCode::BAD_GATEWAY
    );
    assert_eq!(
        send(&app, get("/api/v1/ap/x")).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // The first request after the reset timeout is the trial.
    let trial = send(&app, get("/api/v1/ap/x")).await;
    assert_eq!(trial.status(), StatusCode::OK);
    assert_eq!(&body_bytes_of(trial).await[..], b"recovered");
    assert_eq!(breaker.state(), CircuitState::Closed);

    assert_eq!(send(&app, get("/api/v1/ap/x")).await.status(), StatusCode::OK);
    assert_eq!(upstream.received_requests().await.unwrap().len(), 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Request limits and CORS
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_oversized_body_rejected() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let mut config = test_config(vec![open_route("/api/v1/ap/*", &upstream.uri())]);
    config.server.max_body_bytes = 16;
    let (app, _, _) = create_test_app(&config);

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/ap/invoices")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::CONTENT_LENGTH, "64")
        .body(Body::from(vec![b'x'; 64]))
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_cors_headers_on_responses() {
    let (app, _, _) = create_test_app(&test_config(vec![]));

    let request = Request::builder()
        .uri("/health")
        .header(header::ORIGIN, "https://erp.example.com")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_metrics_endpoint_renders_proxied_requests() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let _guard = ::metrics::set_default_local_recorder(&recorder);

    let config = test_config(vec![open_route("/api/v1/ap/*", &upstream.uri())]);
    let state = AppState::from_config(&config, Arc::new(InMemoryOverrideStore::new()))
        .expect("valid config")
        .with_metrics(handle);
    let app = build_router(state);

    assert_eq!(send(&app, get("/api/v1/ap/invoices/1")).await.status(), StatusCode::OK);

    let response = send(&app, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = String::from_utf8(body_bytes_of(response).await.to_vec()).unwrap();
    let line = body
        .lines()
        .find(|l| l.starts_with("gateway_requests_total"))
        .expect("request counter rendered");
    assert!(line.contains(r#"endpoint="/api/v1/ap/*""#));
    assert!(line.contains(r#"status="200""#));
    assert!(line.ends_with(" 1"));
}

#[tokio::test]
async fn test_metrics_not_found_without_recorder() {
    let (app, _, _) = create_test_app(&test_config(vec![]));
    let response = send(&app, get("/metrics")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["code"], "NOT_FOUND");
}

// ─────────────────────────────────────────────────────────────────────────────
// Authentication
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_protected_route_requires_token() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut route = open_route("/api/v1/identity/*", &upstream.uri());
    route.auth_required = true;
    let (app, state, _) = create_test_app(&test_config(vec![route]));

    let response = send(&app, get("/api/v1/identity/users")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    // Public prefix needs no token.
    let response = send(&app, get("/api/v1/identity/auth/login")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let request = Request::builder()
        .uri("/api/v1/identity/users")
        .header(
            header::AUTHORIZATION,
            format!("Bearer {}", token(&state, "alice", &[])),
        )
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, request).await.status(), StatusCode::OK);
}

// ─────────────────────────────────────────────────────────────────────────────
// Rate limiting
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_ip_limit_denies_n_plus_one() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut config = test_config(vec![open_route("/api/v1/ap/*", &upstream.uri())]);
    // Wide window so the test cannot straddle a boundary.
    config.rate_limits.default = BucketLimit::new(3, 3600);
    let (app, _, _) = create_test_app(&config);

    let from = |ip: &str| {
        Request::builder()
            .uri("/api/v1/ap/x")
            .header("X-Forwarded-For", ip)
            .body(Body::empty())
            .unwrap()
    };

    let mut last_remaining = Vec::new();
    for _ in 0..3 {
        let response = send(&app, from("198.51.100.4")).await;
        assert_eq!(response.status(), StatusCode::OK);
        last_remaining.push(
            response.headers()["x-ratelimit-remaining"]
                .to_str()
                .unwrap()
                .to_string(),
        );
    }
    assert_eq!(last_remaining, vec!["2", "1", "0"]);

    let denied = send(&app, from("198.51.100.4")).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["x-ratelimit-limit"], "3");
    assert_eq!(denied.headers()["x-ratelimit-remaining"], "0");
    assert!(denied.headers().contains_key("x-ratelimit-reset"));
    let json = body_json(denied).await;
    assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
    assert_eq!(json["message"], "Too many requests");

    // A different client is unaffected.
    assert_eq!(send(&app, from("198.51.100.5")).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_sox_paths_use_stricter_bucket() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut config = test_config(vec![open_route("/api/v1/ledger/*", &upstream.uri())]);
    config.rate_limits.sox = BucketLimit::new(1, 3600);
    config.rate_limits.sox_path_prefixes = vec!["/api/v1/ledger/journal".into()];
    let (app, _, _) = create_test_app(&config);

    assert_eq!(
        send(&app, get("/api/v1/ledger/journal/1")).await.status(),
        StatusCode::OK
    );
    assert_eq!(
        send(&app, get("/api/v1/ledger/journal/1")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
    assert_eq!(
        send(&app, get("/api/v1/ledger/accounts")).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn test_user_limit_follows_principal_across_ips() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let mut route = open_route("/api/v1/ap/*", &upstream.uri());
    route.auth_required = true;
    let mut config = test_config(vec![route]);
    config.rate_limits.user = BucketLimit::new(1, 3600);
    let (app, state, _) = create_test_app(&config);
    let bearer = format!("Bearer {}", token(&state, "carol", &[]));

    let request = |ip: &str| {
        Request::builder()
            .uri("/api/v1/ap/x")
            .header("X-Forwarded-For", ip)
            .header(header::AUTHORIZATION, bearer.as_str())
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(send(&app, request("203.0.113.1")).await.status(), StatusCode::OK);
    assert_eq!(
        send(&app, request("203.0.113.2")).await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test]
async fn test_tenant_override_from_store() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (app, _, store) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        &upstream.uri(),
    )]));
    store.insert("rl:tenant:acme", "1:3600");

    let request = || {
        Request::builder()
            .uri("/api/v1/ap/x")
            .header("X-Tenant-Id", "acme")
            .body(Body::empty())
            .unwrap()
    };
    let first = send(&app, request()).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-limit"], "1");
    assert_eq!(send(&app, request()).await.status(), StatusCode::TOO_MANY_REQUESTS);

    // A malformed override is ignored.
    store.insert("rl:tenant:acme", "not-a-limit");
    let response = send(&app, request()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-ratelimit-limit"], "100");
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin read endpoints
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_routes_listing_requires_admin() {
    let (app, state, _) = create_test_app(&test_config(vec![open_route(
        "/api/v1/ap/*",
        "http://ap:8080",
    )]));

    let response = send(&app, get("/api/v1/gateway/routes")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let as_user = |roles: &[&str]| {
        Request::builder()
            .uri("/api/v1/gateway/routes")
            .header(
                header::AUTHORIZATION,
                format!("Bearer {}", token(&state, "ops", roles)),
            )
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(send(&app, as_user(&["user"])).await.status(), StatusCode::FORBIDDEN);

    let response = send(&app, as_user(&["admin"])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json[0]["pattern"], "/api/v1/ap/*");
    assert_eq!(json[0]["baseUrl"], "http://ap:8080");
    assert_eq!(json[0]["circuitBreaker"]["state"], "CLOSED");
}

#[tokio::test]
async fn test_override_reads() {
    let (app, state, store) = create_test_app(&test_config(vec![]));
    store.insert("rl:tenant:acme", "10:60");
    store.insert("rl:endpoint:/api/v1/ap/*", "5:30");
    let bearer = format!("Bearer {}", token(&state, "ops", &["admin"]));

    let admin_get = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header(header::AUTHORIZATION, bearer.as_str())
            .body(Body::empty())
            .unwrap()
    };

    let response = send(&app, admin_get("/api/v1/gateway/rate-limits/overrides/tenant/acme")).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["tenant"], "acme");
    assert_eq!(json["requestsPerMinute"], 10);
    assert_eq!(json["windowSeconds"], 60);

    let response = send(&app, admin_get("/api/v1/gateway/rate-limits/overrides/tenant/nobody")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = send(
        &app,
        admin_get("/api/v1/gateway/rate-limits/overrides/endpoint?pattern=/api/v1/ap/*"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["requestsPerMinute"], 5);

    let response = send(&app, admin_get("/api/v1/gateway/rate-limits/overrides/endpoint")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = send(&app, admin_get("/api/v1/gateway/rate-limits/overrides/tenants")).await;
    let json = body_json(response).await;
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["tenant"], "acme");

    store.remove("rl:endpoint:/api/v1/ap/*");
    let response = send(&app, admin_get("/api/v1/gateway/rate-limits/overrides/endpoints")).await;
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 0);
}
