//! Reverse-proxy forwarding.
//!
//! Forwards a request to its route's upstream with the route's timeout,
//! retrying sequentially on 5xx responses and transport errors, and records
//! the final outcome into the route's circuit breaker and the request metrics.

use axum::http::{header, HeaderMap, HeaderName, Method, StatusCode};
use bytes::Bytes;
use reqwest::Client;
use std::collections::HashSet;
use std::time::Instant;

use crate::error::GatewayError;
use crate::metrics::{self, error_kind};
use crate::routing::ServiceRoute;

/// Headers that only apply to a single transport leg.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Request as received by the gateway.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub path: String,
    /// Raw query string, forwarded verbatim.
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Upstream response relayed to the caller.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Names listed in `Connection` header values, lowercased.
fn connection_tokens(headers: &HeaderMap) -> HashSet<String> {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

fn strip_headers(headers: &HeaderMap, extra: &[HeaderName]) -> HeaderMap {
    let nominated = connection_tokens(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || nominated.contains(lower) || extra.contains(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Headers to send upstream.
///
/// Drops hop-by-hop headers plus `Host` and `Content-Length`, which the client
/// sets for the upstream connection. Everything else, including
/// `Authorization`, `traceparent` and `tracestate`, passes through unchanged.
pub fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    strip_headers(headers, &[header::HOST, header::CONTENT_LENGTH])
}

/// Headers to relay back to the caller.
pub fn filter_response_headers(headers: &HeaderMap) -> HeaderMap {
    strip_headers(headers, &[header::CONTENT_LENGTH])
}

/// Issues upstream calls for resolved routes.
#[derive(Clone)]
pub struct ProxyForwarder {
    client: Client,
}

impl ProxyForwarder {
    /// Create a forwarder with its own HTTP client. Redirects are relayed to
    /// the caller, not followed.
    pub fn new() -> Result<Self, GatewayError> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Forward `request` to `route`'s upstream.
    pub async fn forward(
        &self,
        route: &ServiceRoute,
        request: ProxyRequest,
    ) -> Result<ProxyResponse, GatewayError> {
        let started = Instant::now();
        let Some(permit) = route.breaker.try_acquire() else {
            tracing::warn!(
                route = %route.pattern,
                path = %request.path,
                "Circuit open, short-circuiting request"
            );
            let err = GatewayError::CircuitOpen {
                route: route.pattern.clone(),
            };
            metrics::mark_error(error_kind::CIRCUIT_OPEN);
            metrics::record_request(
                &request.method,
                &route.pattern,
                err.status_code().as_u16(),
                started.elapsed(),
            );
            return Err(err);
        };
        if permit.is_trial() {
            tracing::info!(route = %route.pattern, "Sending HALF_OPEN trial request");
        }

        let upstream_path = route.upstream_path(&request.path);
        let url = match request.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}{}?{}", route.target.base_url, upstream_path, q),
            _ => format!("{}{}", route.target.base_url, upstream_path),
        };
        let headers = filter_request_headers(&request.headers);
        let body = if request.body.is_empty()
            && !matches!(request.method, Method::POST | Method::PUT | Method::PATCH)
        {
            None
        } else {
            Some(request.body)
        };

        let attempts = route.target.retries.saturating_add(1);
        let mut last_status = None;
        let mut last_reason = String::new();
        let mut timed_out = false;

        for attempt in 0..attempts {
            if attempt > 0 {
                metrics::mark_retry(&route.pattern);
                tokio::time::sleep(route.target.backoff_for(attempt - 1)).await;
            }

            match self
                .send_once(route, &request.method, &url, &headers, body.clone())
                .await
            {
                Ok(response) if !response.status.is_server_error() => {
                    permit.success();
                    tracing::debug!(
                        route = %route.pattern,
                        method = %request.method,
                        upstream = %url,
                        upstream_status = response.status.as_u16(),
                        attempt = attempt + 1,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Upstream responded"
                    );
                    metrics::record_request(
                        &request.method,
                        &route.pattern,
                        response.status.as_u16(),
                        started.elapsed(),
                    );
                    return Ok(response);
                }
                Ok(response) => {
                    last_status = Some(response.status.as_u16());
                    last_reason = format!("upstream returned {}", response.status);
                    timed_out = false;
                }
                Err(e) => {
                    last_status = None;
                    timed_out = e.is_timeout();
                    last_reason = if timed_out {
                        format!("timed out after {:?}", route.target.timeout)
                    } else {
                        e.to_string()
                    };
                }
            }

            tracing::warn!(
                route = %route.pattern,
                method = %request.method,
                upstream_status = ?last_status,
                attempt = attempt + 1,
                max_attempts = attempts,
                reason = %last_reason,
                "Upstream attempt failed"
            );
        }

        permit.failure();
        tracing::error!(
            route = %route.pattern,
            method = %request.method,
            upstream = %url,
            upstream_status = ?last_status,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            reason = %last_reason,
            "Upstream failed after all attempts"
        );

        let err = GatewayError::UpstreamFailure {
            route: route.pattern.clone(),
            status: last_status,
            reason: last_reason,
        };
        metrics::mark_error(if timed_out {
            error_kind::PROXY_TIMEOUT
        } else {
            error_kind::PROXY_EXCEPTION
        });
        metrics::record_request(
            &request.method,
            &route.pattern,
            err.status_code().as_u16(),
            started.elapsed(),
        );
        Err(err)
    }

    async fn send_once(
        &self,
        route: &ServiceRoute,
        method: &Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<ProxyResponse, reqwest::Error> {
        let mut builder = self
            .client
            .request(method.clone(), url)
            .headers(headers.clone())
            .timeout(route.target.timeout);
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = filter_response_headers(response.headers());
        let body = response.bytes().await?;

        Ok(ProxyResponse {
            status,
            headers,
            body,
        })
    }
}
