//! Gateway error kinds and their HTTP rendering.
//!
//! Every failure that can end a request maps to exactly one status code and a
//! stable machine-readable code. The JSON body never carries upstream detail,
//! configuration or internal messages.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::rate_limit::RateLimitDecision;

/// Errors produced by the forwarding core.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no route matches {path}")]
    RouteNotFound { path: String },

    #[error("invalid route configuration: {0}")]
    RouteConfigInvalid(String),

    #[error("circuit open for route {route}")]
    CircuitOpen { route: String },

    #[error("upstream failure on route {route}: {reason}")]
    UpstreamFailure {
        route: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("rate limit exceeded for {} key {}", .0.key_type, .0.key)]
    RateLimitExceeded(Box<RateLimitDecision>),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error envelope returned to callers.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RouteNotFound { .. } | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RouteConfigInvalid(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamFailure { .. } => StatusCode::BAD_GATEWAY,
            Self::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            Self::RouteConfigInvalid(_) => "ROUTE_CONFIG_INVALID",
            Self::CircuitOpen { .. } => "CIRCUIT_OPEN",
            Self::UpstreamFailure { .. } => "PROXY_EXCEPTION",
            Self::RateLimitExceeded(_) => "RATE_LIMIT_EXCEEDED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Client-facing message.
    fn public_message(&self) -> String {
        match self {
            Self::RouteNotFound { .. } => "No route found".into(),
            Self::RouteConfigInvalid(_) | Self::Internal(_) => "Internal server error".into(),
            Self::CircuitOpen { .. } => "Service temporarily unavailable".into(),
            Self::UpstreamFailure { .. } => "Upstream service failed".into(),
            Self::RateLimitExceeded(_) => "Too many requests".into(),
            Self::Unauthorized => "Authentication required".into(),
            Self::Forbidden => "Access denied".into(),
            Self::NotFound(what) => format!("{what} not found"),
            Self::InvalidRequest(reason) => reason.clone(),
        }
    }

    /// Render the error, tagging the envelope with the request's trace id.
    pub fn into_response_with_trace(self, trace_id: Option<&str>) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.code().into(),
            message: self.public_message(),
            trace_id: trace_id.map(String::from),
        };

        let mut response = (status, Json(body)).into_response();
        if let Self::RateLimitExceeded(decision) = &self {
            decision.apply_headers(response.headers_mut());
        }
        if let Some(id) = trace_id.and_then(|id| HeaderValue::from_str(id).ok()) {
            response
                .headers_mut()
                .insert(erp_common::logging::REQUEST_ID_HEADER, id);
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        self.into_response_with_trace(None)
    }
}
