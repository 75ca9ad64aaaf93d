//! Logging utilities for gateway services.
//!
//! Provides structured JSON or human-readable logging plus request trace ids.
//!
//! # Noise Filtering
//!
//! By default, noisy library modules (hyper, reqwest, h2, rustls, tower_http)
//! are set to `warn` level to reduce log clutter while keeping business logs
//! at the specified level.

use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Header carrying the gateway request id.
pub const REQUEST_ID_HEADER: &str = "X-Request-Id";

/// Legacy trace id header accepted from callers.
pub const TRACE_ID_HEADER: &str = "X-Trace-Id";

/// Default noisy modules that should be filtered to warn level.
pub const NOISY_MODULES: &[&str] = &[
    "hyper",
    "hyper_util",
    "reqwest",
    "h2",
    "rustls",
    "tokio_util",
    "tower_http",
];

/// Build the filter directives with noise suppression.
fn build_directives(log_level: &str) -> String {
    let mut directives = String::from(log_level);
    for module in NOISY_MODULES {
        directives.push_str(&format!(",{}=warn", module));
    }
    directives
}

/// Initialize logging with the given configuration.
///
/// * `log_level` - Base log level (trace, debug, info, warn, error)
/// * `log_format` - "json" for structured JSON, anything else for human-readable
///
/// `RUST_LOG` takes precedence over `log_level` when set.
pub fn init_logging(log_level: &str, log_format: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(build_directives(log_level)));

    let subscriber = tracing_subscriber::registry().with(filter);

    if log_format == "json" {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        let _ = subscriber.with(fmt_layer).try_init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_target(true)
            .with_file(false)
            .with_line_number(false);
        let _ = subscriber.with(fmt_layer).try_init();
    }

    tracing::info!(
        log_level = %log_level,
        log_format = %log_format,
        noise_filtered = NOISY_MODULES.len(),
        "Logging initialized"
    );
}

/// Generate a new trace ID for request tracing.
pub fn generate_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Per-request tracing context.
///
/// Caller-supplied W3C `traceparent`/`tracestate` are left untouched; this id
/// only correlates gateway log lines with the response.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub trace_id: String,
    pub service: String,
    pub user_id: Option<String>,
}

impl RequestContext {
    /// Create context from HTTP headers, reusing the caller's request id.
    pub fn from_headers(headers: &http::HeaderMap, service: impl Into<String>) -> Self {
        let trace_id = [REQUEST_ID_HEADER, TRACE_ID_HEADER]
            .iter()
            .find_map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::trim)
                    .filter(|v| !v.is_empty() && v.len() <= 128)
                    .map(String::from)
            })
            .unwrap_or_else(generate_trace_id);

        Self {
            trace_id,
            service: service.into(),
            user_id: None,
        }
    }

    /// Attach the authenticated principal and record it on the current span.
    pub fn set_user(&mut self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        tracing::Span::current().record("user_id", user_id.as_str());
        self.user_id = Some(user_id);
    }
}

/// Create a tracing span for a proxied request.
///
/// The span declares an empty `user_id` field, filled in by
/// [`RequestContext::set_user`] once the caller is authenticated.
///
/// # Example
///
/// ```ignore
/// let span = request_span!(ctx.trace_id, method = %method, path = %path);
/// ```
#[macro_export]
macro_rules! request_span {
    ($trace_id:expr) => {
        tracing::info_span!(
            "gateway_request",
            trace_id = %$trace_id,
            user_id = tracing::field::Empty
        )
    };
    ($trace_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "gateway_request",
            trace_id = %$trace_id,
            user_id = tracing::field::Empty,
            $($field)*
        )
    };
}
