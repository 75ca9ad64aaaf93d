//! Configuration validation for the gateway.
//!
//! Field-level checks on the loaded configuration. Structural checks on the
//! route table (pattern overlap) live with the router, which owns matching.

use thiserror::Error;

use crate::config::{BucketLimit, Config, ObservabilityConfig, RateLimitsConfig, RouteEntry, ServerConfig};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid port {port} for {field}")]
    InvalidPort { port: u16, field: String },

    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

fn collect(errors: Vec<ValidationError>) -> ValidationResult<()> {
    let mut errors = errors;
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.into(),
        reason: reason.into(),
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.validate() {
            errors.push(e);
        }
        if let Err(e) = self.observability.validate() {
            errors.push(e);
        }
        if let Err(e) = self.rate_limits.validate() {
            errors.push(e);
        }
        for (idx, route) in self.routes.iter().enumerate() {
            if let Err(e) = validate_route(idx, route) {
                errors.push(e);
            }
        }

        collect(errors)
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> ValidationResult<()> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: self.port,
                field: "server.port".into(),
            });
        }
        if self.host.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "server.host".into(),
            });
        }
        if self.max_body_bytes == 0 {
            return Err(invalid("server.max-body-bytes", "must be greater than 0"));
        }
        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(invalid(
                "observability.log-level",
                format!("'{}' is not one of {:?}", self.log_level, LEVELS),
            ));
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            return Err(invalid(
                "observability.log-format",
                "must be 'json' or 'pretty'",
            ));
        }
        Ok(())
    }
}

fn validate_bucket(field: &str, bucket: &BucketLimit) -> ValidationResult<()> {
    if bucket.limit == 0 {
        return Err(invalid(format!("{field}.limit"), "must be greater than 0"));
    }
    if bucket.window_seconds == 0 {
        return Err(invalid(
            format!("{field}.window-seconds"),
            "must be greater than 0",
        ));
    }
    Ok(())
}

impl Validate for RateLimitsConfig {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors = Vec::new();

        for (field, bucket) in [
            ("rate-limits.default", &self.default),
            ("rate-limits.sox", &self.sox),
            ("rate-limits.user", &self.user),
        ] {
            if let Err(e) = validate_bucket(field, bucket) {
                errors.push(e);
            }
        }

        if self.abuse.window_seconds == 0 {
            errors.push(invalid(
                "rate-limits.abuse.window-seconds",
                "must be greater than 0",
            ));
        }
        if self.prune_interval_secs == 0 {
            errors.push(invalid(
                "rate-limits.prune-interval-secs",
                "must be greater than 0",
            ));
        }
        for (tenant, limit) in &self.overrides.tenants {
            if limit.requests_per_minute == 0 || limit.window_seconds == 0 {
                errors.push(invalid(
                    format!("rate-limits.overrides.tenants.{tenant}"),
                    "limit and window must be greater than 0",
                ));
            }
        }
        for (idx, endpoint) in self.overrides.endpoints.iter().enumerate() {
            if !endpoint.pattern.starts_with('/') {
                errors.push(invalid(
                    format!("rate-limits.overrides.endpoints[{idx}].pattern"),
                    "must start with '/'",
                ));
            }
            if endpoint.requests_per_minute == 0 || endpoint.window_seconds == 0 {
                errors.push(invalid(
                    format!("rate-limits.overrides.endpoints[{idx}]"),
                    "limit and window must be greater than 0",
                ));
            }
        }

        collect(errors)
    }
}

fn validate_route(idx: usize, route: &RouteEntry) -> ValidationResult<()> {
    let field = |name: &str| format!("routes[{idx}].{name}");

    if route.pattern.is_empty() {
        return Err(ValidationError::MissingField {
            field: field("pattern"),
        });
    }
    if route.base_url.trim().is_empty() {
        return Err(ValidationError::MissingField {
            field: field("base-url"),
        });
    }
    match url::Url::parse(&route.base_url) {
        Ok(parsed) if parsed.scheme() == "http" || parsed.scheme() == "https" => {}
        Ok(parsed) => {
            return Err(invalid(
                field("base-url"),
                format!("unsupported scheme '{}'", parsed.scheme()),
            ))
        }
        Err(e) => return Err(invalid(field("base-url"), e.to_string())),
    }
    if route.timeout.is_zero() {
        return Err(invalid(field("timeout"), "must be greater than 0"));
    }
    if route.cb_failure_threshold == 0 {
        return Err(invalid(field("cb-failure-threshold"), "must be at least 1"));
    }
    if route.backoff_initial_ms > route.backoff_max_ms {
        return Err(invalid(
            field("backoff-initial-ms"),
            "must not exceed backoff-max-ms",
        ));
    }
    Ok(())
}
