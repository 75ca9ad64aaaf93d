//! Route table, route resolution and upstream path rewriting.
//!
//! Patterns are either exact (`/api/v1/status`) or a literal prefix followed by
//! a trailing `*` (`/api/v1/identity/*`). The table is validated once when it is
//! built: overlapping patterns and relative health paths are rejected, so at
//! most one route can ever match a request path.

use std::sync::Arc;
use std::time::Duration;

use erp_common::config::{RewriteEntry, RouteEntry};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::GatewayError;

/// Upstream a route forwards to.
#[derive(Debug, Clone)]
pub struct ServiceTarget {
    pub base_url: String,
    pub timeout: Duration,
    /// Additional attempts after the first.
    pub retries: u32,
    pub health_path: String,
    pub cb_failure_threshold: u32,
    pub cb_reset_ms: u64,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl ServiceTarget {
    /// Sleep before retry number `attempt` (0-based): `min(initial * 2^attempt, max)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.backoff_initial
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Prefix replacement applied to the incoming path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRewrite {
    pub remove_prefix: String,
    pub add_prefix: String,
}

impl From<&RewriteEntry> for PathRewrite {
    fn from(entry: &RewriteEntry) -> Self {
        Self {
            remove_prefix: entry.remove_prefix.clone(),
            add_prefix: entry.add_prefix.clone(),
        }
    }
}

/// A resolved route together with its circuit breaker.
#[derive(Debug)]
pub struct ServiceRoute {
    pub pattern: String,
    pub target: ServiceTarget,
    pub auth_required: bool,
    pub rewrite: Option<PathRewrite>,
    pub breaker: CircuitBreaker,
}

impl ServiceRoute {
    /// Build a route and its breaker from a configuration entry.
    pub fn from_entry(entry: &RouteEntry) -> Self {
        let target = ServiceTarget {
            base_url: entry.base_url.trim_end_matches('/').to_string(),
            timeout: entry.timeout,
            retries: entry.retries,
            health_path: entry.health_path.clone(),
            cb_failure_threshold: entry.cb_failure_threshold,
            cb_reset_ms: entry.cb_reset_ms,
            backoff_initial: Duration::from_millis(entry.backoff_initial_ms),
            backoff_max: Duration::from_millis(entry.backoff_max_ms),
        };
        let breaker = CircuitBreaker::new(
            CircuitBreakerConfig::with_name(entry.pattern.clone())
                .failure_threshold(entry.cb_failure_threshold)
                .reset_timeout(Duration::from_millis(entry.cb_reset_ms)),
        );

        Self {
            pattern: entry.pattern.clone(),
            target,
            auth_required: entry.auth_required,
            rewrite: entry.rewrite.as_ref().map(PathRewrite::from),
            breaker,
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.pattern, path)
    }

    /// Upstream path for an incoming request path.
    pub fn upstream_path(&self, path: &str) -> String {
        map_upstream_path(self.rewrite.as_ref(), path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Matching and rewriting
// ─────────────────────────────────────────────────────────────────────────────

/// Literal prefix of a wildcard pattern, `None` for exact patterns.
fn wildcard_prefix(pattern: &str) -> Option<&str> {
    pattern.strip_suffix('*')
}

/// Whether `pattern` matches `path`.
///
/// `/a/*` matches `/a`, `/a/` and anything under `/a/`. An exact pattern
/// matches only the identical path.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    match wildcard_prefix(pattern) {
        Some(prefix) => {
            path.starts_with(prefix)
                || prefix
                    .strip_suffix('/')
                    .is_some_and(|bare| !bare.is_empty() && path == bare)
        }
        None => pattern == path,
    }
}

fn with_leading_slash(prefix: &str) -> String {
    if prefix.starts_with('/') {
        prefix.to_string()
    } else {
        format!("/{prefix}")
    }
}

/// Map an incoming path to the upstream path.
///
/// Without a rewrite, or when the path does not start with `remove_prefix`,
/// the path is returned unchanged. Otherwise `remove_prefix` is replaced by
/// `add_prefix`.
pub fn map_upstream_path(rewrite: Option<&PathRewrite>, path: &str) -> String {
    let Some(rewrite) = rewrite else {
        return path.to_string();
    };

    let remove = with_leading_slash(&rewrite.remove_prefix);
    let Some(rest) = path.strip_prefix(remove.as_str()) else {
        return path.to_string();
    };

    let add = with_leading_slash(&rewrite.add_prefix);
    let add = add.trim_end_matches('/');
    let tail = if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        format!("/{rest}")
    };
    format!("{add}{tail}")
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Whether some request path could match both patterns.
fn patterns_overlap(a: &str, b: &str) -> bool {
    match (wildcard_prefix(a), wildcard_prefix(b)) {
        (Some(pa), Some(pb)) => pa.starts_with(pb) || pb.starts_with(pa),
        (Some(_), None) => pattern_matches(a, b),
        (None, Some(_)) => pattern_matches(b, a),
        (None, None) => a == b,
    }
}

/// Validate a route table. Any error here must abort startup.
pub fn validate_routes(entries: &[RouteEntry]) -> Result<(), GatewayError> {
    for entry in entries {
        let pattern = &entry.pattern;
        if !pattern.starts_with('/') {
            return Err(GatewayError::RouteConfigInvalid(format!(
                "pattern '{pattern}' must start with '/'"
            )));
        }
        if pattern.trim_end_matches('*').contains('*') || pattern.ends_with("**") {
            return Err(GatewayError::RouteConfigInvalid(format!(
                "pattern '{pattern}' may only use '*' as its last character"
            )));
        }
        if !entry.health_path.starts_with('/') {
            return Err(GatewayError::RouteConfigInvalid(format!(
                "health path '{}' of route '{pattern}' must be absolute",
                entry.health_path
            )));
        }
    }

    for (i, a) in entries.iter().enumerate() {
        for b in &entries[i + 1..] {
            if patterns_overlap(&a.pattern, &b.pattern) {
                return Err(GatewayError::RouteConfigInvalid(format!(
                    "route patterns '{}' and '{}' overlap",
                    a.pattern, b.pattern
                )));
            }
        }
    }

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Resolver
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves request paths against the validated route table.
#[derive(Debug, Clone)]
pub struct RouteResolver {
    routes: Arc<Vec<Arc<ServiceRoute>>>,
}

impl RouteResolver {
    /// Build a resolver from route entries, validating them first.
    pub fn new(entries: &[RouteEntry]) -> Result<Self, GatewayError> {
        validate_routes(entries)?;
        let routes = entries
            .iter()
            .map(|e| Arc::new(ServiceRoute::from_entry(e)))
            .collect();

        Ok(Self {
            routes: Arc::new(routes),
        })
    }

    /// Build from configuration, falling back to the built-in table when no
    /// routes are configured.
    pub fn from_config(entries: &[RouteEntry]) -> Result<Self, GatewayError> {
        if entries.is_empty() {
            tracing::info!("No routes configured, using built-in route table");
            return Self::new(&default_routes());
        }
        Self::new(entries)
    }

    /// The route matching `path`.
    pub fn resolve(&self, path: &str) -> Result<Arc<ServiceRoute>, GatewayError> {
        self.routes
            .iter()
            .find(|r| r.matches(path))
            .cloned()
            .ok_or_else(|| GatewayError::RouteNotFound {
                path: path.to_string(),
            })
    }

    pub fn routes(&self) -> &[Arc<ServiceRoute>] {
        &self.routes
    }
}

/// Route table used when the configuration has none.
pub fn default_routes() -> Vec<RouteEntry> {
    let mut identity = RouteEntry::new("/api/v1/identity/*", "http://localhost:8081");
    identity.auth_required = false;
    vec![identity]
}
