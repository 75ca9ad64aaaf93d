//! Configuration management for the ERP API gateway.
//!
//! The gateway reads a single JSON file, by default `~/.erp-gateway/config.json`.
//! Keys are kebab-case to match the route-table format used by operators.
//!
//! # Configuration Priority
//!
//! 1. Environment variables (ERP_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `ERP_GATEWAY_CONFIG` → path of the config file
//! - `ERP_GATEWAY_HOST` → server.host
//! - `ERP_GATEWAY_PORT` → server.port
//! - `ERP_LOG_LEVEL` → observability.log-level
//! - `ERP_LOG_FORMAT` → observability.log-format
//! - `ERP_JWT_SECRET` → auth.jwt-secret
//! - `ERP_REDIS_URL` → overrides.redis-url

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result, ResultExt};

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".erp-gateway"),
        |dirs| dirs.home_dir().join(".erp-gateway"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    std::env::var("ERP_GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"))
}

// ============================================================================
// Server
// ============================================================================

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Largest request body the gateway will buffer for a single round trip.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

// ============================================================================
// Observability
// ============================================================================

/// Logging and metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ObservabilityConfig {
    /// trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Serve Prometheus metrics on `/metrics`
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ============================================================================
// Auth
// ============================================================================

/// JWT verification settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuthConfig {
    /// HS256 secret used to verify bearer tokens.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Extra path prefixes that never require authentication.
    #[serde(default)]
    pub public_prefixes: Vec<String>,
}

// ============================================================================
// Routes
// ============================================================================

/// One entry of the route table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RouteEntry {
    /// Exact path, or a prefix ending in `*`.
    pub pattern: String,

    pub base_url: String,

    /// Upstream call timeout (integer seconds, or "500ms", "5s", "1m", "PT5S").
    #[serde(default = "default_route_timeout", with = "duration_format")]
    pub timeout: Duration,

    /// Additional attempts after the first.
    #[serde(default = "default_retries")]
    pub retries: u32,

    #[serde(default = "default_true")]
    pub auth_required: bool,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default)]
    pub rewrite: Option<RewriteEntry>,

    #[serde(default = "default_cb_failure_threshold")]
    pub cb_failure_threshold: u32,

    #[serde(default = "default_cb_reset_ms")]
    pub cb_reset_ms: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

impl RouteEntry {
    /// Create an entry with default settings for the given pattern and upstream.
    pub fn new(pattern: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            base_url: base_url.into(),
            timeout: default_route_timeout(),
            retries: default_retries(),
            auth_required: true,
            health_path: default_health_path(),
            rewrite: None,
            cb_failure_threshold: default_cb_failure_threshold(),
            cb_reset_ms: default_cb_reset_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

/// Prefix rewrite applied before forwarding.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RewriteEntry {
    pub remove_prefix: String,
    pub add_prefix: String,
}

fn default_route_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retries() -> u32 {
    2
}

fn default_true() -> bool {
    true
}

fn default_health_path() -> String {
    "/q/health/ready".into()
}

fn default_cb_failure_threshold() -> u32 {
    5
}

fn default_cb_reset_ms() -> u64 {
    30_000
}

fn default_backoff_initial_ms() -> u64 {
    100
}

fn default_backoff_max_ms() -> u64 {
    1000
}

// ============================================================================
// Rate limits
// ============================================================================

/// Limit and window of a rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BucketLimit {
    pub limit: u32,
    pub window_seconds: u64,
}

impl BucketLimit {
    pub const fn new(limit: u32, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }
}

/// Abuse detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AbuseConfig {
    /// Denials within the window that trigger a warning.
    #[serde(default = "default_abuse_threshold")]
    pub threshold: u32,

    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            threshold: default_abuse_threshold(),
            window_seconds: default_window_seconds(),
        }
    }
}

/// Statically configured limit for an endpoint pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointLimit {
    pub pattern: String,
    pub requests_per_minute: u32,
    pub window_seconds: u64,
}

/// Statically configured limit for a tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TenantLimit {
    pub requests_per_minute: u32,
    pub window_seconds: u64,
}

/// Overrides that ship with the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StaticOverrides {
    #[serde(default)]
    pub tenants: HashMap<String, TenantLimit>,

    #[serde(default)]
    pub endpoints: Vec<EndpointLimit>,
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RateLimitsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Per-IP bucket for ordinary paths.
    #[serde(default = "default_bucket")]
    pub default: BucketLimit,

    /// Stricter per-IP bucket for sensitive paths.
    #[serde(default = "sox_bucket")]
    pub sox: BucketLimit,

    /// Per-principal bucket.
    #[serde(default = "user_bucket")]
    pub user: BucketLimit,

    #[serde(default)]
    pub sox_path_prefixes: Vec<String>,

    #[serde(default)]
    pub abuse: AbuseConfig,

    #[serde(default)]
    pub overrides: StaticOverrides,

    /// How often expired counters are pruned.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: default_bucket(),
            sox: sox_bucket(),
            user: user_bucket(),
            sox_path_prefixes: Vec::new(),
            abuse: AbuseConfig::default(),
            overrides: StaticOverrides::default(),
            prune_interval_secs: default_prune_interval_secs(),
        }
    }
}

fn default_bucket() -> BucketLimit {
    BucketLimit::new(100, default_window_seconds())
}

fn sox_bucket() -> BucketLimit {
    BucketLimit::new(20, default_window_seconds())
}

fn user_bucket() -> BucketLimit {
    BucketLimit::new(500, default_window_seconds())
}

fn default_abuse_threshold() -> u32 {
    25
}

fn default_window_seconds() -> u64 {
    60
}

fn default_prune_interval_secs() -> u64 {
    60
}

/// Where administratively set overrides are read from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OverrideStoreConfig {
    /// Redis connection URL. In-memory store when unset.
    #[serde(default)]
    pub redis_url: Option<String>,
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration structure for the gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Ordered route table. A built-in identity route is used when empty.
    #[serde(default)]
    pub routes: Vec<RouteEntry>,

    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    #[serde(default)]
    pub overrides: OverrideStoreConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides applied.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("ERP_GATEWAY_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("ERP_GATEWAY_PORT") {
            match port.parse() {
                Ok(p) => self.server.port = p,
                Err(_) => tracing::warn!(value = %port, "Ignoring invalid ERP_GATEWAY_PORT"),
            }
        }
        if let Ok(level) = std::env::var("ERP_LOG_LEVEL") {
            self.observability.log_level = level;
        }
        if let Ok(format) = std::env::var("ERP_LOG_FORMAT") {
            self.observability.log_format = format;
        }
        if let Ok(secret) = std::env::var("ERP_JWT_SECRET") {
            self.auth.jwt_secret = Some(secret);
        }
        if let Ok(url) = std::env::var("ERP_REDIS_URL") {
            self.overrides.redis_url = Some(url);
        }
    }

    /// Socket address string the server binds to.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

// ============================================================================
// Durations
// ============================================================================

/// Parse a human-friendly duration.
///
/// Accepts bare seconds (`"5"`), suffixed values (`"250ms"`, `"5s"`, `"2m"`)
/// and the ISO-8601 subset `PT<n>S` / `PT<n>M`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let value = raw.trim();
    let invalid = || Error::Config(format!("invalid duration '{raw}'"));

    if let Some(iso) = value
        .strip_prefix("PT")
        .or_else(|| value.strip_prefix("pt"))
    {
        let iso = iso.to_ascii_uppercase();
        if let Some(secs) = iso.strip_suffix('S') {
            let secs: f64 = secs.parse().map_err(|_| invalid())?;
            return Duration::try_from_secs_f64(secs).map_err(|_| invalid());
        }
        if let Some(mins) = iso.strip_suffix('M') {
            return minutes(mins).ok_or_else(invalid);
        }
        return Err(invalid());
    }

    if let Some(ms) = value.strip_suffix("ms") {
        return ms.trim().parse().map(Duration::from_millis).map_err(|_| invalid());
    }
    if let Some(secs) = value.strip_suffix('s') {
        return secs.trim().parse().map(Duration::from_secs).map_err(|_| invalid());
    }
    if let Some(mins) = value.strip_suffix('m') {
        return minutes(mins).ok_or_else(invalid);
    }

    value.parse().map(Duration::from_secs).map_err(|_| invalid())
}

fn minutes(raw: &str) -> Option<Duration> {
    raw.trim()
        .parse::<u64>()
        .ok()
        .and_then(|m| m.checked_mul(60))
        .map(Duration::from_secs)
}

mod duration_format {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        if value.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", value.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", value.as_millis()))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}
