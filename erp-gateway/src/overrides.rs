//! Read side of administratively set rate-limit overrides.
//!
//! Overrides live in an external key/value store under two key families:
//!
//! - `rl:tenant:<tenant>` replaces the limit for every request of a tenant
//! - `rl:endpoint:<pattern>` replaces the limit for paths matching a pattern
//!
//! Values are encoded as `"<requestsPerMinute>:<windowSeconds>"`. A value that
//! does not decode is treated as if it were absent. Writes are owned by a
//! separate admin surface; this module only reads.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

use erp_common::config::{BucketLimit, StaticOverrides};

use crate::metrics::{self, error_kind};
use crate::routing::pattern_matches;

pub const TENANT_PREFIX: &str = "rl:tenant:";
pub const ENDPOINT_PREFIX: &str = "rl:endpoint:";

/// Override store failure.
#[derive(Debug, Error)]
pub enum OverrideStoreError {
    #[error("override store unavailable: {0}")]
    Unavailable(String),
}

/// Key/value lookup the override reader depends on.
#[async_trait]
pub trait OverrideStore: Send + Sync {
    /// Value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, OverrideStoreError>;

    /// All keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, OverrideStoreError>;
}

/// Decoded override value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitOverride {
    pub requests_per_minute: u32,
    pub window_seconds: u64,
}

impl LimitOverride {
    pub fn new(requests_per_minute: u32, window_seconds: u64) -> Self {
        Self {
            requests_per_minute,
            window_seconds,
        }
    }

    /// Decode `"<rpm>:<window>"`. Blank, malformed or non-positive values yield `None`.
    pub fn decode(raw: &str) -> Option<Self> {
        let (rpm, window) = raw.trim().split_once(':')?;
        if window.contains(':') {
            return None;
        }
        let rpm: u32 = rpm.trim().parse().ok()?;
        let window: u64 = window.trim().parse().ok()?;
        (rpm > 0 && window > 0).then(|| Self::new(rpm, window))
    }

    pub fn as_bucket(&self) -> BucketLimit {
        BucketLimit::new(self.requests_per_minute, self.window_seconds)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stores
// ─────────────────────────────────────────────────────────────────────────────

/// Process-local store, used when no external store is configured and in tests.
#[derive(Debug, Default)]
pub struct InMemoryOverrideStore {
    entries: DashMap<String, String>,
}

impl InMemoryOverrideStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

#[async_trait]
impl OverrideStore for InMemoryOverrideStore {
    async fn get(&self, key: &str) -> Result<Option<String>, OverrideStoreError> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, OverrideStoreError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}

#[cfg(feature = "redis-backend")]
pub use redis_store::RedisOverrideStore;

#[cfg(feature = "redis-backend")]
mod redis_store {
    use super::{OverrideStore, OverrideStoreError};
    use async_trait::async_trait;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    /// Redis-backed override store.
    #[derive(Clone)]
    pub struct RedisOverrideStore {
        conn: ConnectionManager,
    }

    impl RedisOverrideStore {
        pub async fn connect(url: &str) -> Result<Self, OverrideStoreError> {
            let client = redis::Client::open(url).map_err(unavailable)?;
            let conn = ConnectionManager::new(client).await.map_err(unavailable)?;
            Ok(Self { conn })
        }
    }

    fn unavailable(e: redis::RedisError) -> OverrideStoreError {
        OverrideStoreError::Unavailable(e.to_string())
    }

    #[async_trait]
    impl OverrideStore for RedisOverrideStore {
        async fn get(&self, key: &str) -> Result<Option<String>, OverrideStoreError> {
            let mut conn = self.conn.clone();
            conn.get::<_, Option<String>>(key).await.map_err(unavailable)
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>, OverrideStoreError> {
            let mut conn = self.conn.clone();
            conn.keys::<_, Vec<String>>(format!("{prefix}*"))
                .await
                .map_err(unavailable)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Resolves the effective override for a request.
#[derive(Clone)]
pub struct OverrideReader {
    store: Arc<dyn OverrideStore>,
    statics: Arc<StaticOverrides>,
}

impl OverrideReader {
    pub fn new(store: Arc<dyn OverrideStore>, statics: StaticOverrides) -> Self {
        Self {
            store,
            statics: Arc::new(statics),
        }
    }

    /// Effective override for `path` and `tenant`, first match wins:
    /// store endpoint, store tenant, static endpoint, static tenant.
    ///
    /// Store failures are logged and treated as "no override".
    pub async fn resolve(&self, path: &str, tenant: &str) -> Option<LimitOverride> {
        if let Some(found) = self.dynamic_endpoint_override(path).await {
            return Some(found);
        }
        if let Some(found) = self.tenant_override(tenant).await {
            return Some(found);
        }
        if let Some(endpoint) = self
            .statics
            .endpoints
            .iter()
            .find(|e| pattern_matches(&e.pattern, path))
        {
            return Some(LimitOverride::new(
                endpoint.requests_per_minute,
                endpoint.window_seconds,
            ));
        }
        self.statics
            .tenants
            .get(tenant)
            .map(|t| LimitOverride::new(t.requests_per_minute, t.window_seconds))
    }

    /// Stored override for a tenant.
    pub async fn tenant_override(&self, tenant: &str) -> Option<LimitOverride> {
        self.lookup(&format!("{TENANT_PREFIX}{tenant}")).await
    }

    /// Stored override for an endpoint pattern.
    pub async fn endpoint_override(&self, pattern: &str) -> Option<LimitOverride> {
        self.lookup(&format!("{ENDPOINT_PREFIX}{pattern}")).await
    }

    /// All decodable stored tenant overrides, keyed by tenant.
    pub async fn list_tenant_overrides(&self) -> Vec<(String, LimitOverride)> {
        self.list(TENANT_PREFIX).await
    }

    /// All decodable stored endpoint overrides, keyed by pattern.
    pub async fn list_endpoint_overrides(&self) -> Vec<(String, LimitOverride)> {
        self.list(ENDPOINT_PREFIX).await
    }

    async fn dynamic_endpoint_override(&self, path: &str) -> Option<LimitOverride> {
        let mut keys = match self.store.keys(ENDPOINT_PREFIX).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list endpoint overrides");
                metrics::mark_error(error_kind::RATE_LIMIT_UNAVAILABLE);
                return None;
            }
        };
        keys.sort();

        for key in keys {
            let pattern = key.strip_prefix(ENDPOINT_PREFIX).unwrap_or(&key);
            if !pattern_matches(pattern, path) {
                continue;
            }
            if let Some(found) = self.lookup(&key).await {
                return Some(found);
            }
        }
        None
    }

    async fn list(&self, prefix: &str) -> Vec<(String, LimitOverride)> {
        let mut keys = match self.store.keys(prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, prefix, "Failed to list overrides");
                metrics::mark_error(error_kind::RATE_LIMIT_UNAVAILABLE);
                return Vec::new();
            }
        };
        keys.sort();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(found) = self.lookup(&key).await {
                let name = key.strip_prefix(prefix).unwrap_or(&key);
                out.push((name.to_string(), found));
            }
        }
        out
    }

    async fn lookup(&self, key: &str) -> Option<LimitOverride> {
        match self.store.get(key).await {
            Ok(Some(raw)) => {
                let decoded = LimitOverride::decode(&raw);
                if decoded.is_none() {
                    tracing::debug!(key, value = %raw, "Ignoring malformed override");
                }
                decoded
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Override lookup failed");
                metrics::mark_error(error_kind::RATE_LIMIT_UNAVAILABLE);
                None
            }
        }
    }
}
