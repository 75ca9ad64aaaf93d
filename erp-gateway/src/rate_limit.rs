//! Fixed-window rate limiting.
//!
//! Three buckets:
//! - `default`: per client IP
//! - `sox`: per client IP, stricter, for configured sensitive path prefixes
//! - `user`: per authenticated principal
//!
//! Each check increments the counter of `(bucket, key type, key, window
//! length)` for the current window, where the window starts at
//! `floor(now / window_seconds) * window_seconds`. A counter only resets when
//! its window start advances; an override with a different window length
//! counts in its own entry instead of restarting the shared one. Denials also feed a
//! per-key abuse counter that decays over its own window and logs a warning
//! when it reaches the configured threshold.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::{HeaderMap, HeaderValue};
use erp_common::config::{BucketLimit, RateLimitsConfig};

use crate::metrics;
use crate::overrides::OverrideReader;

pub const LIMIT_HEADER: &str = "X-RateLimit-Limit";
pub const REMAINING_HEADER: &str = "X-RateLimit-Remaining";
pub const RESET_HEADER: &str = "X-RateLimit-Reset";

/// Which bucket produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBucket {
    Default,
    Sox,
    User,
}

impl RateLimitBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Sox => "sox",
            Self::User => "user",
        }
    }
}

impl fmt::Display for RateLimitBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the counter key identifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ip,
    User,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::User => "user",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_epoch_seconds: u64,
    pub bucket: RateLimitBucket,
    pub key_type: KeyType,
    pub key: String,
}

impl RateLimitDecision {
    /// Write the `X-RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(self.reset_epoch_seconds));
    }
}

#[derive(Debug)]
struct WindowState {
    window_start: u64,
    window_seconds: u64,
    count: AtomicU64,
}

impl WindowState {
    fn new(window_start: u64, window_seconds: u64) -> Self {
        Self {
            window_start,
            window_seconds,
            count: AtomicU64::new(0),
        }
    }

    fn is_current(&self, window_start: u64) -> bool {
        self.window_start == window_start
    }
}

#[derive(Debug)]
struct AbuseState {
    started_at: u64,
    count: u32,
}

/// Rate limiter shared by all requests.
pub struct RateLimiter {
    config: RateLimitsConfig,
    overrides: Option<OverrideReader>,
    windows: DashMap<String, WindowState>,
    abuse: DashMap<String, AbuseState>,
}

fn now_epoch_seconds() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl RateLimiter {
    pub fn new(config: RateLimitsConfig) -> Self {
        Self {
            config,
            overrides: None,
            windows: DashMap::new(),
            abuse: DashMap::new(),
        }
    }

    /// Consult `reader` for tenant and endpoint overrides on IP checks.
    pub fn with_overrides(mut self, reader: OverrideReader) -> Self {
        self.overrides = Some(reader);
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Bucket applied to IP checks for `path`.
    pub fn bucket_for_path(&self, path: &str) -> RateLimitBucket {
        if self
            .config
            .sox_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            RateLimitBucket::Sox
        } else {
            RateLimitBucket::Default
        }
    }

    /// Check and count a request from `ip` to `path`.
    pub async fn check_ip_limit(&self, ip: &str, path: &str, tenant: &str) -> RateLimitDecision {
        self.check_ip_limit_at(ip, path, tenant, now_epoch_seconds())
            .await
    }

    pub async fn check_ip_limit_at(
        &self,
        ip: &str,
        path: &str,
        tenant: &str,
        now: u64,
    ) -> RateLimitDecision {
        let bucket = self.bucket_for_path(path);
        let static_limit = match bucket {
            RateLimitBucket::Sox => self.config.sox,
            _ => self.config.default,
        };

        let limit = match &self.overrides {
            Some(reader) => reader
                .resolve(path, tenant)
                .await
                .map(|o| o.as_bucket())
                .unwrap_or(static_limit),
            None => static_limit,
        };

        self.check_at(bucket, KeyType::Ip, ip, limit, now)
    }

    /// Check and count a request from an authenticated principal.
    ///
    /// Returns `None` when there is no principal.
    pub fn check_user_limit(&self, username: Option<&str>) -> Option<RateLimitDecision> {
        self.check_user_limit_at(username, now_epoch_seconds())
    }

    pub fn check_user_limit_at(&self, username: Option<&str>, now: u64) -> Option<RateLimitDecision> {
        let username = username.filter(|u| !u.is_empty())?;
        Some(self.check_at(
            RateLimitBucket::User,
            KeyType::User,
            username,
            self.config.user,
            now,
        ))
    }

    fn check_at(
        &self,
        bucket: RateLimitBucket,
        key_type: KeyType,
        key: &str,
        limit: BucketLimit,
        now: u64,
    ) -> RateLimitDecision {
        let window = limit.window_seconds.max(1);
        let window_start = now / window * window;
        let counter_key = format!("{bucket}:{key_type}:{key}:{window}");

        let count = self.increment(&counter_key, window_start, window);
        let allowed = count <= u64::from(limit.limit);
        let remaining = u64::from(limit.limit).saturating_sub(count) as u32;

        let decision = RateLimitDecision {
            allowed,
            limit: limit.limit,
            remaining,
            reset_epoch_seconds: window_start + window,
            bucket,
            key_type,
            key: key.to_string(),
        };

        if !allowed {
            let strikes = self.record_abuse(key_type, key, now);
            tracing::debug!(
                bucket = %bucket,
                key_type = %key_type,
                key,
                limit = limit.limit,
                strikes,
                "Rate limit exceeded"
            );
        }

        decision
    }

    fn increment(&self, key: &str, window_start: u64, window_seconds: u64) -> u64 {
        // Fast path: the entry exists for the current window.
        {
            if let Some(state) = self.windows.get(key) {
                if state.is_current(window_start) {
                    return state.count.fetch_add(1, Ordering::AcqRel) + 1;
                }
            }
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowState::new(window_start, window_seconds));
        if entry.window_start < window_start {
            *entry = WindowState::new(window_start, window_seconds);
        }
        entry.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn record_abuse(&self, key_type: KeyType, key: &str, now: u64) -> u32 {
        let window = self.config.abuse.window_seconds.max(1);
        let abuse_key = format!("{key_type}:{key}");
        let mut entry = self.abuse.entry(abuse_key).or_insert(AbuseState {
            started_at: now,
            count: 0,
        });
        if now.saturating_sub(entry.started_at) >= window {
            entry.started_at = now;
            entry.count = 0;
        }
        entry.count += 1;

        if entry.count == self.config.abuse.threshold {
            tracing::warn!(
                key_type = %key_type,
                key,
                denials = entry.count,
                window_seconds = window,
                "Possible abuse: repeated rate-limit denials"
            );
            metrics::mark_abuse(key_type);
        }
        entry.count
    }

    /// Denials counted for a key in its current abuse window.
    pub fn abuse_count(&self, key_type: KeyType, key: &str) -> u32 {
        self.abuse
            .get(&format!("{key_type}:{key}"))
            .map(|a| a.count)
            .unwrap_or(0)
    }

    /// Drop windows that have ended and abuse counters that have decayed.
    pub fn prune(&self, now: u64) -> usize {
        let before = self.windows.len() + self.abuse.len();
        self.windows
            .retain(|_, s| s.window_start + s.window_seconds > now);
        let abuse_window = self.config.abuse.window_seconds.max(1);
        self.abuse
            .retain(|_, a| now.saturating_sub(a.started_at) < abuse_window);
        let removed = before.saturating_sub(self.windows.len() + self.abuse.len());
        if removed > 0 {
            tracing::debug!(removed, "Pruned rate-limit state");
        }
        removed
    }

    /// Prune against the current clock.
    pub fn prune_expired(&self) -> usize {
        self.prune(now_epoch_seconds())
    }

    /// Number of live counter entries.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
