//! Per-route circuit breaker.
//!
//! Stops sending traffic to an upstream that keeps failing and tries it
//! again after a cool-down.
//!
//! # States
//!
//! ```text
//! ┌─────────┐   failures >= threshold   ┌────────┐
//! │ CLOSED  │ ─────────────────────────▶│  OPEN  │
//! │(normal) │                           │(reject)│
//! └─────────┘                           └────────┘
//!      ▲                                  ▲    │
//!      │ trial success      trial failure │    │ reset_ms elapsed
//!      │                                  │    ▼
//!      │                              ┌───────────┐
//!      └──────────────────────────────│ HALF_OPEN │
//!                                     │(one trial)│
//!                                     └───────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let Some(permit) = breaker.try_acquire() else {
//!     return Err(GatewayError::CircuitOpen { route });
//! };
//! match call_upstream().await {
//!     Ok(resp) => { permit.success(); Ok(resp) }
//!     Err(e) => { permit.failure(); Err(e) }
//! }
//! ```
//!
//! In HALF_OPEN exactly one caller obtains a trial permit. Every other caller
//! is rejected until that trial settles, even when many requests observe the
//! OPEN → HALF_OPEN transition at the same instant.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::metrics;

// ============================================================================
// Circuit Breaker State
// ============================================================================

/// Current state of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    Closed,
    /// Circuit tripped - requests short-circuited
    Open,
    /// Probing recovery - a single trial request allowed
    HalfOpen,
}

impl CircuitState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to keep the circuit open before allowing a trial
    pub reset_timeout: Duration,
    /// Name for logging purposes (the route pattern)
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_millis(30_000),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a custom name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold (at least 1)
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

// ============================================================================
// Circuit Breaker Implementation
// ============================================================================

/// Circuit breaker guarding one route's upstream.
///
/// All transitions are lock-free atomics; `opened_at` is measured in
/// milliseconds from the breaker's creation on a monotonic clock.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    failure_count: AtomicU32,
    opened_at: AtomicU64,
    state: AtomicU32,
    trial_in_flight: AtomicBool,
    epoch: Instant,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            failure_count: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
            state: AtomicU32::new(CircuitState::Closed as u32),
            trial_in_flight: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    /// Create a circuit breaker with default configuration and a name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::with_name(name))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Current state as last recorded.
    ///
    /// An OPEN breaker whose cool-down has elapsed reports OPEN until a
    /// request actually moves it to HALF_OPEN.
    pub fn state(&self) -> CircuitState {
        CircuitState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Ask for permission to call the upstream.
    ///
    /// Returns `None` when the call must be short-circuited. A rejected call
    /// does not count toward failure or success statistics.
    pub fn try_acquire(&self) -> Option<CircuitPermit<'_>> {
        loop {
            match self.state() {
                CircuitState::Closed => return Some(CircuitPermit::new(self, false)),
                CircuitState::Open => {
                    let opened_at = self.opened_at.load(Ordering::Acquire);
                    let elapsed_ms = self.now_ms().saturating_sub(opened_at);
                    if elapsed_ms < self.reset_ms() {
                        return None;
                    }
                    if self
                        .state
                        .compare_exchange(
                            CircuitState::Open as u32,
                            CircuitState::HalfOpen as u32,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        tracing::info!(
                            circuit = %self.config.name,
                            elapsed_ms,
                            "Circuit breaker transitioning to HALF_OPEN"
                        );
                        metrics::set_circuit_state(&self.config.name, CircuitState::HalfOpen);
                    }
                    // Re-read: either we moved it to HALF_OPEN or someone else
                    // changed the state first.
                }
                CircuitState::HalfOpen => {
                    return self
                        .trial_in_flight
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .ok()
                        .map(|_| CircuitPermit::new(self, true));
                }
            }
        }
    }

    /// Get statistics about the circuit breaker
    pub fn stats(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            failure_threshold: self.config.failure_threshold,
            reset_ms: self.reset_ms(),
        }
    }

    // ========================================================================
    // Private Methods
    // ========================================================================

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn reset_ms(&self) -> u64 {
        self.config.reset_timeout.as_millis() as u64
    }

    fn record_success(&self, trial: bool) {
        if trial {
            self.close_circuit();
            return;
        }
        if self.state() == CircuitState::Closed {
            self.failure_count.store(0, Ordering::Release);
        }
        tracing::trace!(circuit = %self.config.name, "Circuit breaker recorded success");
    }

    fn record_failure(&self, trial: bool) {
        if trial {
            self.open_circuit("trial request failed");
            return;
        }

        // Failures from requests admitted before the breaker left CLOSED are
        // already accounted for by the transition.
        if self.state() != CircuitState::Closed {
            return;
        }

        let count = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::trace!(
            circuit = %self.config.name,
            failure_count = count,
            "Circuit breaker recorded failure"
        );
        if count >= self.config.failure_threshold {
            self.opened_at.store(self.now_ms(), Ordering::Release);
            if self
                .state
                .compare_exchange(
                    CircuitState::Closed as u32,
                    CircuitState::Open as u32,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                tracing::warn!(
                    circuit = %self.config.name,
                    failure_count = count,
                    reset_ms = self.reset_ms(),
                    "Circuit breaker OPENED"
                );
                metrics::set_circuit_state(&self.config.name, CircuitState::Open);
            }
        }
    }

    fn open_circuit(&self, reason: &str) {
        self.opened_at.store(self.now_ms(), Ordering::Release);
        self.state.store(CircuitState::Open as u32, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);

        tracing::warn!(
            circuit = %self.config.name,
            reason,
            reset_ms = self.reset_ms(),
            "Circuit breaker OPENED"
        );
        metrics::set_circuit_state(&self.config.name, CircuitState::Open);
    }

    fn close_circuit(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.opened_at.store(0, Ordering::Release);
        self.state.store(CircuitState::Closed as u32, Ordering::Release);
        self.trial_in_flight.store(false, Ordering::Release);

        tracing::info!(circuit = %self.config.name, "Circuit breaker CLOSED");
        metrics::set_circuit_state(&self.config.name, CircuitState::Closed);
    }
}

// ============================================================================
// Permit
// ============================================================================

/// Permission to make one upstream call.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// Dropping an unsettled trial permit frees the trial slot without changing
/// state, so an abandoned request cannot wedge the breaker in HALF_OPEN.
#[must_use = "settle the permit with success() or failure()"]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> CircuitPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    /// Whether this permit is the single HALF_OPEN trial.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.trial_in_flight.store(false, Ordering::Release);
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about a circuit breaker's current state
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub failure_threshold: u32,
    pub reset_ms: u64,
}

// ============================================================================
// Tests
// ============================================================================
