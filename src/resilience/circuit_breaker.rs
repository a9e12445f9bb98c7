//! Per-category circuit breaker.
//!
//! # State Machine
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──> Open
//!   Open ──(recovery_timeout elapsed, checked on can_execute)──> HalfOpen
//!   HalfOpen ──(success)──> Closed
//!   HalfOpen ──(failure)──> Open
//! ```
//!
//! Each category owns an independent breaker; a burst of arXiv failures
//! never blocks PDF extraction or metadata writes.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ErrorCategory;

/// Configuration shared by every breaker in a registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to trip the breaker.
    /// Default: 5.
    pub failure_threshold: u32,

    /// Milliseconds to wait in `Open` before allowing a trial call.
    /// Default: 60,000.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    /// # Errors
    /// Returns a description when the threshold is zero
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls are allowed.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// One trial call decides whether to close or re-open.
    HalfOpen,
}

/// Point-in-time view of a breaker, for reports and health output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
}

/// Failure gate for a single error category.
///
/// Thread-safe: all transitions happen under one mutex, so concurrent
/// failures can never interleave into an inconsistent count.
#[derive(Debug)]
pub struct CircuitBreaker {
    category: ErrorCategory,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(category: ErrorCategory, config: CircuitBreakerConfig) -> Self {
        Self {
            category,
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_failure_wall: None,
            }),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Whether a call may proceed right now.
    ///
    /// The only mutation performed is the lazy `Open -> HalfOpen` transition
    /// once the recovery timeout has elapsed.
    pub fn can_execute(&self) -> bool {
        self.can_execute_at(Instant::now())
    }

    /// [`can_execute`](Self::can_execute) evaluated at an explicit instant.
    pub fn can_execute_at(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.recovery_timeout() {
                    inner.state = CircuitState::HalfOpen;
                    info!(
                        category = %self.category,
                        "Circuit breaker half-open, allowing trial call"
                    );
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Closes the breaker and resets the count.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(category = %self.category, "Circuit breaker closed after successful call");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    /// [`record_failure`](Self::record_failure) evaluated at an explicit instant.
    pub fn record_failure_at(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        inner.last_failure_wall = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                warn!(category = %self.category, "Trial call failed, circuit breaker re-opened");
            }
            CircuitState::Closed if inner.consecutive_failures >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                warn!(
                    category = %self.category,
                    failures = inner.consecutive_failures,
                    "Circuit breaker opened"
                );
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_failure_time: inner.last_failure_wall,
        }
    }
}

/// Registry holding one breaker per category, created on first use.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: Mutex<BTreeMap<ErrorCategory, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(BTreeMap::new()),
        }
    }

    /// The breaker guarding `category`.
    pub fn get(&self, category: ErrorCategory) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(category)
            .or_insert_with(|| Arc::new(CircuitBreaker::new(category, self.config.clone())))
            .clone()
    }

    /// Snapshots of every breaker created so far.
    pub fn snapshot(&self) -> BTreeMap<ErrorCategory, BreakerSnapshot> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .map(|(category, breaker)| (*category, breaker.snapshot()))
            .collect()
    }

    /// Categories whose breaker is currently open.
    pub fn open_categories(&self) -> Vec<ErrorCategory> {
        let breakers = self.breakers.lock();
        breakers
            .iter()
            .filter(|(_, breaker)| breaker.state() == CircuitState::Open)
            .map(|(category, _)| *category)
            .collect()
    }
}
