//! Retry and recovery primitives
//!
//! Capped exponential backoff shared by signal delivery and peer reconnection,
//! a per-session reconnection tracker, and the relay circuit breaker that
//! decides when signaling degrades to direct mode.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Capped exponential backoff with symmetric jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (default: 5)
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 1000ms)
    pub initial_ms: u64,
    /// Upper bound on any single delay in milliseconds (default: 10000ms)
    pub max_ms: u64,
    /// Growth factor between consecutive delays (default: 1.5)
    pub multiplier: f64,
    /// Jitter as a fraction of the delay, applied in both directions (default: 0.15)
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_ms: 1000,
            max_ms: 10000,
            multiplier: 1.5,
            jitter: 0.15,
        }
    }
}

impl BackoffPolicy {
    /// Policy without jitter, for reproducible timing
    pub fn fixed(max_attempts: u32, initial_ms: u64, max_ms: u64, multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_ms,
            max_ms,
            multiplier,
            jitter: 0.0,
        }
    }

    /// Delay to wait before attempt number `attempt` (0-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = (self.initial_ms as f64) * self.multiplier.powi(attempt as i32);
        let base = base.min(self.max_ms as f64);

        let with_jitter = if self.jitter > 0.0 {
            let spread = base * self.jitter;
            base + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            base
        };

        Duration::from_millis(with_jitter.max(0.0) as u64)
    }

    /// Check if another attempt is allowed after `attempts` have been made
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub(crate) fn validate(&self, name: &str) -> crate::Result<()> {
        use crate::Error;

        if self.max_attempts == 0 {
            return Err(Error::InvalidConfig(format!(
                "{}.max_attempts must be at least 1",
                name
            )));
        }
        if self.initial_ms == 0 || self.max_ms < self.initial_ms {
            return Err(Error::InvalidConfig(format!(
                "{} requires 0 < initial_ms <= max_ms, got {}..{}",
                name, self.initial_ms, self.max_ms
            )));
        }
        if self.multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "{}.multiplier must be >= 1.0, got {}",
                name, self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::InvalidConfig(format!(
                "{}.jitter must be in [0, 1), got {}",
                name, self.jitter
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Reconnection tracking
// ============================================================================

/// Bounded reconnection attempts for one negotiation session
///
/// The engine arms its own timers; this only hands out delays and refuses
/// once the attempt budget is spent.
#[derive(Debug, Clone)]
pub struct ReconnectionTracker {
    policy: BackoffPolicy,
    attempts: u32,
}

impl ReconnectionTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    /// Delay before the next attempt, or `None` when the budget is exhausted
    pub fn next_delay(&self) -> Option<Duration> {
        if self.policy.should_retry(self.attempts) {
            Some(self.policy.delay(self.attempts))
        } else {
            None
        }
    }

    /// Record that an attempt was made
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        !self.policy.should_retry(self.attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts
    }

    pub fn reset(&mut self) {
        if self.attempts > 0 {
            debug!("Reconnection counter reset after {} attempts", self.attempts);
        }
        self.attempts = 0;
    }
}

// ============================================================================
// Relay circuit breaker
// ============================================================================

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Relay in use
    Closed,
    /// Relay considered exhausted; signaling runs in direct mode
    Open,
    /// Recovery window elapsed; next relay call decides
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Counts consecutive relay failures and opens after a threshold
pub struct RelayBreaker {
    name: String,
    failure_threshold: u32,
    recovery: Duration,
    inner: Mutex<BreakerInner>,
}

impl RelayBreaker {
    /// Create a new breaker
    ///
    /// # Arguments
    /// * `name` - Label for logging
    /// * `failure_threshold` - Consecutive failures before opening
    /// * `recovery` - Time in the open state before trying the relay again
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            recovery,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Current state, moving Open -> HalfOpen once the recovery window passed
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.recovery {
                    info!("Circuit '{}': transitioning to half-open", self.name);
                    inner.state = CircuitState::HalfOpen;
                }
            }
        }
        inner.state
    }

    /// Record a failure; returns true if this call opened the circuit
    pub fn record_failure(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                debug!(
                    "Circuit '{}': failure recorded ({}/{})",
                    self.name, inner.failures, self.failure_threshold
                );
                if inner.failures >= self.failure_threshold {
                    warn!(
                        "Circuit '{}': opening after {} consecutive failures",
                        self.name, inner.failures
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                warn!("Circuit '{}': failure in half-open state, reopening", self.name);
                inner.failures += 1;
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                false
            }
            CircuitState::Open => {
                inner.failures += 1;
                false
            }
        }
    }

    /// Record a success; returns true if this call closed an open circuit
    pub fn record_success(&self) -> bool {
        let mut inner = self.inner.lock();
        let was_open = inner.state != CircuitState::Closed;
        if was_open {
            info!("Circuit '{}': closing after successful relay call", self.name);
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        was_open
    }

    /// Open the circuit regardless of the failure count; returns true if it was closed
    pub fn trip(&self) -> bool {
        let mut inner = self.inner.lock();
        let was_closed = inner.state == CircuitState::Closed;
        if was_closed {
            warn!("Circuit '{}': forced open", self.name);
        }
        inner.failures = inner.failures.max(self.failure_threshold);
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        was_closed
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failures
    }

    pub fn is_open(&self) -> bool {
        self.state() != CircuitState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_ms, 1000);
        assert_eq!(policy.max_ms, 10000);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = BackoffPolicy::fixed(5, 1000, 10000, 1.5);

        assert_eq!(policy.delay(0), Duration::from_millis(1000));
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(2), Duration::from_millis(2250));
    }

    #[test]
    fn test_backoff_max_clamp() {
        let policy = BackoffPolicy::fixed(20, 1000, 10000, 1.5);
        assert_eq!(policy.delay(12), Duration::from_millis(10000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let policy = BackoffPolicy::default();
        for _ in 0..200 {
            let d = policy.delay(0).as_millis() as u64;
            assert!((850..=1150).contains(&d), "delay {} out of jitter bounds", d);
        }
    }

    #[test]
    fn test_backoff_validate() {
        assert!(BackoffPolicy::default().validate("reconnect").is_ok());

        let bad = BackoffPolicy {
            multiplier: 0.5,
            ..Default::default()
        };
        assert!(bad.validate("reconnect").is_err());

        let bad = BackoffPolicy {
            jitter: 1.0,
            ..Default::default()
        };
        assert!(bad.validate("reconnect").is_err());
    }

    #[test]
    fn test_reconnection_tracker_exhausts() {
        let mut tracker = ReconnectionTracker::new(BackoffPolicy::fixed(3, 100, 1000, 2.0));

        assert_eq!(tracker.next_delay(), Some(Duration::from_millis(100)));
        tracker.record_attempt();
        assert_eq!(tracker.next_delay(), Some(Duration::from_millis(200)));
        tracker.record_attempt();
        tracker.record_attempt();
        assert!(tracker.is_exhausted());
        assert_eq!(tracker.next_delay(), None);

        tracker.reset();
        assert_eq!(tracker.attempts(), 0);
        assert!(!tracker.is_exhausted());
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let breaker = RelayBreaker::new("test", 3, Duration::from_secs(30));

        assert!(!breaker.record_failure());
        assert!(!breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.record_failure());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn test_breaker_success_resets() {
        let breaker = RelayBreaker::new("test", 3, Duration::from_secs(30));

        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.record_success());
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn test_breaker_trip() {
        let breaker = RelayBreaker::new("test", 3, Duration::from_secs(30));
        assert!(breaker.trip());
        assert!(breaker.is_open());
        assert!(!breaker.trip());
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_half_open_after_recovery() {
        let breaker = RelayBreaker::new("test", 1, Duration::from_secs(5));

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        assert!(breaker.record_success());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
