//! Per-source circuit breaker.
//!
//! ```text
//!   Closed ──(failure_threshold consecutive failures)──▶ Open
//!   Open ──(cooldown elapsed, next allow())──▶ HalfOpen (one probe)
//!   HalfOpen ──(success_threshold successes)──▶ Closed
//!   HalfOpen ──(any failure)──▶ Open
//! ```
//!
//! Callers only see `allow()` / `record_success()` / `record_failure()`;
//! the lock is internal and never held across an await.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tierscale_core::CollectorConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakerState::Closed => f.write_str("closed"),
            BreakerState::Open => f.write_str("open"),
            BreakerState::HalfOpen => f.write_str("half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
}

impl From<&CollectorConfig> for BreakerConfig {
    fn from(c: &CollectorConfig) -> Self {
        Self {
            failure_threshold: c.breaker_failure_threshold.max(1),
            success_threshold: c.breaker_success_threshold.max(1),
            cooldown: c.breaker_cooldown,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// Start of the outstanding half-open probe, if any.
    probe_started: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Whether a call may go through right now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.config.cooldown);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_started = Some(now);
                    info!(source = %self.name, "circuit breaker half-open, probing");
                    true
                } else {
                    debug!(source = %self.name, "circuit breaker open, call rejected");
                    false
                }
            }
            BreakerState::HalfOpen => {
                // An abandoned probe must not wedge the breaker.
                let free = inner
                    .probe_started
                    .is_none_or(|at| now.saturating_duration_since(at) >= self.config.cooldown);
                if free {
                    inner.probe_started = Some(now);
                }
                free
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                inner.probe_started = None;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    info!(source = %self.name, "circuit breaker closed, source recovered");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        source = %self.name,
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.opened_at = Some(now);
                inner.probe_started = None;
                inner.consecutive_successes = 0;
                warn!(source = %self.name, "half-open probe failed, circuit breaker reopened");
            }
            BreakerState::Open => inner.opened_at = Some(now),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                cooldown: Duration::from_secs(30),
            },
        )
    }

    #[test]
    fn starts_closed_and_allows() {
        let b = breaker(3, 1);
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.allow());
    }

    #[test]
    fn opens_after_threshold() {
        let b = breaker(3, 1);
        b.record_failure();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow());
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker(3, 1);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_after_cooldown_allows_single_probe() {
        let b = breaker(1, 1);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        assert!(!b.allow_at(t0 + Duration::from_secs(10)));

        let later = t0 + Duration::from_secs(31);
        assert!(b.allow_at(later));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Second caller while the probe is outstanding is rejected.
        assert!(!b.allow_at(later + Duration::from_secs(1)));
    }

    #[test]
    fn half_open_success_closes() {
        let b = breaker(1, 2);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        assert!(b.allow_at(t0 + Duration::from_secs(31)));
        b.record_success();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(b.allow_at(t0 + Duration::from_secs(32)));
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let b = breaker(1, 1);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        let probe = t0 + Duration::from_secs(31);
        assert!(b.allow_at(probe));
        b.record_failure_at(probe);
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.allow_at(probe + Duration::from_secs(5)));
    }

    #[test]
    fn abandoned_probe_is_released_after_cooldown() {
        let b = breaker(1, 1);
        let t0 = Instant::now();
        b.record_failure_at(t0);
        let probe = t0 + Duration::from_secs(31);
        assert!(b.allow_at(probe));
        assert!(b.allow_at(probe + Duration::from_secs(31)));
    }

    #[test]
    fn config_from_collector_settings() {
        let config = BreakerConfig::from(&CollectorConfig::default());
        assert_eq!(config.failure_threshold, 3);
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }
}
