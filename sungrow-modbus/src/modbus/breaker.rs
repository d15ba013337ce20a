use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(with = "humantime_serde", default = "default_recovery_timeout")]
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
        }
    }
}

fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_timeout() -> Duration {
    DEFAULT_RECOVERY_TIMEOUT
}

/// Stops reconnect attempts for a cooldown period after repeated connection failures.
///
/// Closed allows every attempt. Reaching the failure threshold opens the breaker; once the
/// recovery timeout has elapsed a single probe is let through (half-open). A successful probe
/// closes the breaker again, a failed one re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    label: String,
    config: BreakerConfig,
    state: BreakerState,
    failure_count: u32,
    last_failure_time: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new<L: Into<String>>(label: L, config: BreakerConfig) -> Self {
        Self {
            label: label.into(),
            config,
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure_time(&self) -> Option<Instant> {
        self.last_failure_time
    }

    pub fn record_success(&mut self) {
        if self.state != BreakerState::Closed {
            info!(device = %self.label, "Circuit breaker closed");
        }
        self.failure_count = 0;
        self.last_failure_time = None;
        self.state = BreakerState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());

        match self.state {
            BreakerState::HalfOpen => {
                warn!(device = %self.label, "Recovery probe failed, circuit breaker re-opened");
                self.state = BreakerState::Open;
            }
            BreakerState::Closed if self.failure_count >= self.config.failure_threshold => {
                warn!(
                    device = %self.label,
                    failures = self.failure_count,
                    retry_in = ?self.config.recovery_timeout,
                    "Circuit breaker opened"
                );
                self.state = BreakerState::Open;
            }
            _ => {}
        }
    }

    /// Whether a connection attempt may be made now. Moves an open breaker whose recovery timeout
    /// has elapsed to half-open.
    pub fn can_attempt(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.elapsed_since_failure() >= self.config.recovery_timeout {
                    info!(device = %self.label, "Circuit breaker half-open, probing");
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Remaining cooldown while open; `None` once it has run out or when not open.
    pub fn time_until_retry(&self) -> Option<Duration> {
        match self.state {
            BreakerState::Open => self
                .config
                .recovery_timeout
                .checked_sub(self.elapsed_since_failure())
                .filter(|remaining| !remaining.is_zero()),
            _ => None,
        }
    }

    /// Open and still within the recovery window.
    pub fn is_open(&self) -> bool {
        self.time_until_retry().is_some()
    }

    fn elapsed_since_failure(&self) -> Duration {
        self.last_failure_time
            .map_or(Duration::MAX, |at| at.elapsed())
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[cfg(test)]
fn breaker(failure_threshold: u32) -> CircuitBreaker {
    CircuitBreaker::new(
        "test",
        BreakerConfig {
            failure_threshold,
            recovery_timeout: Duration::from_secs(60),
        },
    )
}

#[tokio::test(start_paused = true)]
async fn opens_after_threshold_and_recovers() {
    let mut breaker = breaker(3);
    assert_eq!(breaker.state(), BreakerState::Closed);

    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert!(breaker.can_attempt());

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.can_attempt());
    assert!(breaker.is_open());
    assert_eq!(breaker.time_until_retry(), Some(Duration::from_secs(60)));

    tokio::time::advance(Duration::from_secs(45)).await;
    assert_eq!(breaker.time_until_retry(), Some(Duration::from_secs(15)));
    assert!(!breaker.can_attempt());

    tokio::time::advance(Duration::from_secs(16)).await;
    assert_eq!(breaker.time_until_retry(), None);
    assert!(breaker.can_attempt());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    assert!(breaker.last_failure_time().is_some());
    breaker.record_success();
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.failure_count(), 0);
    assert_eq!(breaker.last_failure_time(), None);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_reopens() {
    let mut breaker = breaker(3);
    for _ in 0..3 {
        breaker.record_failure();
    }
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(breaker.can_attempt());
    assert_eq!(breaker.state(), BreakerState::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    assert!(!breaker.can_attempt());
}

#[test]
fn rejected_attempts_do_not_count() {
    let mut breaker = breaker(1);
    breaker.record_failure();
    assert_eq!(breaker.state(), BreakerState::Open);
    for _ in 0..10 {
        assert!(!breaker.can_attempt());
    }
    assert_eq!(breaker.failure_count(), 1);
}

#[test]
fn parse_breaker_config() {
    let config: BreakerConfig =
        serde_json::from_value(serde_json::json!({ "recovery_timeout": "90s" })).unwrap();
    assert_eq!(config.failure_threshold, DEFAULT_FAILURE_THRESHOLD);
    assert_eq!(config.recovery_timeout, Duration::from_secs(90));
}
