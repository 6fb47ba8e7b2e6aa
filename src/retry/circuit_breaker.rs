//! Circuit breakers keyed by operation class.
//!
//! States:
//! - Closed: attempts pass; consecutive rate-limit failures are counted
//! - Open: attempts are rejected until the open timeout elapses
//! - HalfOpen: a bounded number of probes pass; one success closes the
//!   circuit, any retryable failure reopens it
//!
//! Only rate-limit failures trip a closed breaker. Timeouts and unknown
//! errors are retried but leave the count alone; fatal errors are ignored.

use super::ErrorKind;
use crate::models::Config;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Breaker for one operation class.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    half_open_max_calls: u32,
    state: CircuitState,
    failure_count: u32,
    success_count: u64,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration, half_open_max_calls: u32) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            half_open_max_calls: half_open_max_calls.max(1),
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            opened_at: None,
            half_open_calls: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_timeout(),
            config.circuit_breaker_half_open_max_calls,
        )
    }

    /// Current state, without applying the open timeout.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Ask to make one attempt.
    ///
    /// Returns `Err(retry_in)` when the attempt must not be made.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let remaining = self.open_remaining();
                if remaining > Duration::ZERO {
                    return Err(remaining);
                }
                self.state = CircuitState::HalfOpen;
                self.half_open_calls = 1;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls >= self.half_open_max_calls {
                    return Err(Duration::ZERO);
                }
                self.half_open_calls += 1;
                Ok(())
            }
        }
    }

    /// Record a successful attempt. Returns true when this closed the circuit.
    pub fn record_success(&mut self) -> bool {
        self.success_count += 1;
        self.failure_count = 0;
        if self.state == CircuitState::Closed {
            return false;
        }
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.half_open_calls = 0;
        true
    }

    /// Record a failed attempt. Returns true when this opened the circuit.
    pub fn record_failure(&mut self, kind: ErrorKind) -> bool {
        match (self.state, kind) {
            (_, ErrorKind::Fatal) => {
                // The dependency answered; the request itself was wrong.
                if self.state == CircuitState::HalfOpen {
                    self.half_open_calls = self.half_open_calls.saturating_sub(1);
                }
                false
            }
            (CircuitState::Closed, ErrorKind::RateLimit) => {
                self.failure_count += 1;
                self.last_failure_at = Some(Instant::now());
                if self.failure_count >= self.failure_threshold {
                    self.open();
                    return true;
                }
                false
            }
            (CircuitState::Closed, _) => false,
            (CircuitState::HalfOpen, _) => {
                self.failure_count += 1;
                self.last_failure_at = Some(Instant::now());
                self.open();
                true
            }
            (CircuitState::Open, _) => {
                self.last_failure_at = Some(Instant::now());
                false
            }
        }
    }

    /// Time until an open circuit admits a probe.
    pub fn open_remaining(&self) -> Duration {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(at)) => self.open_timeout.saturating_sub(at.elapsed()),
            _ => Duration::ZERO,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_calls = 0;
    }

    fn snapshot(&self, key: &str) -> BreakerSnapshot {
        BreakerSnapshot {
            key: key.to_string(),
            state: self.state,
            failure_count: self.failure_count,
            success_count: self.success_count,
            since_last_failure: self.last_failure_at.map(|t| t.elapsed()),
            retry_in: match self.state {
                CircuitState::Open => Some(self.open_remaining()),
                _ => None,
            },
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u64,
    pub since_last_failure: Option<Duration>,
    /// Set while Open: time until a probe is admitted
    pub retry_in: Option<Duration>,
}

/// Breakers for every operation class, created on first use.
#[derive(Debug)]
pub struct BreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    template: CircuitBreaker,
}

impl BreakerRegistry {
    pub fn new(config: &Config) -> Self {
        Self {
            breakers: DashMap::new(),
            template: CircuitBreaker::from_config(config),
        }
    }

    /// Ask to make one attempt against `key`.
    pub fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let mut breaker = self.entry(key);
        let before = breaker.state();
        let result = breaker.try_acquire();
        if before == CircuitState::Open && breaker.state() == CircuitState::HalfOpen {
            info!(key, "Circuit half-open, probing");
        }
        result
    }

    pub fn record_success(&self, key: &str) {
        if self.entry(key).record_success() {
            info!(key, "Circuit closed");
        }
    }

    pub fn record_failure(&self, key: &str, kind: ErrorKind) {
        let mut breaker = self.entry(key);
        if breaker.record_failure(kind) {
            warn!(
                key,
                failures = breaker.failure_count(),
                open_secs = breaker.open_timeout.as_secs_f64(),
                "Circuit opened"
            );
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        self.breakers
            .get(key)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(key).map(|b| b.snapshot(key))
    }

    /// Snapshots of every known breaker, sorted by key.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().snapshot(entry.key()))
            .collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Forget a breaker, closing it.
    pub fn reset(&self, key: &str) {
        self.breakers.remove(key);
    }

    fn entry(&self, key: &str) -> dashmap::mapref::one::RefMut<'_, String, CircuitBreaker> {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| self.template.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(3, Duration::from_secs(60), 1)
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_rate_limits() {
        let mut b = breaker();
        assert!(!b.record_failure(ErrorKind::RateLimit));
        assert!(!b.record_failure(ErrorKind::RateLimit));
        assert!(b.record_failure(ErrorKind::RateLimit));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.try_acquire(), Err(Duration::from_secs(60)));

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(b.try_acquire(), Err(Duration::from_secs(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_do_not_trip() {
        let mut b = breaker();
        for _ in 0..10 {
            b.record_failure(ErrorKind::Transient);
            b.record_failure(ErrorKind::Unknown);
            b.record_failure(ErrorKind::Fatal);
        }
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_count() {
        let mut b = breaker();
        b.record_failure(ErrorKind::RateLimit);
        b.record_failure(ErrorKind::RateLimit);
        b.record_success();
        b.record_failure(ErrorKind::RateLimit);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure(ErrorKind::RateLimit);
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(b.try_acquire(), Ok(()));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // Probe budget is one call.
        assert_eq!(b.try_acquire(), Err(Duration::ZERO));

        assert!(b.record_success());
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.try_acquire(), Ok(()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let mut b = breaker();
        for _ in 0..3 {
            b.record_failure(ErrorKind::RateLimit);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(b.try_acquire(), Ok(()));

        assert!(b.record_failure(ErrorKind::Transient));
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(b.try_acquire(), Err(Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_isolates_keys() {
        let mut config = Config::default();
        config.circuit_breaker_failure_threshold = 1;
        let registry = BreakerRegistry::new(&config);

        registry.record_failure("deep:primary", ErrorKind::RateLimit);
        assert_eq!(registry.state("deep:primary"), CircuitState::Open);
        assert!(registry.try_acquire("deep:primary").is_err());
        assert!(registry.try_acquire("deep:fallback").is_ok());

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].key, "deep:fallback");
        assert_eq!(snapshots[1].state, CircuitState::Open);
        assert!(snapshots[1].retry_in.is_some());

        registry.reset("deep:primary");
        assert_eq!(registry.state("deep:primary"), CircuitState::Closed);
    }
}
