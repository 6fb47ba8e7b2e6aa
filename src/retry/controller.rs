//! Retry with exponential backoff behind a circuit breaker.
//!
//! Per attempt:
//! 1. Ask the breaker; an open circuit fails immediately without invoking
//!    the operation
//! 2. Invoke the operation; success is recorded and returned
//! 3. Classify the failure; Fatal aborts, anything else backs off and retries
//!
//! delay = min(max_delay, base_delay * multiplier^attempt + uniform(0, jitter))

use super::{classify, BreakerRegistry, ErrorKind, OperationError};
use crate::models::Config;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// How the retry controller gave up.
#[derive(Debug, Clone, Error)]
pub enum RetryError {
    #[error("Circuit open for '{key}', retry in {}s", .retry_in.as_secs())]
    CircuitOpen {
        key: String,
        retry_in: Duration,
        /// Failure that preceded the rejection, if any attempt ran
        last_error: Option<OperationError>,
        /// Attempts made before the rejection
        attempts: u32,
    },

    #[error("Fatal error on attempt {attempt}: {error}")]
    Fatal { error: OperationError, attempt: u32 },

    #[error("Gave up after {attempts} attempts ({kind}): {error}")]
    Exhausted {
        error: OperationError,
        attempts: u32,
        kind: ErrorKind,
    },
}

impl RetryError {
    /// Classification of the failure that ended the run.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { last_error, .. } => last_error
                .as_ref()
                .map(classify)
                .unwrap_or(ErrorKind::RateLimit),
            Self::Fatal { .. } => ErrorKind::Fatal,
            Self::Exhausted { kind, .. } => *kind,
        }
    }

    /// Suggested wait before the same call is worth making again.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_in, .. } => Some(*retry_in),
            Self::Fatal { .. } => None,
            Self::Exhausted { error, .. } => error.retry_after,
        }
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The last error the operation returned.
    pub fn last_error(&self) -> Option<&OperationError> {
        match self {
            Self::CircuitOpen { last_error, .. } => last_error.as_ref(),
            Self::Fatal { error, .. } | Self::Exhausted { error, .. } => Some(error),
        }
    }

    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Fatal { attempt, .. } => *attempt,
            Self::CircuitOpen { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Reported to the caller before each backoff sleep.
#[derive(Debug, Clone)]
pub struct RetryEvent<'a> {
    pub key: &'a str,
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    pub max_retries: u32,
    pub delay: Duration,
    pub kind: ErrorKind,
    pub error: &'a OperationError,
}

/// Successful result plus the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

/// Retry controller statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    pub attempts: u64,
    pub successes: u64,
    pub retries: u64,
    pub failures: u64,
    pub circuit_rejections: u64,
}

/// Runs operations with backoff, sharing breakers across calls.
#[derive(Debug)]
pub struct RetryController {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: f64,
    breakers: Arc<BreakerRegistry>,
    attempts: AtomicU64,
    successes: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
    circuit_rejections: AtomicU64,
}

impl RetryController {
    pub fn new(config: &Config) -> Self {
        Self::with_breakers(config, Arc::new(BreakerRegistry::new(config)))
    }

    /// Build a controller that shares an existing breaker registry.
    pub fn with_breakers(config: &Config, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            base_delay: config.base_retry_delay(),
            max_delay: config.max_retry_delay(),
            multiplier: config.backoff_multiplier,
            jitter: config.retry_jitter.max(0.0),
            breakers,
            attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `operation` until it succeeds, fails fatally, exhausts its
    /// attempts, or the breaker for `key` rejects it.
    ///
    /// `operation` receives the 1-based attempt number.
    pub async fn run_with_backoff<T, F, Fut, R>(
        &self,
        key: &str,
        operation: F,
        on_retry: R,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        R: FnMut(&RetryEvent<'_>),
    {
        self.run_limited(key, self.max_retries, operation, on_retry)
            .await
    }

    /// Make a single attempt through the breaker for `key`.
    pub async fn run_once<T, F, Fut>(&self, key: &str, operation: F) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.run_limited(key, 1, operation, |_| {}).await
    }

    async fn run_limited<T, F, Fut, R>(
        &self,
        key: &str,
        max_attempts: u32,
        mut operation: F,
        mut on_retry: R,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        R: FnMut(&RetryEvent<'_>),
    {
        let mut attempt = 0;
        let mut last_error: Option<OperationError> = None;

        loop {
            attempt += 1;

            if let Err(retry_in) = self.breakers.try_acquire(key) {
                self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                warn!(key, attempt, retry_in_secs = retry_in.as_secs(), "Circuit open, not attempting");
                return Err(RetryError::CircuitOpen {
                    key: key.to_string(),
                    retry_in,
                    last_error,
                    attempts: attempt - 1,
                });
            }

            self.attempts.fetch_add(1, Ordering::Relaxed);
            let error = match operation(attempt).await {
                Ok(value) => {
                    self.breakers.record_success(key);
                    self.successes.fetch_add(1, Ordering::Relaxed);
                    if attempt > 1 {
                        debug!(key, attempt, "Succeeded after retry");
                    }
                    return Ok(Attempted {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            let kind = classify(&error);
            self.breakers.record_failure(key, kind);

            if kind == ErrorKind::Fatal {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key, attempt, error = %error, "Fatal error, not retrying");
                return Err(RetryError::Fatal { error, attempt });
            }

            if attempt >= max_attempts {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(key, attempts = attempt, kind = %kind, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                    kind,
                });
            }

            let delay = self.delay_for(attempt, error.retry_after);
            self.retries.fetch_add(1, Ordering::Relaxed);
            on_retry(&RetryEvent {
                key,
                attempt,
                max_retries: max_attempts,
                delay,
                kind,
                error: &error,
            });
            warn!(
                key,
                attempt,
                max_retries = max_attempts,
                delay_ms = delay.as_millis() as u64,
                kind = %kind,
                error = %error,
                "Attempt failed, backing off"
            );

            tokio::time::sleep(delay).await;
            last_error = Some(error);
        }
    }

    /// Backoff before the attempt after `attempt`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exp = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter)
        } else {
            0.0
        };
        let secs = self.base_delay.as_secs_f64() * exp + jitter;
        let computed = Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay);
        computed
            .max(retry_after.unwrap_or(Duration::ZERO))
            .min(self.max_delay)
    }

    pub fn stats(&self) -> RetryStats {
        RetryStats {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
        }
    }
}
