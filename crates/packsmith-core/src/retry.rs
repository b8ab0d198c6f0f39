//! Retry with exponential backoff.
//!
//! A [`RetryPolicy`] is plain data: how many attempts, how the delay grows, and
//! where it is capped. A [`Retrier`] pairs a policy with a [`Sleeper`] and a
//! [`ShutdownFlag`] and runs an operation under it, consulting a caller-supplied
//! predicate to decide whether a failure is worth another attempt.

use crate::concurrency::ShutdownFlag;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_SECS: u64 = 30;
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Never less than 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: Duration::from_secs(DEFAULT_MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// Default backoff with a different attempt ceiling.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// A single attempt, never retried.
    pub fn no_retry() -> Self {
        Self::with_max_attempts(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// How the retry loop waits between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Sleeps on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Records requested delays without waiting. Used by tests.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, delay: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(delay);
        }
    }
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate rejected the error; no further attempts were made.
    Permanent { attempt: u32, error: E },
    /// Every allowed attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// Shutdown was requested before the next attempt.
    Interrupted { attempts: u32 },
}

/// A retry policy bound to its sleeper and shutdown flag.
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    shutdown: ShutdownFlag,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>, shutdown: ShutdownFlag) -> Self {
        Self {
            policy,
            sleeper,
            shutdown,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn shutdown(&self) -> &ShutdownFlag {
        &self.shutdown
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    ///
    /// `op` receives the 1-based attempt number. `label` only appears in logs.
    pub fn run<T, E>(
        &self,
        label: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut op: impl FnMut(u32) -> Result<T, E>,
    ) -> Result<T, RetryError<E>>
    where
        E: std::fmt::Display,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if self.shutdown.is_requested() {
                return Err(RetryError::Interrupted { attempts: attempt });
            }
            attempt += 1;
            debug!("{label}: attempt {attempt}/{max_attempts}");
            let error = match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            if !is_retryable(&error) {
                debug!("{label}: permanent failure: {error}");
                return Err(RetryError::Permanent { attempt, error });
            }
            if attempt >= max_attempts {
                warn!("{label}: giving up after {attempt} attempts: {error}");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }
            let delay = self.policy.delay_for(attempt);
            warn!(
                "{label}: attempt {attempt} failed ({error}), retrying in {}ms",
                delay.as_millis()
            );
            self.sleeper.sleep(delay);
        }
    }
}

impl std::fmt::Debug for Retrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("policy", &self.policy)
            .field("shutdown", &self.shutdown.is_requested())
            .finish_non_exhaustive()
    }
}
