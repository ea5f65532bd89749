//! Retry and circuit-breaker policy.
//!
//! `ReliabilityPolicy::execute` wraps any async operation:
//!
//! 1. If the circuit is open the call fails fast with `CircuitOpen` and the
//!    operation is never invoked.
//! 2. Otherwise the operation is attempted up to `max_retry_attempts` times.
//!    Non-retryable errors abort on first occurrence.
//! 3. Retryable failures wait `retry_delay` and try again. When attempts run
//!    out the consecutive-failure counter is bumped, the failure time is
//!    stamped, and `RetriesExhausted` wraps the last cause.
//!
//! The circuit is open while `consecutive_failures >= circuit_breaker_threshold`
//! and the last failure is younger than `circuit_breaker_timeout`. There is no
//! half-open state: once the timeout passes the next call simply runs, and a
//! success resets the counter.
//!
//! Cancellation aborts the current attempt or delay and surfaces as
//! `Cancelled`; it never counts as a failure.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

use crate::cancel::CancellationToken;
use crate::error::{ExecutionError, GuardError, GuardResult};

/// Reliability policy settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Attempts per `execute` call, including the first.
    pub max_retry_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Consecutive exhausted calls before the circuit opens.
    pub circuit_breaker_threshold: u32,
    /// How long the circuit stays open.
    pub circuit_breaker_timeout: Duration,
    /// Per-attempt time limit; `None` means unbounded.
    pub operation_timeout: Option<Duration>,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            retry_delay: Duration::from_millis(200),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(30),
            operation_timeout: Some(Duration::from_secs(5)),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls are attempted.
    Closed,
    /// Calls are rejected until the timeout elapses.
    Open,
}

/// Retry + circuit breaker around arbitrary async operations.
///
/// Counters are atomic, so one policy can be shared across tasks.
#[derive(Debug)]
pub struct ReliabilityPolicy {
    config: ReliabilityConfig,
    consecutive_failures: AtomicU32,
    /// Millis since `epoch` of the last exhausted call, plus one; 0 = never.
    last_failure_ms: AtomicU64,
    epoch: Instant,
}

impl ReliabilityPolicy {
    /// A closed policy with zeroed counters.
    #[must_use]
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            consecutive_failures: AtomicU32::new(0),
            last_failure_ms: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    /// The settings this policy was built with.
    #[must_use]
    pub const fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Exhausted calls since the last success.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    /// Current circuit state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        if self.open_for().is_some() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    /// Close the circuit and forget past failures.
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        self.last_failure_ms.store(0, Ordering::Release);
    }

    /// Run `op` under the policy. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, token: &CancellationToken, mut op: F) -> GuardResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = GuardResult<T>>,
    {
        if let Some(remaining) = self.open_for() {
            return Err(ExecutionError::CircuitOpen {
                consecutive_failures: self.consecutive_failures(),
                retry_after_ms: millis(remaining),
            }
            .into());
        }

        let max_attempts = self.config.max_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            if token.is_cancelled() {
                return Err(ExecutionError::Cancelled.into());
            }

            let result = tokio::select! {
                biased;
                () = token.cancelled() => Err(ExecutionError::Cancelled.into()),
                result = self.run_attempt(op(attempt)) => result,
            };

            let err = match result {
                Ok(value) => {
                    self.consecutive_failures.store(0, Ordering::Release);
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_cancelled() {
                return Err(err);
            }
            if !err.is_retryable() {
                tracing::debug!(attempt, error = %err, "non-retryable failure; aborting");
                return Err(err);
            }
            if attempt >= max_attempts {
                return Err(self.record_exhausted(attempt, err));
            }

            tracing::debug!(attempt, max_attempts, error = %err, "retryable failure; backing off");
            tokio::select! {
                biased;
                () = token.cancelled() => return Err(ExecutionError::Cancelled.into()),
                () = tokio::time::sleep(self.config.retry_delay) => {}
            }
        }
    }

    async fn run_attempt<T, Fut>(&self, fut: Fut) -> GuardResult<T>
    where
        Fut: Future<Output = GuardResult<T>>,
    {
        match self.config.operation_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Timeout {
                    duration_ms: millis(limit),
                }
                .into()),
            },
            None => fut.await,
        }
    }

    fn record_exhausted(&self, attempts: u32, last: GuardError) -> GuardError {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        self.last_failure_ms.store(self.now_ms().saturating_add(1), Ordering::Release);

        if failures >= self.config.circuit_breaker_threshold {
            tracing::warn!(
                consecutive_failures = failures,
                open_for_ms = millis(self.config.circuit_breaker_timeout),
                "circuit breaker opened"
            );
        } else {
            tracing::warn!(attempts, consecutive_failures = failures, error = %last, "retries exhausted");
        }

        ExecutionError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
        .into()
    }

    /// Time left until the circuit closes, if it is open.
    fn open_for(&self) -> Option<Duration> {
        if self.consecutive_failures() < self.config.circuit_breaker_threshold {
            return None;
        }
        let stamped = self.last_failure_ms.load(Ordering::Acquire);
        if stamped == 0 {
            return None;
        }
        let since = self.now_ms().saturating_add(1).saturating_sub(stamped);
        let timeout = millis(self.config.circuit_breaker_timeout);
        (since < timeout).then(|| Duration::from_millis(timeout - since))
    }

    fn now_ms(&self) -> u64 {
        millis(self.epoch.elapsed())
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
