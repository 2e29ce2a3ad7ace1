//! Retry policy for calls to the inference host.
//!
//! The policy is an explicit value passed into the resource manager. Only
//! failures whose kind appears in [`RetryPolicy::retry_on`] are retried,
//! with bounded backoff between attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use super::backend::BackendError;
use crate::errors::{FailureKind, ModelError};

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// Exact delays.
    #[default]
    None,
    /// Random from 0 to delay.
    Full,
    /// Half fixed, half random.
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Anything that carries a [`FailureKind`].
pub trait Classify {
    /// Returns the failure classification.
    fn failure_kind(&self) -> FailureKind;
}

impl Classify for BackendError {
    fn failure_kind(&self) -> FailureKind {
        self.kind
    }
}

impl Classify for ModelError {
    fn failure_kind(&self) -> FailureKind {
        self.kind
    }
}

/// Retry policy value object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff: BackoffStrategy,
    /// Jitter strategy.
    pub jitter: JitterStrategy,
    /// Failure kinds worth another attempt.
    pub retry_on: Vec<FailureKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            jitter: JitterStrategy::None,
            retry_on: vec![FailureKind::Transient],
        }
    }
}

impl RetryPolicy {
    /// Creates the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Sets the retryable failure kinds.
    #[must_use]
    pub fn with_retry_on(mut self, kinds: Vec<FailureKind>) -> Self {
        self.retry_on = kinds;
        self
    }

    /// Returns true if `kind` may be retried.
    #[must_use]
    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        self.retry_on.contains(&kind)
    }

    /// Backoff delay before retry `retry` (0-based), without jitter.
    #[must_use]
    pub fn backoff_delay_ms(&self, retry: usize) -> u64 {
        let base = self.base_delay_ms;
        let exponent = u32::try_from(retry).unwrap_or(u32::MAX);
        let delay = match self.backoff {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(exponent)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(exponent).saturating_add(1)),
            BackoffStrategy::Constant => base,
        };
        delay.min(self.max_delay_ms)
    }
}

/// Progress of one retried operation.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Attempts made so far.
    pub attempts: usize,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a fresh state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if no attempts remain.
    #[must_use]
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempts >= policy.max_attempts
    }

    /// Delay before the next attempt, with jitter applied.
    pub fn next_delay(&mut self, policy: &RetryPolicy) -> Duration {
        let retry = self.attempts.saturating_sub(1);
        let delay = policy.backoff_delay_ms(retry);
        let max = policy.max_delay_ms;

        let jittered = match policy.jitter {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let base = policy.base_delay_ms;
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                }
            }
        };

        self.previous_delay_ms = Some(jittered);
        Duration::from_millis(jittered)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry(Duration),
    /// No attempts remain.
    GiveUp,
    /// The failure kind is not retryable.
    NotRetryable,
}

/// Decides what to do after a failed attempt.
#[must_use]
pub fn should_retry(state: &mut RetryState, policy: &RetryPolicy, kind: FailureKind) -> RetryDecision {
    if !policy.is_retryable(kind) {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(policy) {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry(state.next_delay(policy))
}

/// A value together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted<T> {
    /// The success value or the last error.
    pub value: T,
    /// Attempts made.
    pub attempts: usize,
}

/// Runs `operation` under `policy`.
///
/// `key` identifies the operation in logs.
pub async fn with_retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    key: &str,
    mut operation: F,
) -> Result<Attempted<T>, Attempted<E>>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let mut state = RetryState::new();

    loop {
        state.attempts += 1;
        match operation(state.attempts).await {
            Ok(value) => {
                return Ok(Attempted {
                    value,
                    attempts: state.attempts,
                })
            }
            Err(err) => match should_retry(&mut state, policy, err.failure_kind()) {
                RetryDecision::Retry(delay) => {
                    tracing::debug!(
                        key,
                        attempt = state.attempts,
                        max_attempts = policy.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp | RetryDecision::NotRetryable => {
                    return Err(Attempted {
                        value: err,
                        attempts: state.attempts,
                    });
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(attempts: usize) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(attempts)
            .with_base_delay_ms(1)
            .with_max_delay_ms(5)
    }

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.retry_on, vec![FailureKind::Transient]);
        assert!(policy.is_retryable(FailureKind::Transient));
        assert!(!policy.is_retryable(FailureKind::NotFound));
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
        assert_eq!(RetryPolicy::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_max_delay_ms(500);
        assert_eq!(policy.backoff_delay_ms(0), 100);
        assert_eq!(policy.backoff_delay_ms(1), 200);
        assert_eq!(policy.backoff_delay_ms(2), 400);
        assert_eq!(policy.backoff_delay_ms(3), 500);
        assert_eq!(policy.backoff_delay_ms(64), 500);
    }

    #[test]
    fn test_linear_and_constant_backoff() {
        let linear = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.backoff_delay_ms(2), 300);

        let constant = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Constant);
        assert_eq!(constant.backoff_delay_ms(5), 100);
    }

    #[test]
    fn test_full_jitter_stays_in_range() {
        let policy = RetryPolicy::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::Full);
        let mut state = RetryState::new();
        state.attempts = 1;
        for _ in 0..20 {
            assert!(state.next_delay(&policy) <= Duration::from_millis(100));
        }
    }

    #[test]
    fn test_should_retry_decisions() {
        let policy = RetryPolicy::new().with_max_attempts(2);
        let mut state = RetryState::new();

        state.attempts = 1;
        assert_eq!(
            should_retry(&mut state, &policy, FailureKind::Transient),
            RetryDecision::Retry(Duration::from_millis(2000))
        );
        assert_eq!(
            should_retry(&mut state, &policy, FailureKind::Fatal),
            RetryDecision::NotRetryable
        );
        state.attempts = 2;
        assert_eq!(
            should_retry(&mut state, &policy, FailureKind::Transient),
            RetryDecision::GiveUp
        );
    }

    #[tokio::test]
    async fn test_with_retry_success_after_transient_failures() {
        let result = with_retry(&fast_policy(5), "test", |attempt| async move {
            if attempt < 3 {
                Err(BackendError::transient(format!("attempt {attempt}")))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(Attempted { value: 42, attempts: 3 }));
    }

    #[tokio::test]
    async fn test_with_retry_exhausts_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<Attempted<()>, _> = with_retry(&fast_policy(3), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::transient("down")) }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_non_transient() {
        let calls = AtomicUsize::new(0);
        let result: Result<Attempted<()>, _> = with_retry(&fast_policy(5), "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(BackendError::not_found("no such model")) }
        })
        .await;

        assert_eq!(result.unwrap_err().value.kind, FailureKind::NotFound);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
