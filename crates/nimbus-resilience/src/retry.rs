//! Bounded retry execution with pluggable backoff and a shared retry budget.
//!
//! [`RetryStrategy::execute`] runs an async operation up to `max_retries + 1`
//! times, sleeping between attempts according to the configured backoff. Every
//! retry (never the first attempt) spends one unit of the strategy's sliding
//! one-minute [`RetryBudget`]; when the budget runs dry the call stops
//! immediately with a distinct outcome so callers can tell systemic overload
//! from an ordinarily stubborn operation.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures::future::BoxFuture;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::budget::RetryBudget;
use crate::error::RetryError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
/// Default delay cap in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
/// Default jitter factor for [`BackoffStrategy::ExponentialJitter`].
pub const DEFAULT_JITTER_FACTOR: f64 = 0.5;
/// Default retry budget per rolling minute.
pub const DEFAULT_RETRY_BUDGET_PER_MINUTE: u32 = 60;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How the delay before retry `n` (1-based) is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base_delay` for every retry.
    Fixed,
    /// `base_delay * n`.
    Linear,
    /// `base_delay * 2^(n-1)`.
    Exponential,
    /// Exponential, plus/minus `jitter_factor` of the magnitude, uniform.
    ExponentialJitter,
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay fed into the backoff formula.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Backoff formula.
    pub backoff: BackoffStrategy,
    /// Jitter amplitude as a fraction of the exponential magnitude.
    pub jitter_factor: f64,
    /// Allowlist of error-message substrings. Non-empty means only matching
    /// errors are retried.
    pub retryable_errors: Vec<String>,
    /// Denylist of error-message substrings that always fail fast.
    pub non_retryable_errors: Vec<String>,
    /// Retries permitted per rolling minute across all calls on the strategy.
    pub retry_budget_per_minute: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            backoff: BackoffStrategy::Exponential,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
            retry_budget_per_minute: DEFAULT_RETRY_BUDGET_PER_MINUTE,
        }
    }
}

/// One attempt within a single `execute` call. The trail is returned with the
/// outcome and discarded afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Delay waited before this attempt (zero for the first).
    pub delay: Duration,
    /// Rendered error message, if the attempt failed.
    pub error: Option<String>,
    /// When the attempt finished (ms since epoch).
    pub timestamp_ms: u64,
}

/// Events emitted while executing retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryEvent {
    /// About to sleep and run another attempt.
    Retrying {
        /// The upcoming attempt number.
        attempt: u32,
        /// Delay before the attempt, in milliseconds.
        delay_ms: u64,
    },
    /// The call succeeded.
    Succeeded {
        /// Total attempts made.
        attempts: u32,
        /// Total wall-clock time, in milliseconds.
        total_time_ms: u64,
    },
    /// The call failed after its final permitted attempt.
    Exhausted {
        /// Total attempts made.
        attempts: u32,
    },
    /// The shared retry budget stopped the call early.
    BudgetExhausted {
        /// Total attempts made.
        attempts: u32,
    },
}

/// Result of one [`RetryStrategy::execute`] call, with the attempt trail and
/// total elapsed time.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// An attempt succeeded.
    Success {
        /// The operation's value.
        value: T,
        /// Every attempt made, in order.
        attempts: Vec<RetryAttempt>,
        /// Total wall-clock time spent.
        total_time: Duration,
    },
    /// All permitted attempts failed (or the error was non-retryable).
    Exhausted {
        /// The error from the final attempt.
        error: E,
        /// Every attempt made, in order.
        attempts: Vec<RetryAttempt>,
        /// Total wall-clock time spent.
        total_time: Duration,
    },
    /// The shared retry budget ran out before `max_retries` did.
    BudgetExhausted {
        /// The error from the final attempt.
        error: E,
        /// Every attempt made, in order.
        attempts: Vec<RetryAttempt>,
        /// Total wall-clock time spent.
        total_time: Duration,
    },
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the call produced a value.
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    /// The attempt trail.
    pub fn attempts(&self) -> &[RetryAttempt] {
        match self {
            RetryOutcome::Success { attempts, .. } => attempts,
            RetryOutcome::Exhausted { attempts, .. } => attempts,
            RetryOutcome::BudgetExhausted { attempts, .. } => attempts,
        }
    }

    /// Total wall-clock time spent in the call.
    pub fn total_time(&self) -> Duration {
        match self {
            RetryOutcome::Success { total_time, .. } => *total_time,
            RetryOutcome::Exhausted { total_time, .. } => *total_time,
            RetryOutcome::BudgetExhausted { total_time, .. } => *total_time,
        }
    }

    /// Convert to a `Result` with a typed [`RetryError`] for exception-style
    /// call sites.
    pub fn into_result(self) -> Result<T, RetryError<E>> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted {
                error,
                attempts,
                total_time,
            } => Err(RetryError::Exhausted {
                attempts: attempts.len() as u32,
                error,
                total_time_ms: total_time.as_millis() as u64,
            }),
            RetryOutcome::BudgetExhausted {
                error,
                attempts,
                total_time,
            } => Err(RetryError::BudgetExhausted {
                attempts: attempts.len() as u32,
                error,
                total_time_ms: total_time.as_millis() as u64,
            }),
        }
    }
}

/// Executes operations with bounded, budgeted retries.
pub struct RetryStrategy {
    config: RetryConfig,
    budget: RetryBudget,
    events: broadcast::Sender<RetryEvent>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl RetryStrategy {
    /// Create a strategy from its configuration.
    pub fn new(config: RetryConfig) -> Self {
        let budget = RetryBudget::new(config.retry_budget_per_minute);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            budget,
            events,
        }
    }

    /// The strategy's configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries still available in the current budget window.
    pub fn budget_remaining(&self) -> u32 {
        self.budget.remaining()
    }

    /// Subscribe to retry events.
    pub fn subscribe(&self) -> broadcast::Receiver<RetryEvent> {
        self.events.subscribe()
    }

    /// Delay before retry `attempt` (1-based), clamped to `max_delay`.
    /// Attempt 0 (the first call) never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let base = self.config.base_delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        let delay_ms = match self.config.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * attempt as f64,
            BackoffStrategy::Exponential => base * 2f64.powi(attempt as i32 - 1),
            BackoffStrategy::ExponentialJitter => {
                let magnitude = (base * 2f64.powi(attempt as i32 - 1)).min(max);
                let delta = magnitude * self.config.jitter_factor;
                if delta > 0.0 {
                    rand::thread_rng().gen_range((magnitude - delta).max(0.0)..=magnitude + delta)
                } else {
                    magnitude
                }
            }
        };
        Duration::from_millis(delay_ms.min(max).max(0.0) as u64)
    }

    /// Whether an error message should be retried.
    ///
    /// The denylist always wins; a non-empty allowlist then acts as a
    /// whitelist, otherwise everything is retryable.
    fn is_retryable(&self, message: &str) -> bool {
        if self
            .config
            .non_retryable_errors
            .iter()
            .any(|p| message.contains(p.as_str()))
        {
            return false;
        }
        if !self.config.retryable_errors.is_empty() {
            return self
                .config
                .retryable_errors
                .iter()
                .any(|p| message.contains(p.as_str()));
        }
        true
    }

    /// Run `op` with retries, returning the full outcome.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> RetryOutcome<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let start = Instant::now();
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut attempt: u32 = 0;
        let mut waited = Duration::ZERO;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    attempts.push(RetryAttempt {
                        attempt,
                        delay: waited,
                        error: None,
                        timestamp_ms: now_ms(),
                    });
                    let total_time = start.elapsed();
                    let _ = self.events.send(RetryEvent::Succeeded {
                        attempts: attempt,
                        total_time_ms: total_time.as_millis() as u64,
                    });
                    return RetryOutcome::Success {
                        value,
                        attempts,
                        total_time,
                    };
                }
                Err(error) => {
                    let message = error.to_string();
                    attempts.push(RetryAttempt {
                        attempt,
                        delay: waited,
                        error: Some(message.clone()),
                        timestamp_ms: now_ms(),
                    });

                    let retryable = self.is_retryable(&message);
                    if !retryable || attempt > self.config.max_retries {
                        debug!(attempt, retryable, "giving up: {}", message);
                        let _ = self.events.send(RetryEvent::Exhausted { attempts: attempt });
                        return RetryOutcome::Exhausted {
                            error,
                            attempts,
                            total_time: start.elapsed(),
                        };
                    }

                    if !self.budget.try_acquire() {
                        warn!(attempt, "retry budget exhausted, aborting retries");
                        let _ = self
                            .events
                            .send(RetryEvent::BudgetExhausted { attempts: attempt });
                        return RetryOutcome::BudgetExhausted {
                            error,
                            attempts,
                            total_time: start.elapsed(),
                        };
                    }

                    let delay = self.delay_for_attempt(attempt);
                    let _ = self.events.send(RetryEvent::Retrying {
                        attempt: attempt + 1,
                        delay_ms: delay.as_millis() as u64,
                    });
                    tokio::time::sleep(delay).await;
                    waited = delay;
                }
            }
        }
    }

    /// Run `op` with retries and unwrap to a `Result` for exception-style
    /// call sites.
    pub async fn execute_or_error<F, Fut, T, E>(&self, op: F) -> Result<T, RetryError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        self.execute(op).await.into_result()
    }

    /// Adapt an async operation into a closure that is retried on every call.
    pub fn wrap<F, Fut, T, E>(
        self: &Arc<Self>,
        op: F,
    ) -> impl Fn() -> BoxFuture<'static, Result<T, RetryError<E>>>
    where
        F: Fn() -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Display + Send + 'static,
    {
        let strategy = Arc::clone(self);
        move || {
            let strategy = Arc::clone(&strategy);
            let op = op.clone();
            Box::pin(async move { strategy.execute_or_error(op).await })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            ..Default::default()
        }
    }

    fn counted_failures(
        fail_first: u32,
    ) -> (Arc<AtomicU32>, impl Fn() -> BoxFuture<'static, Result<&'static str, String>>) {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);
        let op = move || {
            let counter = Arc::clone(&counter_clone);
            let fut: BoxFuture<'static, Result<&'static str, String>> = Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if n <= fail_first {
                    Err("connection reset".to_string())
                } else {
                    Ok("ok")
                }
            });
            fut
        };
        (counter, op)
    }

    #[test]
    fn config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(10));
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert_eq!(config.retry_budget_per_minute, 60);
        assert!(config.retryable_errors.is_empty());
        assert!(config.non_retryable_errors.is_empty());
    }

    #[test]
    fn fixed_delay() {
        let strategy = RetryStrategy::new(RetryConfig {
            backoff: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        });
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_attempt(5), Duration::from_millis(100));
    }

    #[test]
    fn linear_delay() {
        let strategy = RetryStrategy::new(RetryConfig {
            backoff: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        });
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_millis(300));
    }

    #[test]
    fn exponential_delay() {
        let strategy = RetryStrategy::new(RetryConfig {
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        });
        assert_eq!(strategy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(strategy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(strategy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn delay_clamped_to_max() {
        let strategy = RetryStrategy::new(RetryConfig {
            backoff: BackoffStrategy::Exponential,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            ..Default::default()
        });
        assert_eq!(strategy.delay_for_attempt(10), Duration::from_millis(500));
        assert_eq!(strategy.delay_for_attempt(63), Duration::from_millis(500));
    }

    #[test]
    fn jitter_stays_in_bounds() {
        let strategy = RetryStrategy::new(RetryConfig {
            backoff: BackoffStrategy::ExponentialJitter,
            base_delay: Duration::from_millis(100),
            jitter_factor: 0.5,
            ..Default::default()
        });
        // Attempt 3: magnitude 400ms, jitter band [200ms, 600ms].
        for _ in 0..50 {
            let delay = strategy.delay_for_attempt(3);
            assert!(delay >= Duration::from_millis(200), "delay {:?}", delay);
            assert!(delay <= Duration::from_millis(600), "delay {:?}", delay);
        }
    }

    #[test]
    fn zero_attempt_never_waits() {
        let strategy = RetryStrategy::new(RetryConfig::default());
        assert_eq!(strategy.delay_for_attempt(0), Duration::ZERO);
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let strategy = RetryStrategy::new(fast_config());
        let (counter, op) = counted_failures(0);

        let outcome = strategy.execute(op).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts().len(), 1);
        assert!(outcome.attempts()[0].error.is_none());
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn success_after_failures() {
        let strategy = RetryStrategy::new(fast_config());
        let (counter, op) = counted_failures(2);

        let outcome = strategy.execute(op).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts().len(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        assert_eq!(outcome.attempts()[1].error.as_deref(), Some("connection reset"));
    }

    #[tokio::test]
    async fn exhausted_after_max_retries() {
        let strategy = RetryStrategy::new(fast_config());
        let (counter, op) = counted_failures(100);

        let outcome = strategy.execute(op).await;
        match &outcome {
            RetryOutcome::Exhausted { error, attempts, .. } => {
                assert_eq!(error, "connection reset");
                assert_eq!(attempts.len(), 4);
            }
            other => panic!("expected Exhausted, got {:?}", other.is_success()),
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn non_retryable_fails_fast() {
        let strategy = RetryStrategy::new(RetryConfig {
            non_retryable_errors: vec!["validation".to_string()],
            ..fast_config()
        });
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);

        let outcome: RetryOutcome<(), String> = strategy
            .execute(move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    calls.fetch_add(1, Ordering::Relaxed);
                    Err("validation failed: bad field".to_string())
                }
            })
            .await;

        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
        assert_eq!(outcome.attempts().len(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn allowlist_overrides_retry_everything() {
        let strategy = RetryStrategy::new(RetryConfig {
            retryable_errors: vec!["timeout".to_string()],
            ..fast_config()
        });

        let outcome: RetryOutcome<(), String> = strategy
            .execute(|| async { Err("permission denied".to_string()) })
            .await;
        assert_eq!(outcome.attempts().len(), 1);

        let outcome: RetryOutcome<(), String> = strategy
            .execute(|| async { Err("request timeout after 5s".to_string()) })
            .await;
        assert_eq!(outcome.attempts().len(), 4);
    }

    #[tokio::test]
    async fn denylist_wins_over_allowlist() {
        let strategy = RetryStrategy::new(RetryConfig {
            retryable_errors: vec!["timeout".to_string()],
            non_retryable_errors: vec!["auth".to_string()],
            ..fast_config()
        });

        let outcome: RetryOutcome<(), String> = strategy
            .execute(|| async { Err("auth timeout".to_string()) })
            .await;
        assert_eq!(outcome.attempts().len(), 1);
    }

    #[tokio::test]
    async fn budget_stops_retries() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_retries: 10,
            retry_budget_per_minute: 2,
            ..fast_config()
        });
        let (counter, op) = counted_failures(100);

        let outcome = strategy.execute(op).await;
        assert!(matches!(outcome, RetryOutcome::BudgetExhausted { .. }));
        // First attempt plus the two budgeted retries.
        assert_eq!(outcome.attempts().len(), 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn budget_shared_across_calls() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_retries: 10,
            retry_budget_per_minute: 2,
            ..fast_config()
        });
        let (_, op) = counted_failures(100);
        let _ = strategy.execute(op).await;
        assert_eq!(strategy.budget_remaining(), 0);

        // The next failing call cannot retry at all.
        let (counter, op) = counted_failures(100);
        let outcome = strategy.execute(op).await;
        assert!(matches!(outcome, RetryOutcome::BudgetExhausted { .. }));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn first_attempts_do_not_spend_budget() {
        let strategy = RetryStrategy::new(RetryConfig {
            retry_budget_per_minute: 2,
            ..fast_config()
        });

        for _ in 0..5 {
            let outcome: RetryOutcome<(), String> =
                strategy.execute(|| async { Ok(()) }).await;
            assert!(outcome.is_success());
        }
        assert_eq!(strategy.budget_remaining(), 2);
    }

    #[tokio::test]
    async fn execute_or_error_maps_outcomes() {
        let strategy = RetryStrategy::new(fast_config());

        let ok: Result<&str, RetryError<String>> =
            strategy.execute_or_error(|| async { Ok("ok") }).await;
        assert_eq!(ok.unwrap(), "ok");

        let err: Result<(), RetryError<String>> = strategy
            .execute_or_error(|| async { Err("connection reset".to_string()) })
            .await;
        match err.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 4),
            other => panic!("expected Exhausted, got {}", other),
        }
    }

    #[tokio::test]
    async fn budget_error_is_distinct() {
        let strategy = RetryStrategy::new(RetryConfig {
            max_retries: 10,
            retry_budget_per_minute: 1,
            ..fast_config()
        });

        let err: Result<(), RetryError<String>> = strategy
            .execute_or_error(|| async { Err("connection reset".to_string()) })
            .await;
        assert!(err.unwrap_err().is_budget_exhausted());
    }

    #[tokio::test]
    async fn wrap_retries_on_each_call() {
        let strategy = Arc::new(RetryStrategy::new(fast_config()));
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = Arc::clone(&counter);

        let wrapped = strategy.wrap(move || {
            let counter = Arc::clone(&counter_clone);
            async move {
                let n = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if n < 3 {
                    Err("connection reset".to_string())
                } else {
                    Ok(n)
                }
            }
        });

        let value = wrapped().await.unwrap();
        assert_eq!(value, 3);
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn events_emitted_in_order() {
        let strategy = RetryStrategy::new(fast_config());
        let mut rx = strategy.subscribe();
        let (_, op) = counted_failures(1);

        let outcome = strategy.execute(op).await;
        assert!(outcome.is_success());

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, RetryEvent::Retrying { attempt: 2, .. }));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, RetryEvent::Succeeded { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn total_time_covers_delays() {
        let strategy = RetryStrategy::new(RetryConfig {
            backoff: BackoffStrategy::Fixed,
            base_delay: Duration::from_millis(10),
            ..fast_config()
        });
        let (_, op) = counted_failures(2);

        let outcome = strategy.execute(op).await;
        assert!(outcome.total_time() >= Duration::from_millis(20));
    }
}
