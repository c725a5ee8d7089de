//! Error types for the resilience primitives.

use thiserror::Error;

use crate::circuitbreaker::{CircuitState, CircuitStats};

/// Error returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute).
///
/// `Open` signals graceful degradation: the call never ran and should not be
/// retried against the same dependency. `Inner` wraps the operation's own
/// failure after it has been recorded against the breaker.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call without running it.
    #[error("circuit '{name}' is {state}, call rejected")]
    Open {
        /// Name of the breaker that rejected the call.
        name: String,
        /// Breaker state at rejection time (`Open`, or `HalfOpen` with the
        /// probe quota exhausted).
        state: CircuitState,
        /// Stats snapshot taken when the call was rejected.
        stats: CircuitStats,
    },
    /// The call ran and failed; the failure was recorded.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether this error is a rejection by an open circuit.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// Unwrap the operation's own error, if the call actually ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Open { .. } => None,
            CircuitError::Inner(e) => Some(e),
        }
    }
}

/// Error returned by [`RetryStrategy::execute_or_error`](crate::RetryStrategy::execute_or_error).
///
/// `BudgetExhausted` is deliberately distinct from `Exhausted`: it signals
/// systemic overload (the shared retry budget ran dry), not just a stubborn
/// operation.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All permitted attempts ran and the last one failed.
    #[error("retries exhausted after {attempts} attempts: {error}")]
    Exhausted {
        /// Total attempts made, including the first.
        attempts: u32,
        /// The error from the final attempt.
        error: E,
        /// Total wall-clock time spent, in milliseconds.
        total_time_ms: u64,
    },
    /// The sliding one-minute retry budget ran out before `max_retries` did.
    #[error("retry budget exhausted after {attempts} attempts: {error}")]
    BudgetExhausted {
        /// Total attempts made before the budget ran out.
        attempts: u32,
        /// The error from the final attempt.
        error: E,
        /// Total wall-clock time spent, in milliseconds.
        total_time_ms: u64,
    },
}

impl<E> RetryError<E> {
    /// The error produced by the final attempt.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { error, .. } => error,
            RetryError::BudgetExhausted { error, .. } => error,
        }
    }

    /// Whether the retry budget, rather than `max_retries`, stopped the call.
    pub fn is_budget_exhausted(&self) -> bool {
        matches!(self, RetryError::BudgetExhausted { .. })
    }
}
