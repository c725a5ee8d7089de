//! Circuit breaker for per-dependency failure isolation.
//!
//! The breaker has three states:
//!
//! 1. **Closed**: normal operation, requests pass through and failures are counted.
//! 2. **Open**: requests are rejected; after `open_duration` the next call is
//!    admitted as a half-open probe.
//! 3. **HalfOpen**: at most `half_open_max_calls` probes in flight; one failure
//!    re-opens, `success_threshold` consecutive successes close.
//!
//! A closed breaker trips when consecutive failures reach `failure_threshold`,
//! or when the rolling window holds at least `volume_threshold` requests with an
//! error percentage at or above `error_percentage_threshold`.
//!
//! Two call styles are supported: the low-level
//! [`try_acquire`](CircuitBreaker::try_acquire) /
//! [`record_success`](CircuitBreaker::record_success) /
//! [`record_failure`](CircuitBreaker::record_failure) triple, and the async
//! [`execute`](CircuitBreaker::execute) wrapper which returns a typed
//! [`CircuitError`] on rejection.
//!
//! # Example
//!
//! ```
//! use nimbus_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! let breaker = CircuitBreaker::new("payments", CircuitBreakerConfig::default());
//! if breaker.try_acquire() {
//!     // run the guarded call, then report its outcome
//!     breaker.record_success();
//! }
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::CircuitError;

/// Default number of consecutive failures required to open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default number of consecutive successes required to close from half-open.
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 3;
/// Default open duration in milliseconds before admitting a half-open probe.
pub const DEFAULT_OPEN_DURATION_MS: u64 = 30_000;
/// Default maximum in-flight probes in half-open state.
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 1;
/// Default minimum rolling-window volume before the error-rate trip applies.
pub const DEFAULT_VOLUME_THRESHOLD: usize = 20;
/// Default rolling-window error percentage that trips the circuit.
pub const DEFAULT_ERROR_PERCENTAGE_THRESHOLD: f64 = 50.0;
/// Default rolling window length in milliseconds.
pub const DEFAULT_ROLLING_WINDOW_MS: u64 = 60_000;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; requests are allowed through.
    Closed,
    /// Requests are rejected until the open duration elapses.
    Open,
    /// Limited probes are allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit.
    pub failure_threshold: u32,
    /// Consecutive successes required to close the circuit from half-open.
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub open_duration: Duration,
    /// Maximum number of in-flight probes while half-open.
    pub half_open_max_calls: u32,
    /// Minimum rolling-window request volume before the error-rate trip applies.
    pub volume_threshold: usize,
    /// Rolling-window error percentage (0..=100) that trips the circuit.
    pub error_percentage_threshold: f64,
    /// Length of the rolling request/failure window.
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            open_duration: Duration::from_millis(DEFAULT_OPEN_DURATION_MS),
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            error_percentage_threshold: DEFAULT_ERROR_PERCENTAGE_THRESHOLD,
            rolling_window: Duration::from_millis(DEFAULT_ROLLING_WINDOW_MS),
        }
    }
}

/// Counters and timestamps tracked by a breaker.
///
/// `consecutive_failures` and `consecutive_successes` are mutually exclusive:
/// recording one kind of outcome zeroes the other counter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Calls that reached the breaker, including rejected ones.
    pub total_requests: u64,
    /// Calls that ran and succeeded.
    pub successful_requests: u64,
    /// Calls that ran and failed.
    pub failed_requests: u64,
    /// Calls rejected while open or over the half-open probe quota.
    pub rejected_requests: u64,
    /// Current run of failures.
    pub consecutive_failures: u32,
    /// Current run of successes.
    pub consecutive_successes: u32,
    /// When the breaker last changed state (ms since epoch).
    pub state_changed_at_ms: u64,
    /// When a call last succeeded (ms since epoch).
    pub last_success_ms: Option<u64>,
    /// When a call last failed (ms since epoch).
    pub last_failure_ms: Option<u64>,
}

/// Events emitted by a breaker. State-transition events are sent after the
/// transition is applied and before the mutating call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CircuitEvent {
    /// The breaker moved between states.
    StateChanged {
        /// Breaker name.
        name: String,
        /// Previous state.
        from: CircuitState,
        /// New state.
        to: CircuitState,
    },
    /// The breaker opened.
    Opened {
        /// Breaker name.
        name: String,
    },
    /// The breaker closed.
    Closed {
        /// Breaker name.
        name: String,
    },
    /// The breaker entered half-open probing.
    HalfOpened {
        /// Breaker name.
        name: String,
    },
    /// A call ran and succeeded.
    CallSucceeded {
        /// Breaker name.
        name: String,
    },
    /// A call ran and failed.
    CallFailed {
        /// Breaker name.
        name: String,
    },
    /// A call was rejected without running.
    CallRejected {
        /// Breaker name.
        name: String,
    },
}

struct BreakerInner {
    state: CircuitState,
    stats: CircuitStats,
    /// Rolling window of (completion instant, succeeded) pairs.
    window: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    half_open_in_flight: u32,
}

/// A named circuit breaker guarding one dependency.
///
/// All state lives behind a single mutex; each read-modify-write is one
/// critical section and the guarded operation itself is awaited outside the
/// lock, so instances can be shared freely across tasks via `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    events: broadcast::Sender<CircuitEvent>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl CircuitBreaker {
    /// Create a breaker with its own event channel.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(name, config, events)
    }

    /// Create a breaker that emits into an existing event channel.
    ///
    /// Used by [`CircuitBreakerRegistry`](crate::CircuitBreakerRegistry) so all
    /// breakers it owns share one stream.
    pub fn with_events(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        events: broadcast::Sender<CircuitEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                stats: CircuitStats {
                    state_changed_at_ms: now_ms(),
                    ..CircuitStats::default()
                },
                window: VecDeque::new(),
                opened_at: None,
                half_open_in_flight: 0,
            }),
            events,
        }
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The breaker's configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to this breaker's events.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitEvent> {
        self.events.subscribe()
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected calls return [`CircuitError::Open`] with a stats snapshot and
    /// never run `op`; failures are recorded and returned as
    /// [`CircuitError::Inner`].
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err((state, stats)) = self.admit() {
            return Err(CircuitError::Open {
                name: self.name.clone(),
                state,
                stats,
            });
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Ask for admission without running anything.
    ///
    /// Pairs with [`record_success`](Self::record_success) and
    /// [`record_failure`](Self::record_failure) for call sites that cannot use
    /// [`execute`](Self::execute). Every admitted half-open call occupies a
    /// probe slot until its outcome is recorded.
    pub fn try_acquire(&self) -> bool {
        self.admit().is_ok()
    }

    fn admit(&self) -> Result<(), (CircuitState, CircuitStats)> {
        let mut pending = Vec::new();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            inner.stats.total_requests += 1;

            if inner.state == CircuitState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_duration {
                    self.transition(&mut inner, CircuitState::HalfOpen, &mut pending);
                }
            }

            match inner.state {
                CircuitState::Closed => Ok(()),
                CircuitState::HalfOpen => {
                    if inner.half_open_in_flight < self.config.half_open_max_calls {
                        inner.half_open_in_flight += 1;
                        Ok(())
                    } else {
                        inner.stats.rejected_requests += 1;
                        pending.push(CircuitEvent::CallRejected {
                            name: self.name.clone(),
                        });
                        Err((inner.state, inner.stats.clone()))
                    }
                }
                CircuitState::Open => {
                    inner.stats.rejected_requests += 1;
                    pending.push(CircuitEvent::CallRejected {
                        name: self.name.clone(),
                    });
                    Err((inner.state, inner.stats.clone()))
                }
            }
        };
        self.emit(pending);
        result
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let now = now_ms();
            inner.stats.successful_requests += 1;
            inner.stats.consecutive_successes += 1;
            inner.stats.consecutive_failures = 0;
            inner.stats.last_success_ms = Some(now);
            Self::push_outcome(&mut inner, true, self.config.rolling_window);

            if inner.state == CircuitState::HalfOpen {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                if inner.stats.consecutive_successes >= self.config.success_threshold {
                    info!(
                        circuit = %self.name,
                        successes = inner.stats.consecutive_successes,
                        "circuit closing after successful probes"
                    );
                    self.transition(&mut inner, CircuitState::Closed, &mut pending);
                }
            }
            pending.push(CircuitEvent::CallSucceeded {
                name: self.name.clone(),
            });
        }
        self.emit(pending);
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            let now = now_ms();
            inner.stats.failed_requests += 1;
            inner.stats.consecutive_failures += 1;
            inner.stats.consecutive_successes = 0;
            inner.stats.last_failure_ms = Some(now);
            Self::push_outcome(&mut inner, false, self.config.rolling_window);

            match inner.state {
                CircuitState::Closed => {
                    let consecutive_trip =
                        inner.stats.consecutive_failures >= self.config.failure_threshold;
                    let window_trip = self.window_trip(&inner);
                    if consecutive_trip || window_trip {
                        warn!(
                            circuit = %self.name,
                            consecutive_failures = inner.stats.consecutive_failures,
                            window_trip,
                            "circuit opening"
                        );
                        self.transition(&mut inner, CircuitState::Open, &mut pending);
                    }
                }
                CircuitState::HalfOpen => {
                    warn!(circuit = %self.name, "circuit re-opening after failed probe");
                    self.transition(&mut inner, CircuitState::Open, &mut pending);
                }
                CircuitState::Open => {}
            }
            pending.push(CircuitEvent::CallFailed {
                name: self.name.clone(),
            });
        }
        self.emit(pending);
    }

    /// Current state. Reads passively: an expired open timer takes effect on
    /// the next admission attempt.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap().state
    }

    /// Snapshot of the breaker's counters.
    pub fn stats(&self) -> CircuitStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Force the breaker closed, clearing the run counters and the window.
    pub fn reset(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            info!(circuit = %self.name, "circuit reset to closed");
            self.transition(&mut inner, CircuitState::Closed, &mut pending);
        }
        self.emit(pending);
    }

    /// Force the breaker open, as if it had just tripped.
    pub fn trip(&self) {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock().unwrap();
            warn!(circuit = %self.name, "circuit tripped open");
            self.transition(&mut inner, CircuitState::Open, &mut pending);
        }
        self.emit(pending);
    }

    /// Apply a state transition, resetting the counters the new state relies on.
    fn transition(
        &self,
        inner: &mut BreakerInner,
        to: CircuitState,
        pending: &mut Vec<CircuitEvent>,
    ) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        inner.stats.state_changed_at_ms = now_ms();
        match to {
            CircuitState::Closed => {
                inner.stats.consecutive_failures = 0;
                inner.stats.consecutive_successes = 0;
                inner.window.clear();
                inner.opened_at = None;
                inner.half_open_in_flight = 0;
            }
            CircuitState::Open => {
                inner.stats.consecutive_successes = 0;
                inner.opened_at = Some(Instant::now());
                inner.half_open_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                inner.stats.consecutive_failures = 0;
                inner.stats.consecutive_successes = 0;
                inner.half_open_in_flight = 0;
            }
        }
        debug!(circuit = %self.name, %from, %to, "circuit state changed");
        pending.push(CircuitEvent::StateChanged {
            name: self.name.clone(),
            from,
            to,
        });
        pending.push(match to {
            CircuitState::Open => CircuitEvent::Opened {
                name: self.name.clone(),
            },
            CircuitState::Closed => CircuitEvent::Closed {
                name: self.name.clone(),
            },
            CircuitState::HalfOpen => CircuitEvent::HalfOpened {
                name: self.name.clone(),
            },
        });
    }

    fn push_outcome(inner: &mut BreakerInner, ok: bool, window: Duration) {
        let now = Instant::now();
        inner.window.push_back((now, ok));
        while let Some(&(t, _)) = inner.window.front() {
            if now.duration_since(t) > window {
                inner.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_trip(&self, inner: &BreakerInner) -> bool {
        let volume = inner.window.len();
        if volume < self.config.volume_threshold {
            return false;
        }
        let failures = inner.window.iter().filter(|(_, ok)| !ok).count();
        let error_pct = failures as f64 / volume as f64 * 100.0;
        error_pct >= self.config.error_percentage_threshold
    }

    fn emit(&self, pending: Vec<CircuitEvent>) {
        for event in pending {
            let _ = self.events.send(event);
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("consecutive_failures", &inner.stats.consecutive_failures)
            .finish()
    }
}
