//! Service health aggregation.
//!
//! Composes many per-service probe results plus a dependency graph into one
//! aggregated snapshot. Entries are cached per service and recomputed on read:
//! anything older than the stale threshold is forced to `Unknown` regardless
//! of its last real status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

use crate::error::HealthError;
use crate::status::HealthStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Entries older than this are reported as `Unknown`.
    pub stale_threshold: Duration,
    /// Probe timeout for services that do not set their own.
    pub default_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            stale_threshold: Duration::from_secs(60),
            default_timeout: Duration::from_secs(5),
        }
    }
}

/// Registration data for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service id.
    pub id: String,
    /// Whether this service is critical to the platform.
    pub critical: bool,
    /// Ids of services this one depends on (one level).
    pub dependencies: Vec<String>,
    /// Per-service probe timeout; falls back to the aggregator default.
    pub timeout: Option<Duration>,
}

impl ServiceConfig {
    /// Minimal config: non-critical, no dependencies, default timeout.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            critical: false,
            dependencies: Vec::new(),
            timeout: None,
        }
    }
}

/// What a service probe reports.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Boolean probe: `true` maps to healthy, `false` to unhealthy.
    Alive(bool),
    /// Structured probe: the status is passed through unchanged.
    Status(HealthStatus, Option<String>),
}

/// A probe owned by one registered service.
#[async_trait]
pub trait ServiceProbe: Send + Sync {
    /// Run the probe once.
    async fn check(&self) -> ProbeOutcome;
}

/// Cached health of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceHealth {
    /// Service id.
    pub id: String,
    /// Status from the most recent check (staleness applied on read).
    pub status: HealthStatus,
    /// Whether the service is critical.
    pub critical: bool,
    /// Declared dependencies.
    pub dependencies: Vec<String>,
    /// When the service was last checked (ms since epoch, 0 = never).
    pub last_check_ms: u64,
    /// When the service was last healthy (ms since epoch).
    pub last_healthy_ms: Option<u64>,
    /// Consecutive non-healthy checks; resets on healthy.
    pub error_count: u32,
    /// Diagnostic from the most recent check.
    pub detail: Option<String>,
}

/// The aggregated snapshot returned by [`HealthAggregator::get_health`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    /// Overall status under the precedence rules.
    pub status: HealthStatus,
    /// Effective per-service health, staleness applied.
    pub services: Vec<ServiceHealth>,
    /// When this snapshot was computed (ms since epoch).
    pub timestamp_ms: u64,
}

/// Alerts emitted by the aggregator. Overall transitions are distinct from
/// per-service transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AggregatorEvent {
    /// One service's status changed.
    ServiceChanged {
        /// Service id.
        service_id: String,
        /// Previous status.
        from: HealthStatus,
        /// New status.
        to: HealthStatus,
    },
    /// The overall status changed.
    OverallChanged {
        /// Previous overall status.
        from: HealthStatus,
        /// New overall status.
        to: HealthStatus,
    },
}

struct ServiceEntry {
    config: ServiceConfig,
    probe: Arc<dyn ServiceProbe>,
    health: ServiceHealth,
}

struct AggregatorState {
    services: HashMap<String, ServiceEntry>,
    last_overall: HealthStatus,
}

/// Aggregates per-service health into one platform view.
pub struct HealthAggregator {
    config: AggregatorConfig,
    state: Mutex<AggregatorState>,
    events: broadcast::Sender<AggregatorEvent>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl HealthAggregator {
    /// Create an aggregator.
    pub fn new(config: AggregatorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            state: Mutex::new(AggregatorState {
                services: HashMap::new(),
                last_overall: HealthStatus::Unknown,
            }),
            events,
        }
    }

    /// Subscribe to aggregator alerts.
    pub fn subscribe(&self) -> broadcast::Receiver<AggregatorEvent> {
        self.events.subscribe()
    }

    /// Register a service with its probe. Re-registering resets its history.
    pub async fn register_service(&self, config: ServiceConfig, probe: Arc<dyn ServiceProbe>) {
        let health = ServiceHealth {
            id: config.id.clone(),
            status: HealthStatus::Unknown,
            critical: config.critical,
            dependencies: config.dependencies.clone(),
            last_check_ms: 0,
            last_healthy_ms: None,
            error_count: 0,
            detail: None,
        };
        let mut state = self.state.lock().await;
        state.services.insert(
            config.id.clone(),
            ServiceEntry {
                config,
                probe,
                health,
            },
        );
    }

    /// Remove a service.
    pub async fn unregister_service(&self, service_id: &str) {
        self.state.lock().await.services.remove(service_id);
    }

    /// Run one service's probe, racing it against the service timeout, and
    /// apply the result. A timed-out probe is recorded as unhealthy.
    pub async fn check_service(&self, service_id: &str) -> Result<ServiceHealth, HealthError> {
        let (probe, timeout) = {
            let state = self.state.lock().await;
            let entry =
                state
                    .services
                    .get(service_id)
                    .ok_or_else(|| HealthError::UnknownService {
                        service_id: service_id.to_string(),
                    })?;
            (
                Arc::clone(&entry.probe),
                entry.config.timeout.unwrap_or(self.config.default_timeout),
            )
        };

        let (status, detail) = match tokio::time::timeout(timeout, probe.check()).await {
            Err(_) => (
                HealthStatus::Unhealthy,
                Some(format!("probe timed out after {}ms", timeout.as_millis())),
            ),
            Ok(ProbeOutcome::Alive(true)) => (HealthStatus::Healthy, None),
            Ok(ProbeOutcome::Alive(false)) => (HealthStatus::Unhealthy, None),
            Ok(ProbeOutcome::Status(status, detail)) => (status, detail),
        };

        let (snapshot, event) = {
            let mut state = self.state.lock().await;
            let entry =
                state
                    .services
                    .get_mut(service_id)
                    .ok_or_else(|| HealthError::UnknownService {
                        service_id: service_id.to_string(),
                    })?;
            let now = now_ms();
            let from = entry.health.status;
            entry.health.last_check_ms = now;
            entry.health.status = status;
            entry.health.detail = detail;
            if status == HealthStatus::Healthy {
                entry.health.error_count = 0;
                entry.health.last_healthy_ms = Some(now);
            } else {
                entry.health.error_count += 1;
                debug!(
                    service = service_id,
                    %status,
                    errors = entry.health.error_count,
                    "service check not healthy"
                );
            }
            let event = (from != status).then(|| AggregatorEvent::ServiceChanged {
                service_id: service_id.to_string(),
                from,
                to: status,
            });
            (entry.health.clone(), event)
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        Ok(snapshot)
    }

    /// Effective status of one entry with staleness applied.
    fn effective_status(&self, health: &ServiceHealth, now: u64) -> HealthStatus {
        if health.last_check_ms == 0 {
            return HealthStatus::Unknown;
        }
        let stale_ms = self.config.stale_threshold.as_millis() as u64;
        if now.saturating_sub(health.last_check_ms) > stale_ms {
            return HealthStatus::Unknown;
        }
        health.status
    }

    /// Overall precedence: any unhealthy wins, then degraded/unknown, then
    /// healthy.
    fn overall(services: &[ServiceHealth]) -> HealthStatus {
        if services
            .iter()
            .any(|s| s.status == HealthStatus::Unhealthy)
        {
            return HealthStatus::Unhealthy;
        }
        if services
            .iter()
            .any(|s| s.status == HealthStatus::Degraded || s.status == HealthStatus::Unknown)
        {
            return HealthStatus::Degraded;
        }
        if services.iter().any(|s| s.status == HealthStatus::Healthy) {
            return HealthStatus::Healthy;
        }
        HealthStatus::Unknown
    }

    /// Recompute the aggregated snapshot. Fires an `OverallChanged` alert when
    /// the overall status differs from the previous computation.
    pub async fn get_health(&self) -> AggregatedHealth {
        let now = now_ms();
        let (snapshot, event) = {
            let mut state = self.state.lock().await;
            let mut services: Vec<ServiceHealth> = state
                .services
                .values()
                .map(|entry| {
                    let mut health = entry.health.clone();
                    health.status = self.effective_status(&entry.health, now);
                    health
                })
                .collect();
            services.sort_by(|a, b| a.id.cmp(&b.id));

            let overall = Self::overall(&services);
            let event = if overall != state.last_overall {
                let from = state.last_overall;
                state.last_overall = overall;
                if overall != HealthStatus::Healthy {
                    warn!(%from, to = %overall, "overall platform health changed");
                }
                Some(AggregatorEvent::OverallChanged { from, to: overall })
            } else {
                None
            };

            (
                AggregatedHealth {
                    status: overall,
                    services,
                    timestamp_ms: now,
                },
                event,
            )
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
        snapshot
    }

    /// Whether a service and every one of its direct dependencies are healthy
    /// right now (staleness applied). Unregistered dependencies count as not
    /// ready.
    pub async fn is_service_ready(&self, service_id: &str) -> bool {
        let now = now_ms();
        let state = self.state.lock().await;
        let entry = match state.services.get(service_id) {
            Some(e) => e,
            None => return false,
        };
        if self.effective_status(&entry.health, now) != HealthStatus::Healthy {
            return false;
        }
        entry.config.dependencies.iter().all(|dep| {
            state
                .services
                .get(dep)
                .map(|d| self.effective_status(&d.health, now) == HealthStatus::Healthy)
                .unwrap_or(false)
        })
    }
}
