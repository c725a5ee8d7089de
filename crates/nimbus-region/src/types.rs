//! Core types for the multi-region subsystem.

use nimbus_health::HealthStatus;
use serde::{Deserialize, Serialize};

/// Role a region plays in the deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionRole {
    /// Serves writes; at most one region holds this role.
    Primary,
    /// Ready to be promoted.
    Standby,
}

impl std::fmt::Display for RegionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionRole::Primary => write!(f, "primary"),
            RegionRole::Standby => write!(f, "standby"),
        }
    }
}

/// Operational status of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStatus {
    /// Serving traffic.
    Active,
    /// Impaired but not removed from service.
    Degraded,
    /// Not serving traffic.
    Offline,
    /// Finishing in-flight work before going offline.
    Draining,
}

impl std::fmt::Display for RegionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionStatus::Active => write!(f, "active"),
            RegionStatus::Degraded => write!(f, "degraded"),
            RegionStatus::Offline => write!(f, "offline"),
            RegionStatus::Draining => write!(f, "draining"),
        }
    }
}

/// Geographic location of a region.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionLocation {
    /// ISO country code or name used for geo routing.
    pub country: String,
    /// City, for operators.
    pub city: String,
}

/// Endpoints exposed by a region.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RegionEndpoints {
    /// Base URL probed for liveness.
    pub health_url: String,
    /// Base URL traffic is routed to.
    pub api_url: String,
}

/// A region in the region table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDefinition {
    /// Region id, e.g. `us-east`.
    pub id: String,
    /// Current role.
    pub role: RegionRole,
    /// Current status.
    pub status: RegionStatus,
    /// Geographic location.
    pub location: RegionLocation,
    /// Exposed endpoints.
    pub endpoints: RegionEndpoints,
}

impl RegionDefinition {
    /// Create an active standby region.
    pub fn new(id: impl Into<String>, country: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: RegionRole::Standby,
            status: RegionStatus::Active,
            location: RegionLocation {
                country: country.into(),
                city: city.into(),
            },
            endpoints: RegionEndpoints::default(),
        }
    }

    /// Mark this region as the primary.
    pub fn as_primary(mut self) -> Self {
        self.role = RegionRole::Primary;
        self
    }

    /// Set the region's endpoints.
    pub fn with_endpoints(
        mut self,
        health_url: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        self.endpoints = RegionEndpoints {
            health_url: health_url.into(),
            api_url: api_url.into(),
        };
        self
    }

    /// Whether the region can take traffic.
    pub fn is_active(&self) -> bool {
        self.status == RegionStatus::Active
    }
}

/// One health observation for a region, overwritten each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionHealth {
    /// Region id.
    pub region_id: String,
    /// When the observation was taken (ms since epoch).
    pub timestamp_ms: u64,
    /// Debounced probe status.
    pub status: HealthStatus,
    /// Observed client latency in milliseconds.
    pub latency_ms: u64,
    /// Error rate over the observation window (0.0..=1.0).
    pub error_rate: f64,
    /// Availability over the observation window (0.0..=1.0).
    pub availability: f64,
    /// CPU usage percentage.
    pub cpu_percent: f64,
    /// Memory usage percentage.
    pub memory_percent: f64,
}

impl RegionHealth {
    /// A healthy observation with the given latency; the resource fields
    /// default to zero.
    pub fn healthy(region_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            region_id: region_id.into(),
            timestamp_ms: 0,
            status: HealthStatus::Healthy,
            latency_ms,
            error_rate: 0.0,
            availability: 1.0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
        }
    }

    /// An unhealthy observation.
    pub fn unhealthy(region_id: impl Into<String>) -> Self {
        Self {
            region_id: region_id.into(),
            timestamp_ms: 0,
            status: HealthStatus::Unhealthy,
            latency_ms: 0,
            error_rate: 1.0,
            availability: 0.0,
            cpu_percent: 0.0,
            memory_percent: 0.0,
        }
    }
}

/// What started a failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverTrigger {
    /// Triggered by consecutive failed health checks.
    Automatic,
    /// Requested by an operator.
    Manual,
}

/// Lifecycle status of a failover record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStatus {
    /// Steps are being applied.
    Initiated,
    /// All steps applied.
    Completed,
    /// A step failed; roles reflect only the steps that completed.
    Failed,
    /// Reverted by an operator.
    RolledBack,
}

/// One entry in the bounded failover audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailoverRecord {
    /// Unique id.
    pub id: String,
    /// What started the failover.
    pub trigger: FailoverTrigger,
    /// Region demoted.
    pub from_region: String,
    /// Region promoted.
    pub to_region: String,
    /// Operator- or system-supplied reason.
    pub reason: String,
    /// Final status.
    pub status: FailoverStatus,
    /// When the failover started (ms since epoch).
    pub started_at_ms: u64,
    /// How long the failover took, in milliseconds.
    pub duration_ms: u64,
}

/// Events emitted by the multi-region manager. Every region, replication,
/// conflict, and failover transition is emitted after it is applied and before
/// the mutating call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionEvent {
    /// A region was added to the table.
    RegionAdded {
        /// Region id.
        region_id: String,
    },
    /// A region was removed from the table.
    RegionRemoved {
        /// Region id.
        region_id: String,
    },
    /// A region's status changed.
    RegionStatusChanged {
        /// Region id.
        region_id: String,
        /// Previous status.
        from: RegionStatus,
        /// New status.
        to: RegionStatus,
    },
    /// A region's role changed.
    RegionRoleChanged {
        /// Region id.
        region_id: String,
        /// Previous role.
        from: RegionRole,
        /// New role.
        to: RegionRole,
    },
    /// A routing decision was made.
    RoutingDecision {
        /// Chosen region.
        region_id: String,
        /// Strategy that produced the decision.
        strategy: crate::routing::RoutingStrategy,
        /// Rule that matched, if any.
        matched_rule: Option<String>,
    },
    /// A replication batch was handed to the transport.
    SyncBatchSent {
        /// Target region.
        target_region: String,
        /// Operations in the batch.
        operations: usize,
    },
    /// A replication batch was acknowledged by the target.
    SyncBatchAcked {
        /// Target region.
        target_region: String,
        /// Operations acknowledged.
        operations: usize,
    },
    /// Divergent document versions were recorded.
    ConflictDetected {
        /// Conflict id.
        conflict_id: String,
        /// Collection holding the document.
        collection: String,
        /// Document id.
        document_id: String,
    },
    /// A conflict was explicitly resolved.
    ConflictResolved {
        /// Conflict id.
        conflict_id: String,
    },
    /// A failover began.
    FailoverInitiated {
        /// Failover id.
        failover_id: String,
        /// Region being demoted.
        from_region: String,
        /// Region being promoted.
        to_region: String,
    },
    /// A failover applied all of its steps.
    FailoverCompleted {
        /// Failover id.
        failover_id: String,
        /// Demoted region.
        from_region: String,
        /// Promoted region.
        to_region: String,
    },
    /// A failover step failed; roles reflect the last completed step.
    FailoverFailed {
        /// Failover id.
        failover_id: String,
        /// Region that was being demoted.
        from_region: String,
        /// Region that was being promoted.
        to_region: String,
        /// Diagnostic from the failing step.
        reason: String,
    },
    /// A region crossed the unhealthy threshold.
    RegionUnhealthy {
        /// Region id.
        region_id: String,
        /// Failure run length when the threshold was crossed.
        consecutive_failures: u32,
    },
    /// A previously unhealthy region recovered.
    RegionRecovered {
        /// Region id.
        region_id: String,
    },
    /// Replication lag crossed the critical threshold.
    ReplicationLagWarning {
        /// Source region.
        source_region: String,
        /// Target region.
        target_region: String,
        /// Observed lag in milliseconds.
        lag_ms: u64,
    },
}
