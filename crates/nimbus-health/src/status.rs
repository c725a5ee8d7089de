//! Shared health status vocabulary.

use serde::{Deserialize, Serialize};

/// Health of an endpoint or service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Impaired but partially serving.
    Degraded,
    /// Not serving.
    Unhealthy,
    /// Not yet measured, or measurements too stale to trust.
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Whether this status counts as fully operational.
    pub fn is_ok(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Severity ordering for worst-status aggregation. Higher is worse.
    pub fn severity(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}
