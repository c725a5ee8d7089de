//! Replication lag classification and aggregate statistics.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Thresholds for lag classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LagThresholds {
    /// Lag at or above this is a warning, in milliseconds.
    pub warn_ms: u64,
    /// Lag at or above this is critical, in milliseconds.
    pub critical_ms: u64,
}

impl Default for LagThresholds {
    fn default() -> Self {
        Self {
            warn_ms: 1_000,
            critical_ms: 5_000,
        }
    }
}

/// Classification of one lag sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LagLevel {
    /// Below the warning threshold.
    Ok,
    /// At or above the warning threshold.
    Warning,
    /// At or above the critical threshold.
    Critical,
}

/// Aggregate lag statistics across all samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LagStats {
    /// Samples recorded.
    pub sample_count: u64,
    /// Rolling average lag in milliseconds.
    pub avg_lag_ms: f64,
    /// Maximum lag observed in milliseconds.
    pub max_lag_ms: u64,
    /// Samples at or above the warning threshold.
    pub warning_count: u64,
    /// Samples at or above the critical threshold.
    pub critical_count: u64,
}

/// Tracks replication lag samples against thresholds.
#[derive(Debug)]
pub struct LagTracker {
    thresholds: LagThresholds,
    stats: LagStats,
}

impl LagTracker {
    /// Create a tracker with the given thresholds.
    pub fn new(thresholds: LagThresholds) -> Self {
        Self {
            thresholds,
            stats: LagStats::default(),
        }
    }

    /// Record one lag sample and classify it.
    pub fn record(&mut self, source: &str, target: &str, lag_ms: u64) -> LagLevel {
        self.stats.sample_count += 1;
        let n = self.stats.sample_count as f64;
        self.stats.avg_lag_ms = self.stats.avg_lag_ms + (lag_ms as f64 - self.stats.avg_lag_ms) / n;
        if lag_ms > self.stats.max_lag_ms {
            self.stats.max_lag_ms = lag_ms;
        }

        if lag_ms >= self.thresholds.critical_ms {
            self.stats.critical_count += 1;
            warn!(source, target, lag_ms, "replication lag critical");
            return LagLevel::Critical;
        }
        if lag_ms >= self.thresholds.warn_ms {
            self.stats.warning_count += 1;
            info!(source, target, lag_ms, "replication lag elevated");
            return LagLevel::Warning;
        }
        LagLevel::Ok
    }

    /// Aggregate statistics so far.
    pub fn stats(&self) -> &LagStats {
        &self.stats
    }

    /// Reset the statistics, e.g. after an incident.
    pub fn reset(&mut self) {
        self.stats = LagStats::default();
    }
}
