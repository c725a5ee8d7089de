//! Error types for the health subsystem.

use thiserror::Error;

/// Errors returned by the checker and aggregator.
#[derive(Debug, Error)]
pub enum HealthError {
    /// The region id has not been registered with the checker.
    #[error("unknown region: {region_id}")]
    UnknownRegion {
        /// The unregistered region id.
        region_id: String,
    },
    /// The service id has not been registered with the aggregator.
    #[error("unknown service: {service_id}")]
    UnknownService {
        /// The unregistered service id.
        service_id: String,
    },
}
