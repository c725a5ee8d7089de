//! Error types for the multi-region subsystem.

use thiserror::Error;

/// Errors that can occur while coordinating regions.
#[derive(Debug, Error)]
pub enum RegionError {
    /// Unknown region id.
    #[error("unknown region: {region_id}")]
    RegionUnknown {
        /// The unknown region identifier.
        region_id: String,
    },

    /// A region with this id already exists.
    #[error("region already exists: {region_id}")]
    RegionExists {
        /// The duplicate region identifier.
        region_id: String,
    },

    /// Another region already holds the primary role.
    #[error("region '{other}' already holds the primary role")]
    PrimaryExists {
        /// The region currently holding the primary role.
        other: String,
    },

    /// No active region is available to route to.
    #[error("no active region available for routing")]
    NoActiveRegion,

    /// Unknown conflict id.
    #[error("unknown conflict: {conflict_id}")]
    ConflictUnknown {
        /// The unknown conflict identifier.
        conflict_id: String,
    },

    /// The conflict was already resolved with a different resolution.
    #[error("conflict {conflict_id} already resolved with a different resolution")]
    ConflictResolved {
        /// The conflict identifier.
        conflict_id: String,
    },

    /// A merge resolution was requested without a merged value.
    #[error("merge resolution requires an explicit merged value")]
    MergeValueMissing,

    /// A promotion or demotion step failed mid-failover.
    #[error("failover from '{from}' to '{to}' failed at step '{step}': {message}")]
    FailoverFailed {
        /// Region being demoted.
        from: String,
        /// Region being promoted.
        to: String,
        /// The step that failed.
        step: String,
        /// Diagnostic from the failing step.
        message: String,
    },

    /// A failover was requested from a region onto itself.
    #[error("cannot fail over a region onto itself: {region_id}")]
    FailoverSelf {
        /// The region identifier.
        region_id: String,
    },

    /// The region store rejected an operation.
    #[error("storage error: {message}")]
    Storage {
        /// Diagnostic from the store.
        message: String,
    },
}
