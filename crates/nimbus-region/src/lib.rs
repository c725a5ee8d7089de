#![warn(missing_docs)]

//! Nimbus multi-region subsystem: region table, request routing, cross-region
//! replication queues, conflict log, and failover orchestration

pub mod conflict;
pub mod error;
pub mod failover;
pub mod lag;
pub mod manager;
pub mod replication;
pub mod routing;
pub mod store;
pub mod types;

pub use conflict::{Conflict, ConflictLog, ResolutionStrategy};
pub use error::RegionError;
pub use lag::{LagLevel, LagStats, LagThresholds, LagTracker};
pub use manager::{MultiRegionConfig, MultiRegionManager};
pub use replication::{ReplicationQueue, ReplicationStatus, SyncBatch, SyncOperation};
pub use routing::{
    RequestContext, RequestRouter, RoutingDecision, RoutingRule, RoutingStrategy, RuleCondition,
    RuleField, RuleOp,
};
pub use store::{MemoryRegionStore, RegionStore};
pub use types::{
    FailoverRecord, FailoverStatus, FailoverTrigger, RegionDefinition, RegionEndpoints,
    RegionEvent, RegionHealth, RegionLocation, RegionRole, RegionStatus,
};
