//! The multi-region coordinator.
//!
//! One [`MultiRegionManager`] owns the region table (through its
//! [`RegionStore`]), the replication queues, the conflict log, and the
//! failover audit trail. All mutation goes through its methods, which makes the
//! manager the lock boundary; region failures surface as emitted events, never
//! as panics that could take the coordinator down with one region.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use nimbus_health::HealthStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::conflict::{Conflict, ConflictLog, ResolutionStrategy};
use crate::error::RegionError;
use crate::failover::{FailoverHistory, RegionHealthState};
use crate::lag::{LagLevel, LagStats, LagThresholds, LagTracker};
use crate::replication::{ReplicationQueue, ReplicationStatus, SyncBatch, SyncOperation};
use crate::routing::{RequestContext, RequestRouter, RoutingDecision, RoutingRule, RoutingStrategy};
use crate::store::{MemoryRegionStore, RegionStore};
use crate::types::{
    FailoverRecord, FailoverStatus, FailoverTrigger, RegionDefinition, RegionEvent, RegionHealth,
    RegionRole, RegionStatus,
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the multi-region manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiRegionConfig {
    /// Fallback routing strategy when no rule matches.
    pub routing_strategy: RoutingStrategy,
    /// Maximum operations flushed per target per cycle.
    pub batch_size: usize,
    /// Replication lag warning threshold in milliseconds.
    pub lag_warn_ms: u64,
    /// Replication lag critical threshold in milliseconds.
    pub lag_critical_ms: u64,
    /// Consecutive unhealthy checks before automatic failover is considered.
    pub failover_threshold: u32,
    /// Consecutive healthy checks before a region counts as recovered.
    pub recovery_threshold: u32,
    /// Failover audit records retained.
    pub max_failover_history: usize,
}

impl Default for MultiRegionConfig {
    fn default() -> Self {
        Self {
            routing_strategy: RoutingStrategy::Failover,
            batch_size: 50,
            lag_warn_ms: 1_000,
            lag_critical_ms: 5_000,
            failover_threshold: 3,
            recovery_threshold: 2,
            max_failover_history: 100,
        }
    }
}

struct ManagerState {
    router: RequestRouter,
    replication: ReplicationQueue,
    conflicts: ConflictLog,
    lag: LagTracker,
    failovers: FailoverHistory,
    health: HashMap<String, RegionHealthState>,
    region_health: HashMap<String, RegionHealth>,
}

/// Coordinator for the region table, routing, replication, conflicts, and
/// failover.
pub struct MultiRegionManager {
    config: MultiRegionConfig,
    store: Arc<dyn RegionStore>,
    state: Mutex<ManagerState>,
    events: broadcast::Sender<RegionEvent>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl MultiRegionManager {
    /// Create a manager backed by an in-memory region store.
    pub fn new(config: MultiRegionConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryRegionStore::new()))
    }

    /// Create a manager backed by an injected region store.
    pub fn with_store(config: MultiRegionConfig, store: Arc<dyn RegionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let state = ManagerState {
            router: RequestRouter::new(config.routing_strategy),
            replication: ReplicationQueue::new(config.batch_size),
            conflicts: ConflictLog::new(),
            lag: LagTracker::new(LagThresholds {
                warn_ms: config.lag_warn_ms,
                critical_ms: config.lag_critical_ms,
            }),
            failovers: FailoverHistory::new(config.max_failover_history),
            health: HashMap::new(),
            region_health: HashMap::new(),
        };
        Self {
            config,
            store,
            state: Mutex::new(state),
            events,
        }
    }

    /// Subscribe to manager events.
    pub fn subscribe(&self) -> broadcast::Receiver<RegionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: RegionEvent) {
        let _ = self.events.send(event);
    }

    async fn primary_other_than(&self, region_id: &str) -> Result<Option<String>, RegionError> {
        Ok(self
            .store
            .list()
            .await?
            .into_iter()
            .find(|r| r.role == RegionRole::Primary && r.id != region_id)
            .map(|r| r.id))
    }

    /// Add a region to the table.
    pub async fn add_region(&self, region: RegionDefinition) -> Result<(), RegionError> {
        if self.store.get(&region.id).await?.is_some() {
            return Err(RegionError::RegionExists {
                region_id: region.id,
            });
        }
        if region.role == RegionRole::Primary {
            if let Some(other) = self.primary_other_than(&region.id).await? {
                return Err(RegionError::PrimaryExists { other });
            }
        }
        let region_id = region.id.clone();
        info!(region = %region_id, role = %region.role, "region added");
        self.store.upsert(region).await?;
        self.state
            .lock()
            .await
            .health
            .entry(region_id.clone())
            .or_default();
        self.emit(RegionEvent::RegionAdded { region_id });
        Ok(())
    }

    /// Replace a region's definition, emitting status/role change events.
    pub async fn update_region(&self, region: RegionDefinition) -> Result<(), RegionError> {
        let existing =
            self.store
                .get(&region.id)
                .await?
                .ok_or_else(|| RegionError::RegionUnknown {
                    region_id: region.id.clone(),
                })?;
        if region.role == RegionRole::Primary && existing.role != RegionRole::Primary {
            if let Some(other) = self.primary_other_than(&region.id).await? {
                return Err(RegionError::PrimaryExists { other });
            }
        }
        self.store.upsert(region.clone()).await?;
        if existing.status != region.status {
            self.emit(RegionEvent::RegionStatusChanged {
                region_id: region.id.clone(),
                from: existing.status,
                to: region.status,
            });
        }
        if existing.role != region.role {
            self.emit(RegionEvent::RegionRoleChanged {
                region_id: region.id.clone(),
                from: existing.role,
                to: region.role,
            });
        }
        Ok(())
    }

    /// Remove a region, dropping its replication queues and health state.
    pub async fn remove_region(&self, region_id: &str) -> Result<RegionDefinition, RegionError> {
        let removed =
            self.store
                .remove(region_id)
                .await?
                .ok_or_else(|| RegionError::RegionUnknown {
                    region_id: region_id.to_string(),
                })?;
        {
            let mut state = self.state.lock().await;
            state.replication.remove_target(region_id);
            state.health.remove(region_id);
            state.region_health.remove(region_id);
        }
        info!(region = %region_id, "region removed");
        self.emit(RegionEvent::RegionRemoved {
            region_id: region_id.to_string(),
        });
        Ok(removed)
    }

    /// Set a region's status directly.
    pub async fn set_region_status(
        &self,
        region_id: &str,
        status: RegionStatus,
    ) -> Result<(), RegionError> {
        let existing =
            self.store
                .get(region_id)
                .await?
                .ok_or_else(|| RegionError::RegionUnknown {
                    region_id: region_id.to_string(),
                })?;
        if existing.status == status {
            return Ok(());
        }
        self.store.set_status(region_id, status).await?;
        self.emit(RegionEvent::RegionStatusChanged {
            region_id: region_id.to_string(),
            from: existing.status,
            to: status,
        });
        Ok(())
    }

    /// Every region, sorted by id.
    pub async fn regions(&self) -> Result<Vec<RegionDefinition>, RegionError> {
        self.store.list().await
    }

    /// One region.
    pub async fn region(&self, region_id: &str) -> Result<Option<RegionDefinition>, RegionError> {
        self.store.get(region_id).await
    }

    /// The most recent health observation for a region, if any.
    pub async fn region_health(&self, region_id: &str) -> Option<RegionHealth> {
        self.state.lock().await.region_health.get(region_id).cloned()
    }

    // ---- routing ----

    /// Add a routing rule.
    pub async fn add_routing_rule(&self, rule: RoutingRule) {
        self.state.lock().await.router.add_rule(rule);
    }

    /// Remove a routing rule by id.
    pub async fn remove_routing_rule(&self, rule_id: &str) -> bool {
        self.state.lock().await.router.remove_rule(rule_id)
    }

    /// Change the fallback routing strategy.
    pub async fn set_routing_strategy(&self, strategy: RoutingStrategy) {
        self.state.lock().await.router.set_strategy(strategy);
    }

    /// Set the weight used by weighted routing.
    pub async fn set_region_weight(&self, region_id: &str, weight: u32) {
        self.state.lock().await.router.set_weight(region_id, weight);
    }

    /// Pick a region for one request.
    ///
    /// Latency-based routing only considers latencies from healthy
    /// observations; a failing region's numbers are not trustworthy.
    pub async fn route_request(
        &self,
        ctx: &RequestContext,
    ) -> Result<RoutingDecision, RegionError> {
        let regions = self.store.list().await?;
        let decision = {
            let state = self.state.lock().await;
            let latencies: HashMap<String, u64> = state
                .region_health
                .iter()
                .filter(|(_, h)| h.status == HealthStatus::Healthy)
                .map(|(id, h)| (id.clone(), h.latency_ms))
                .collect();
            state.router.route(ctx, &regions, &latencies)?
        };
        debug!(region = %decision.region_id, strategy = %decision.strategy, "routing decision");
        self.emit(RegionEvent::RoutingDecision {
            region_id: decision.region_id.clone(),
            strategy: decision.strategy,
            matched_rule: decision.matched_rule.clone(),
        });
        Ok(decision)
    }

    // ---- replication ----

    /// Record a write in `source_region`, fanning a sync operation out to
    /// every other region.
    pub async fn record_write(
        &self,
        source_region: &str,
        collection: &str,
        document_id: &str,
        payload: serde_json::Value,
    ) -> Result<SyncOperation, RegionError> {
        if self.store.get(source_region).await?.is_none() {
            return Err(RegionError::RegionUnknown {
                region_id: source_region.to_string(),
            });
        }
        let targets: Vec<String> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|r| r.id != source_region)
            .map(|r| r.id)
            .collect();

        let op = SyncOperation::new(source_region, collection, document_id, payload);
        {
            let mut state = self.state.lock().await;
            for target in &targets {
                state.replication.enqueue(target, op.clone());
            }
        }
        debug!(
            source = source_region,
            targets = targets.len(),
            op = %op.id,
            "write fanned out"
        );
        Ok(op)
    }

    /// Flush every target's queue, handing the batches to the caller's
    /// transport. Critical replication lag emits a non-fatal warning event.
    pub async fn flush_replication(&self) -> Vec<SyncBatch> {
        let (batches, lag_events) = {
            let mut state = self.state.lock().await;
            let batches = state.replication.flush_all();
            let samples = state.replication.drain_lag_samples();
            let mut lag_events = Vec::new();
            for (source, target, lag_ms) in samples {
                if state.lag.record(&source, &target, lag_ms) == LagLevel::Critical {
                    lag_events.push(RegionEvent::ReplicationLagWarning {
                        source_region: source,
                        target_region: target,
                        lag_ms,
                    });
                }
            }
            (batches, lag_events)
        };
        for batch in &batches {
            self.emit(RegionEvent::SyncBatchSent {
                target_region: batch.target_region.clone(),
                operations: batch.operations.len(),
            });
        }
        for event in lag_events {
            self.emit(event);
        }
        batches
    }

    /// Acknowledge operations previously flushed to a target.
    pub async fn acknowledge_sync(&self, target_region: &str, op_ids: &[String]) -> usize {
        let acked = {
            let mut state = self.state.lock().await;
            state.replication.acknowledge(target_region, op_ids)
        };
        if acked > 0 {
            self.emit(RegionEvent::SyncBatchAcked {
                target_region: target_region.to_string(),
                operations: acked,
            });
        }
        acked
    }

    /// Replication status for every (source, target) pair.
    pub async fn replication_status(&self) -> Vec<ReplicationStatus> {
        self.state.lock().await.replication.statuses()
    }

    /// Aggregate replication lag statistics.
    pub async fn lag_stats(&self) -> LagStats {
        self.state.lock().await.lag.stats().clone()
    }

    // ---- conflicts ----

    /// Record divergent document versions. Returns `None` when the versions
    /// are identical.
    pub async fn detect_conflict(
        &self,
        collection: &str,
        document_id: &str,
        source_region: &str,
        target_region: &str,
        source_version: serde_json::Value,
        target_version: serde_json::Value,
    ) -> Option<Conflict> {
        let conflict = {
            let mut state = self.state.lock().await;
            state.conflicts.detect(
                collection,
                document_id,
                source_region,
                target_region,
                source_version,
                target_version,
            )
        }?;
        self.emit(RegionEvent::ConflictDetected {
            conflict_id: conflict.id.clone(),
            collection: conflict.collection.clone(),
            document_id: conflict.document_id.clone(),
        });
        Some(conflict)
    }

    /// Resolve a conflict with an explicit strategy. Idempotent for a repeat
    /// of the identical resolution.
    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged: Option<serde_json::Value>,
    ) -> Result<Conflict, RegionError> {
        let (conflict, newly_resolved) = {
            let mut state = self.state.lock().await;
            state.conflicts.resolve(conflict_id, strategy, merged)?
        };
        if newly_resolved {
            self.emit(RegionEvent::ConflictResolved {
                conflict_id: conflict.id.clone(),
            });
        }
        Ok(conflict)
    }

    /// Every recorded conflict.
    pub async fn conflicts(&self) -> Vec<Conflict> {
        self.state.lock().await.conflicts.all().to_vec()
    }

    /// Conflicts awaiting resolution.
    pub async fn unresolved_conflicts(&self) -> Vec<Conflict> {
        self.state
            .lock()
            .await
            .conflicts
            .unresolved()
            .into_iter()
            .cloned()
            .collect()
    }

    // ---- health and failover ----

    /// Consume one health observation for a region.
    ///
    /// Debounces with consecutive counters; crossing the failover threshold on
    /// the primary triggers automatic failover when an active standby exists,
    /// and is reported as degradation otherwise.
    pub async fn record_region_health(&self, health: RegionHealth) -> Result<(), RegionError> {
        let region =
            self.store
                .get(&health.region_id)
                .await?
                .ok_or_else(|| RegionError::RegionUnknown {
                    region_id: health.region_id.clone(),
                })?;
        let healthy = health.status == HealthStatus::Healthy;

        enum Crossed {
            None,
            Unhealthy { failures: u32 },
            Recovered,
        }

        let crossed = {
            let mut state = self.state.lock().await;
            state
                .region_health
                .insert(region.id.clone(), health.clone());
            let hs = state.health.entry(region.id.clone()).or_default();
            hs.record(healthy);
            if !healthy
                && !hs.reported_unhealthy
                && hs.consecutive_failures >= self.config.failover_threshold
            {
                hs.reported_unhealthy = true;
                Crossed::Unhealthy {
                    failures: hs.consecutive_failures,
                }
            } else if healthy
                && hs.reported_unhealthy
                && hs.consecutive_successes >= self.config.recovery_threshold
            {
                hs.reported_unhealthy = false;
                Crossed::Recovered
            } else {
                Crossed::None
            }
        };

        match crossed {
            Crossed::None => {}
            Crossed::Unhealthy { failures } => {
                warn!(
                    region = %region.id,
                    consecutive_failures = failures,
                    "region crossed unhealthy threshold"
                );
                self.emit(RegionEvent::RegionUnhealthy {
                    region_id: region.id.clone(),
                    consecutive_failures: failures,
                });
                if region.status == RegionStatus::Active {
                    self.set_region_status(&region.id, RegionStatus::Degraded)
                        .await?;
                }
                if region.role == RegionRole::Primary {
                    let standby = self.store.list().await?.into_iter().find(|r| {
                        r.id != region.id
                            && r.role == RegionRole::Standby
                            && r.status == RegionStatus::Active
                    });
                    match standby {
                        Some(target) => {
                            // A failed automatic failover is reported through
                            // the event stream, not propagated to the health
                            // feed.
                            let _ = self
                                .initiate_failover(
                                    &region.id,
                                    &target.id,
                                    FailoverTrigger::Automatic,
                                    "consecutive failed health checks on primary",
                                )
                                .await;
                        }
                        None => {
                            warn!(
                                region = %region.id,
                                "primary unhealthy but no active standby, degradation reported only"
                            );
                        }
                    }
                }
            }
            Crossed::Recovered => {
                info!(region = %region.id, "region recovered");
                self.emit(RegionEvent::RegionRecovered {
                    region_id: region.id.clone(),
                });
                if let Some(current) = self.store.get(&region.id).await? {
                    if current.status == RegionStatus::Degraded {
                        self.set_region_status(&region.id, RegionStatus::Active)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Demote `from` and promote `to`.
    ///
    /// Steps apply in demote-before-promote order through the region store.
    /// If a step fails the record is marked `Failed` and roles reflect only
    /// the steps that completed; there is no automatic rollback, so the worst
    /// partial state is zero primaries, never two.
    pub async fn initiate_failover(
        &self,
        from: &str,
        to: &str,
        trigger: FailoverTrigger,
        reason: &str,
    ) -> Result<FailoverRecord, RegionError> {
        if from == to {
            return Err(RegionError::FailoverSelf {
                region_id: from.to_string(),
            });
        }
        let from_region =
            self.store
                .get(from)
                .await?
                .ok_or_else(|| RegionError::RegionUnknown {
                    region_id: from.to_string(),
                })?;
        let to_region = self
            .store
            .get(to)
            .await?
            .ok_or_else(|| RegionError::RegionUnknown {
                region_id: to.to_string(),
            })?;

        let started = Instant::now();
        let mut record = FailoverRecord {
            id: Uuid::new_v4().to_string(),
            trigger,
            from_region: from.to_string(),
            to_region: to.to_string(),
            reason: reason.to_string(),
            status: FailoverStatus::Initiated,
            started_at_ms: now_ms(),
            duration_ms: 0,
        };
        info!(
            failover = %record.id,
            from,
            to,
            ?trigger,
            reason,
            "failover initiated"
        );
        self.emit(RegionEvent::FailoverInitiated {
            failover_id: record.id.clone(),
            from_region: from.to_string(),
            to_region: to.to_string(),
        });

        let result = self.apply_failover_steps(&from_region, &to_region).await;
        record.duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                record.status = FailoverStatus::Completed;
                {
                    let mut state = self.state.lock().await;
                    state.failovers.push(record.clone());
                    state
                        .health
                        .entry(from_region.id.clone())
                        .or_default()
                        .failover_count += 1;
                }
                info!(
                    failover = %record.id,
                    duration_ms = record.duration_ms,
                    "failover completed"
                );
                self.emit(RegionEvent::FailoverCompleted {
                    failover_id: record.id.clone(),
                    from_region: from.to_string(),
                    to_region: to.to_string(),
                });
                Ok(record)
            }
            Err((step, source)) => {
                record.status = FailoverStatus::Failed;
                {
                    let mut state = self.state.lock().await;
                    state.failovers.push(record.clone());
                }
                let message = source.to_string();
                error!(
                    failover = %record.id,
                    step = %step,
                    %message,
                    "failover failed, roles reflect last completed step"
                );
                self.emit(RegionEvent::FailoverFailed {
                    failover_id: record.id.clone(),
                    from_region: from.to_string(),
                    to_region: to.to_string(),
                    reason: message.clone(),
                });
                Err(RegionError::FailoverFailed {
                    from: from.to_string(),
                    to: to.to_string(),
                    step,
                    message,
                })
            }
        }
    }

    async fn apply_failover_steps(
        &self,
        from_region: &RegionDefinition,
        to_region: &RegionDefinition,
    ) -> Result<(), (String, RegionError)> {
        self.store
            .set_role(&from_region.id, RegionRole::Standby)
            .await
            .map_err(|e| ("demote-role".to_string(), e))?;
        if from_region.role != RegionRole::Standby {
            self.emit(RegionEvent::RegionRoleChanged {
                region_id: from_region.id.clone(),
                from: from_region.role,
                to: RegionRole::Standby,
            });
        }

        self.store
            .set_status(&from_region.id, RegionStatus::Draining)
            .await
            .map_err(|e| ("demote-status".to_string(), e))?;
        if from_region.status != RegionStatus::Draining {
            self.emit(RegionEvent::RegionStatusChanged {
                region_id: from_region.id.clone(),
                from: from_region.status,
                to: RegionStatus::Draining,
            });
        }

        self.store
            .set_role(&to_region.id, RegionRole::Primary)
            .await
            .map_err(|e| ("promote-role".to_string(), e))?;
        if to_region.role != RegionRole::Primary {
            self.emit(RegionEvent::RegionRoleChanged {
                region_id: to_region.id.clone(),
                from: to_region.role,
                to: RegionRole::Primary,
            });
        }

        self.store
            .set_status(&to_region.id, RegionStatus::Active)
            .await
            .map_err(|e| ("promote-status".to_string(), e))?;
        if to_region.status != RegionStatus::Active {
            self.emit(RegionEvent::RegionStatusChanged {
                region_id: to_region.id.clone(),
                from: to_region.status,
                to: RegionStatus::Active,
            });
        }
        Ok(())
    }

    /// The failover audit trail, oldest first.
    pub async fn failover_history(&self) -> Vec<FailoverRecord> {
        self.state.lock().await.failovers.records()
    }

    /// The `n` most recent failovers, newest first.
    pub async fn recent_failovers(&self, n: usize) -> Vec<FailoverRecord> {
        self.state.lock().await.failovers.recent(n)
    }

    /// How many times each region has been demoted by a failover.
    pub async fn failover_counts(&self) -> HashMap<String, u64> {
        self.state
            .lock()
            .await
            .health
            .iter()
            .map(|(id, hs)| (id.clone(), hs.failover_count))
            .collect()
    }
}
