//! Cross-region replication queues.
//!
//! Writes fan out as [`SyncOperation`]s to a per-target queue. A periodic flush
//! drains up to `batch_size` operations per target and marks them sent; the
//! target acknowledges to complete them. The actual wire transport is injected
//! by the caller, which hands each [`SyncBatch`] to its channel of choice.

use std::collections::{HashMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One replicated write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Operation id.
    pub id: String,
    /// Region the write originated in.
    pub source_region: String,
    /// Collection holding the document.
    pub collection: String,
    /// Document id.
    pub document_id: String,
    /// When the write happened (ms since epoch).
    pub timestamp_ms: u64,
    /// The written value.
    pub payload: serde_json::Value,
}

impl SyncOperation {
    /// Create an operation stamped with a fresh id and the current time.
    pub fn new(
        source_region: impl Into<String>,
        collection: impl Into<String>,
        document_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_region: source_region.into(),
            collection: collection.into(),
            document_id: document_id.into(),
            timestamp_ms: now_ms(),
            payload,
        }
    }

    /// Size of the serialized payload in bytes.
    pub fn payload_bytes(&self) -> u64 {
        serde_json::to_vec(&self.payload)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }
}

/// A flushed batch ready to hand to the replication transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Region the batch is destined for.
    pub target_region: String,
    /// Operations in send order.
    pub operations: Vec<SyncOperation>,
}

/// Replication state for one ordered (source, target) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationStatus {
    /// Source region.
    pub source_region: String,
    /// Target region.
    pub target_region: String,
    /// Lag observed at the last flush, in milliseconds.
    pub lag_ms: u64,
    /// Operations enqueued or sent but not yet acknowledged.
    pub pending_operations: usize,
    /// Bytes acknowledged so far.
    pub bytes_replicated: u64,
    /// When the target last acknowledged a batch (ms since epoch).
    pub last_synced_ms: Option<u64>,
    /// Acknowledgements for unknown operation ids.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct PairStats {
    lag_ms: u64,
    bytes_replicated: u64,
    last_synced_ms: Option<u64>,
    errors: u64,
}

#[derive(Debug, Default)]
struct TargetState {
    pending: VecDeque<SyncOperation>,
    sent: HashMap<String, SyncOperation>,
}

/// Per-target queues with batch flush, acknowledgement, and lag accounting.
///
/// Not internally synchronized: the owning [`MultiRegionManager`](crate::MultiRegionManager)
/// is the lock boundary.
#[derive(Debug)]
pub struct ReplicationQueue {
    batch_size: usize,
    targets: HashMap<String, TargetState>,
    pairs: HashMap<(String, String), PairStats>,
    /// Lag samples observed since the last drain, as (source, target, lag_ms).
    lag_samples: Vec<(String, String, u64)>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ReplicationQueue {
    /// Create a queue that flushes up to `batch_size` operations per target.
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            targets: HashMap::new(),
            pairs: HashMap::new(),
            lag_samples: Vec::new(),
        }
    }

    /// Enqueue one operation for one target region.
    pub fn enqueue(&mut self, target_region: &str, op: SyncOperation) {
        self.pairs
            .entry((op.source_region.clone(), target_region.to_string()))
            .or_default();
        self.targets
            .entry(target_region.to_string())
            .or_default()
            .pending
            .push_back(op);
    }

    /// Drop a target's queues and pair stats, e.g. when the region is removed.
    pub fn remove_target(&mut self, target_region: &str) {
        self.targets.remove(target_region);
        self.pairs.retain(|(_, target), _| target != target_region);
    }

    /// Operations enqueued or in flight for a target.
    pub fn pending_count(&self, target_region: &str) -> usize {
        self.targets
            .get(target_region)
            .map(|t| t.pending.len() + t.sent.len())
            .unwrap_or(0)
    }

    /// Flush up to `batch_size` operations for one target, marking them sent
    /// and recording per-source lag from the oldest operation in the batch.
    pub fn flush_target(&mut self, target_region: &str) -> Option<SyncBatch> {
        let state = self.targets.get_mut(target_region)?;
        if state.pending.is_empty() {
            return None;
        }

        let now = now_ms();
        let mut operations = Vec::new();
        let mut oldest_per_source: HashMap<String, u64> = HashMap::new();

        while operations.len() < self.batch_size {
            let Some(op) = state.pending.pop_front() else {
                break;
            };
            let oldest = oldest_per_source
                .entry(op.source_region.clone())
                .or_insert(op.timestamp_ms);
            if op.timestamp_ms < *oldest {
                *oldest = op.timestamp_ms;
            }
            state.sent.insert(op.id.clone(), op.clone());
            operations.push(op);
        }

        for (source, oldest_ms) in oldest_per_source {
            let lag_ms = now.saturating_sub(oldest_ms);
            let stats = self
                .pairs
                .entry((source.clone(), target_region.to_string()))
                .or_default();
            stats.lag_ms = lag_ms;
            self.lag_samples
                .push((source, target_region.to_string(), lag_ms));
        }

        Some(SyncBatch {
            target_region: target_region.to_string(),
            operations,
        })
    }

    /// Flush every target with pending operations.
    pub fn flush_all(&mut self) -> Vec<SyncBatch> {
        let mut targets: Vec<String> = self
            .targets
            .iter()
            .filter(|(_, s)| !s.pending.is_empty())
            .map(|(t, _)| t.clone())
            .collect();
        targets.sort();
        targets
            .into_iter()
            .filter_map(|t| self.flush_target(&t))
            .collect()
    }

    /// Acknowledge sent operations, removing them and crediting the pair's
    /// byte counter. Unknown ids count as errors. Returns how many operations
    /// were completed.
    pub fn acknowledge(&mut self, target_region: &str, op_ids: &[String]) -> usize {
        let now = now_ms();
        let Some(state) = self.targets.get_mut(target_region) else {
            return 0;
        };
        let mut acked = 0;
        for id in op_ids {
            match state.sent.remove(id) {
                Some(op) => {
                    acked += 1;
                    let stats = self
                        .pairs
                        .entry((op.source_region.clone(), target_region.to_string()))
                        .or_default();
                    stats.bytes_replicated += op.payload_bytes();
                    stats.last_synced_ms = Some(now);
                }
                None => {
                    // Ack for an id we never sent (or already completed).
                    for stats in self
                        .pairs
                        .iter_mut()
                        .filter(|((_, target), _)| target == target_region)
                        .map(|(_, s)| s)
                    {
                        stats.errors += 1;
                    }
                }
            }
        }
        acked
    }

    /// Take the lag samples recorded since the last call.
    pub fn drain_lag_samples(&mut self) -> Vec<(String, String, u64)> {
        std::mem::take(&mut self.lag_samples)
    }

    /// Status snapshot for every known (source, target) pair.
    pub fn statuses(&self) -> Vec<ReplicationStatus> {
        let mut statuses: Vec<ReplicationStatus> = self
            .pairs
            .iter()
            .map(|((source, target), stats)| {
                let pending = self
                    .targets
                    .get(target)
                    .map(|t| {
                        t.pending
                            .iter()
                            .filter(|op| &op.source_region == source)
                            .count()
                            + t.sent
                                .values()
                                .filter(|op| &op.source_region == source)
                                .count()
                    })
                    .unwrap_or(0);
                ReplicationStatus {
                    source_region: source.clone(),
                    target_region: target.clone(),
                    lag_ms: stats.lag_ms,
                    pending_operations: pending,
                    bytes_replicated: stats.bytes_replicated,
                    last_synced_ms: stats.last_synced_ms,
                    errors: stats.errors,
                }
            })
            .collect();
        statuses.sort_by(|a, b| {
            (&a.source_region, &a.target_region).cmp(&(&b.source_region, &b.target_region))
        });
        statuses
    }
}
