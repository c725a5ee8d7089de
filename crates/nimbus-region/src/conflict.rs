//! Conflict log for divergent cross-region writes.
//!
//! A conflict is recorded divergence, not an error. Resolution is always
//! explicit: the caller names a strategy (and a merged value for merges) and
//! the chosen value is recorded. Resolved conflicts are immutable history;
//! re-resolving with the identical resolution is idempotent, anything else is
//! rejected.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::error::RegionError;

/// How a conflict gets resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Keep the source region's version.
    SourceWins,
    /// Keep the target region's version.
    TargetWins,
    /// Keep an explicitly supplied merged value.
    Merge,
}

/// Divergent versions of one document across two regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub id: String,
    /// Collection holding the document.
    pub collection: String,
    /// Document id.
    pub document_id: String,
    /// Region holding `source_version`.
    pub source_region: String,
    /// Region holding `target_version`.
    pub target_region: String,
    /// The source region's version of the document.
    pub source_version: serde_json::Value,
    /// The target region's version of the document.
    pub target_version: serde_json::Value,
    /// When the divergence was recorded (ms since epoch).
    pub detected_at_ms: u64,
    /// The strategy used to resolve, once resolved.
    pub resolution: Option<ResolutionStrategy>,
    /// The value chosen by the resolution, once resolved.
    pub resolved_value: Option<serde_json::Value>,
    /// When the conflict was resolved (ms since epoch).
    pub resolved_at_ms: Option<u64>,
}

impl Conflict {
    /// Whether the conflict has been resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }
}

/// Append-only log of conflicts.
///
/// Not internally synchronized: the owning manager is the lock boundary.
#[derive(Debug, Default)]
pub struct ConflictLog {
    conflicts: Vec<Conflict>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl ConflictLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record divergence between two versions of a document. Returns `None`
    /// when the versions are identical (nothing diverged).
    #[allow(clippy::too_many_arguments)]
    pub fn detect(
        &mut self,
        collection: &str,
        document_id: &str,
        source_region: &str,
        target_region: &str,
        source_version: serde_json::Value,
        target_version: serde_json::Value,
    ) -> Option<Conflict> {
        if source_version == target_version {
            return None;
        }
        let conflict = Conflict {
            id: Uuid::new_v4().to_string(),
            collection: collection.to_string(),
            document_id: document_id.to_string(),
            source_region: source_region.to_string(),
            target_region: target_region.to_string(),
            source_version,
            target_version,
            detected_at_ms: now_ms(),
            resolution: None,
            resolved_value: None,
            resolved_at_ms: None,
        };
        warn!(
            conflict_id = %conflict.id,
            collection,
            document_id,
            source_region,
            target_region,
            "divergent document versions recorded"
        );
        self.conflicts.push(conflict.clone());
        Some(conflict)
    }

    /// Resolve a conflict with an explicit strategy.
    ///
    /// `merged` is required for [`ResolutionStrategy::Merge`] and ignored
    /// otherwise. Returns the resolved record and whether this call performed
    /// the resolution (false for an idempotent repeat).
    pub fn resolve(
        &mut self,
        conflict_id: &str,
        strategy: ResolutionStrategy,
        merged: Option<serde_json::Value>,
    ) -> Result<(Conflict, bool), RegionError> {
        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.id == conflict_id)
            .ok_or_else(|| RegionError::ConflictUnknown {
                conflict_id: conflict_id.to_string(),
            })?;

        let value = match strategy {
            ResolutionStrategy::SourceWins => conflict.source_version.clone(),
            ResolutionStrategy::TargetWins => conflict.target_version.clone(),
            ResolutionStrategy::Merge => merged.ok_or(RegionError::MergeValueMissing)?,
        };

        if let Some(existing) = conflict.resolution {
            // Immutable once resolved: only the identical resolution is
            // accepted again, and it changes nothing.
            if existing == strategy && conflict.resolved_value.as_ref() == Some(&value) {
                return Ok((conflict.clone(), false));
            }
            return Err(RegionError::ConflictResolved {
                conflict_id: conflict_id.to_string(),
            });
        }

        conflict.resolution = Some(strategy);
        conflict.resolved_value = Some(value);
        conflict.resolved_at_ms = Some(now_ms());
        Ok((conflict.clone(), true))
    }

    /// Fetch one conflict.
    pub fn get(&self, conflict_id: &str) -> Option<&Conflict> {
        self.conflicts.iter().find(|c| c.id == conflict_id)
    }

    /// Every recorded conflict, oldest first.
    pub fn all(&self) -> &[Conflict] {
        &self.conflicts
    }

    /// Conflicts still awaiting resolution.
    pub fn unresolved(&self) -> Vec<&Conflict> {
        self.conflicts.iter().filter(|c| !c.is_resolved()).collect()
    }

    /// Conflicts recorded for one document.
    pub fn for_document(&self, collection: &str, document_id: &str) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|c| c.collection == collection && c.document_id == document_id)
            .collect()
    }

    /// Total conflicts recorded.
    pub fn len(&self) -> usize {
        self.conflicts.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.conflicts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn detect(log: &mut ConflictLog) -> Conflict {
        log.detect(
            "orders",
            "order-1",
            "us-east",
            "eu-west",
            json!({"total": 10}),
            json!({"total": 12}),
        )
        .unwrap()
    }

    #[test]
    fn identical_versions_are_not_a_conflict() {
        let mut log = ConflictLog::new();
        let result = log.detect(
            "orders",
            "order-1",
            "us-east",
            "eu-west",
            json!({"total": 10}),
            json!({"total": 10}),
        );
        assert!(result.is_none());
        assert!(log.is_empty());
    }

    #[test]
    fn detect_records_unresolved_conflict() {
        let mut log = ConflictLog::new();
        let conflict = detect(&mut log);
        assert!(!conflict.is_resolved());
        assert_eq!(log.len(), 1);
        assert_eq!(log.unresolved().len(), 1);
        assert_eq!(log.for_document("orders", "order-1").len(), 1);
    }

    #[test]
    fn source_wins_resolution() {
        let mut log = ConflictLog::new();
        let conflict = detect(&mut log);

        let (resolved, newly) = log
            .resolve(&conflict.id, ResolutionStrategy::SourceWins, None)
            .unwrap();
        assert!(newly);
        assert_eq!(resolved.resolved_value, Some(json!({"total": 10})));
        assert!(resolved.resolved_at_ms.is_some());
        assert!(log.unresolved().is_empty());
    }

    #[test]
    fn target_wins_resolution() {
        let mut log = ConflictLog::new();
        let conflict = detect(&mut log);

        let (resolved, _) = log
            .resolve(&conflict.id, ResolutionStrategy::TargetWins, None)
            .unwrap();
        assert_eq!(resolved.resolved_value, Some(json!({"total": 12})));
    }

    #[test]
    fn merge_requires_explicit_value() {
        let mut log = ConflictLog::new();
        let conflict = detect(&mut log);

        assert!(matches!(
            log.resolve(&conflict.id, ResolutionStrategy::Merge, None),
            Err(RegionError::MergeValueMissing)
        ));

        let (resolved, _) = log
            .resolve(
                &conflict.id,
                ResolutionStrategy::Merge,
                Some(json!({"total": 11})),
            )
            .unwrap();
        assert_eq!(resolved.resolved_value, Some(json!({"total": 11})));
    }

    #[test]
    fn repeat_resolution_is_idempotent() {
        let mut log = ConflictLog::new();
        let conflict = detect(&mut log);

        let (first, newly_first) = log
            .resolve(&conflict.id, ResolutionStrategy::SourceWins, None)
            .unwrap();
        let (second, newly_second) = log
            .resolve(&conflict.id, ResolutionStrategy::SourceWins, None)
            .unwrap();

        assert!(newly_first);
        assert!(!newly_second);
        assert_eq!(first.resolved_value, second.resolved_value);
        assert_eq!(first.resolved_at_ms, second.resolved_at_ms);
    }

    #[test]
    fn conflicting_re_resolution_is_rejected() {
        let mut log = ConflictLog::new();
        let conflict = detect(&mut log);

        log.resolve(&conflict.id, ResolutionStrategy::SourceWins, None)
            .unwrap();
        assert!(matches!(
            log.resolve(&conflict.id, ResolutionStrategy::TargetWins, None),
            Err(RegionError::ConflictResolved { .. })
        ));

        // History is unchanged by the rejected attempt.
        let stored = log.get(&conflict.id).unwrap();
        assert_eq!(stored.resolution, Some(ResolutionStrategy::SourceWins));
        assert_eq!(stored.resolved_value, Some(json!({"total": 10})));
    }

    #[test]
    fn unknown_conflict_errors() {
        let mut log = ConflictLog::new();
        assert!(matches!(
            log.resolve("ghost", ResolutionStrategy::SourceWins, None),
            Err(RegionError::ConflictUnknown { .. })
        ));
    }

    #[test]
    fn conflicts_accumulate_per_document() {
        let mut log = ConflictLog::new();
        detect(&mut log);
        detect(&mut log);
        log.detect(
            "orders",
            "order-2",
            "us-east",
            "eu-west",
            json!(1),
            json!(2),
        );

        assert_eq!(log.len(), 3);
        assert_eq!(log.for_document("orders", "order-1").len(), 2);
        assert_eq!(log.for_document("orders", "order-2").len(), 1);
    }
}
