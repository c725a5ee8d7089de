//! Storage seam for the region table.
//!
//! All region mutation performed by the manager goes through [`RegionStore`],
//! so a durable backend can replace [`MemoryRegionStore`] without touching the
//! coordination logic.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::RegionError;
use crate::types::{RegionDefinition, RegionRole, RegionStatus};

/// Backend holding the region table.
#[async_trait]
pub trait RegionStore: Send + Sync {
    /// Insert or replace a region.
    async fn upsert(&self, region: RegionDefinition) -> Result<(), RegionError>;

    /// Remove a region, returning it if present.
    async fn remove(&self, region_id: &str) -> Result<Option<RegionDefinition>, RegionError>;

    /// Fetch one region.
    async fn get(&self, region_id: &str) -> Result<Option<RegionDefinition>, RegionError>;

    /// List every region.
    async fn list(&self) -> Result<Vec<RegionDefinition>, RegionError>;

    /// Change a region's role.
    async fn set_role(&self, region_id: &str, role: RegionRole) -> Result<(), RegionError>;

    /// Change a region's status.
    async fn set_status(&self, region_id: &str, status: RegionStatus) -> Result<(), RegionError>;
}

/// In-memory region store.
#[derive(Default)]
pub struct MemoryRegionStore {
    regions: RwLock<HashMap<String, RegionDefinition>>,
}

impl MemoryRegionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RegionStore for MemoryRegionStore {
    async fn upsert(&self, region: RegionDefinition) -> Result<(), RegionError> {
        self.regions
            .write()
            .await
            .insert(region.id.clone(), region);
        Ok(())
    }

    async fn remove(&self, region_id: &str) -> Result<Option<RegionDefinition>, RegionError> {
        Ok(self.regions.write().await.remove(region_id))
    }

    async fn get(&self, region_id: &str) -> Result<Option<RegionDefinition>, RegionError> {
        Ok(self.regions.read().await.get(region_id).cloned())
    }

    async fn list(&self) -> Result<Vec<RegionDefinition>, RegionError> {
        let mut regions: Vec<RegionDefinition> =
            self.regions.read().await.values().cloned().collect();
        regions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(regions)
    }

    async fn set_role(&self, region_id: &str, role: RegionRole) -> Result<(), RegionError> {
        let mut regions = self.regions.write().await;
        let region = regions
            .get_mut(region_id)
            .ok_or_else(|| RegionError::RegionUnknown {
                region_id: region_id.to_string(),
            })?;
        region.role = role;
        Ok(())
    }

    async fn set_status(&self, region_id: &str, status: RegionStatus) -> Result<(), RegionError> {
        let mut regions = self.regions.write().await;
        let region = regions
            .get_mut(region_id)
            .ok_or_else(|| RegionError::RegionUnknown {
                region_id: region_id.to_string(),
            })?;
        region.status = status;
        Ok(())
    }
}
