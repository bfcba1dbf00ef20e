//! Domain Ports - Boundaries to external collaborators
//!
//! The controller core depends only on these traits: a storage provider that
//! reports per-volume facts, and a record store holding the flat,
//! parent-linked layer records.

use crate::error::Result;
use crate::layer::{ResourceKey, StoragePoolKey};
use crate::persistence::record::{LayerRecord, ObjectCatalog, VolumeRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Storage Provider Facts
// =============================================================================

/// Raw facts about one backend object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderFacts {
    /// Whether the backend knows the object
    pub exists: bool,
    /// Device path, if the object is active
    #[serde(default)]
    pub path: Option<String>,
    /// Size reported by the backend
    #[serde(default)]
    pub size_kib: u64,
    /// Backend-specific attributes (volume group, pool, ...)
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Facts keyed by backend identifier
pub type FactsMap = BTreeMap<String, ProviderFacts>;

/// Capacity of a storage pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeSpace {
    pub capacity_kib: u64,
    pub free_kib: u64,
}

/// Request to create or resize a backend object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub identifier: String,
    pub pool: StoragePoolKey,
    pub size_kib: u64,
}

// =============================================================================
// Storage Provider Adapter Port
// =============================================================================

/// Port for a concrete storage backend
///
/// Mutating operations may fail transiently; callers wrap adapters in
/// [`crate::storage::RetryingAdapter`] to get bounded retries.
#[async_trait]
pub trait StorageProviderAdapter: Send + Sync {
    /// Query facts for a set of identifiers; unknown identifiers are omitted
    async fn get_facts(&self, identifiers: &BTreeSet<String>) -> Result<FactsMap>;

    /// Capacity and free space of a pool
    async fn get_free_space(&self, pool: &StoragePoolKey) -> Result<FreeSpace>;

    async fn create(&self, spec: &VolumeSpec) -> Result<()>;

    async fn resize(&self, spec: &VolumeSpec) -> Result<()>;

    async fn delete(&self, identifier: &str) -> Result<()>;

    async fn activate(&self, identifier: &str) -> Result<()>;

    async fn deactivate(&self, identifier: &str) -> Result<()>;

    /// Get backend name
    fn backend_name(&self) -> &str;
}

// =============================================================================
// Record Store Port
// =============================================================================

/// Port for the flat record persistence driver
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Owning objects: resource definitions, resources, storage pools
    async fn load_catalog(&self) -> Result<ObjectCatalog>;

    async fn load_layer_records(&self) -> Result<Vec<LayerRecord>>;

    async fn load_volume_records(&self) -> Result<Vec<VolumeRecord>>;

    /// Replace all layer and volume rows owned by one resource
    async fn save_resource(
        &self,
        key: &ResourceKey,
        layers: Vec<LayerRecord>,
        volumes: Vec<VolumeRecord>,
    ) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type StorageProviderAdapterRef = Arc<dyn StorageProviderAdapter>;
pub type RecordStoreRef = Arc<dyn RecordStore>;
