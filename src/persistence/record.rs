//! Persisted Records
//!
//! Flat, parent-linked rows as the persistence driver stores them. Kind
//! discriminators stay strings here so that unknown values reach the loader
//! and are rejected there.

use crate::layer::{
    AttributeFields, ReplicationNodeData, ResourceDefinition, ResourceKey, StoragePool,
};
use serde::{Deserialize, Serialize};

// =============================================================================
// Layer Records
// =============================================================================

/// One layer node row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub id: u64,
    #[serde(default)]
    pub parent_id: Option<u64>,
    /// Layer kind discriminator
    pub kind: String,
    #[serde(default)]
    pub suffix: String,
    pub owner: ResourceKey,
    #[serde(default)]
    pub suspended: bool,
    /// Present only on replication rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication: Option<ReplicationNodeData>,
}

/// Kind-specific part of a volume row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolumePayloadRecord {
    Replication {
        #[serde(default)]
        meta_disk_path: Option<String>,
    },
    Encryption {
        #[serde(default)]
        backing_device: Option<String>,
        #[serde(default)]
        opened: bool,
    },
    RemoteAttach,
    Storage {
        /// Provider kind discriminator
        provider: String,
        storage_pool: String,
        #[serde(default)]
        exists: bool,
        #[serde(flatten)]
        attributes: AttributeFields,
    },
}

/// One volume row, linked to its layer row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub layer_id: u64,
    pub volume_number: u32,
    pub expected_size_kib: u64,
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub allocated_size_kib: Option<u64>,
    #[serde(default)]
    pub usable_size_kib: Option<u64>,
    #[serde(default)]
    pub disk_state: Option<String>,
    pub payload: VolumePayloadRecord,
}

// =============================================================================
// Object Catalog
// =============================================================================

/// One resource row; the definition is referenced by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub key: ResourceKey,
    pub definition: String,
}

/// Owning objects the layer rows refer to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCatalog {
    #[serde(default)]
    pub definitions: Vec<ResourceDefinition>,
    #[serde(default)]
    pub resources: Vec<ResourceRecord>,
    #[serde(default)]
    pub storage_pools: Vec<StoragePool>,
}

/// Whole persisted state as one document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDocument {
    #[serde(default)]
    pub catalog: ObjectCatalog,
    #[serde(default)]
    pub layers: Vec<LayerRecord>,
    #[serde(default)]
    pub volumes: Vec<VolumeRecord>,
}

impl RecordDocument {
    /// Replace every layer and volume row owned by `key`
    pub fn replace_resource(
        &mut self,
        key: &ResourceKey,
        layers: Vec<LayerRecord>,
        volumes: Vec<VolumeRecord>,
    ) {
        let owned: std::collections::HashSet<u64> = self
            .layers
            .iter()
            .filter(|record| &record.owner == key)
            .map(|record| record.id)
            .collect();
        self.layers.retain(|record| &record.owner != key);
        self.volumes.retain(|record| !owned.contains(&record.layer_id));
        self.layers.extend(layers);
        self.volumes.extend(volumes);
    }
}
