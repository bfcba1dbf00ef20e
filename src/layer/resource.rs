//! Resources and Their Owning Objects
//!
//! A [`Resource`] is one (node, resource[, snapshot]) instance together with
//! its layer tree. Definition-level replication settings are shared by every
//! instance of a resource definition and are read-only here.

use super::kind::{LayerKind, ProviderKind};
use super::tree::LayerTree;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

// =============================================================================
// Keys
// =============================================================================

/// Owning node/resource/snapshot key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    pub node_name: String,
    pub resource_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
}

impl ResourceKey {
    pub fn new(node_name: impl Into<String>, resource_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            resource_name: resource_name.into(),
            snapshot_name: None,
        }
    }

    pub fn snapshot(
        node_name: impl Into<String>,
        resource_name: impl Into<String>,
        snapshot_name: impl Into<String>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            resource_name: resource_name.into(),
            snapshot_name: Some(snapshot_name.into()),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.snapshot_name {
            Some(snapshot) => write!(f, "{}/{}@{}", self.node_name, self.resource_name, snapshot),
            None => write!(f, "{}/{}", self.node_name, self.resource_name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StoragePoolKey {
    pub node_name: String,
    pub pool_name: String,
}

impl StoragePoolKey {
    pub fn new(node_name: impl Into<String>, pool_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            pool_name: pool_name.into(),
        }
    }
}

impl std::fmt::Display for StoragePoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node_name, self.pool_name)
    }
}

// =============================================================================
// Storage Pool
// =============================================================================

/// Storage pool on one node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePool {
    pub key: StoragePoolKey,
    pub provider: ProviderKind,
    /// Allocation granularity of the backend
    pub extent_size_kib: u64,
    #[serde(default)]
    pub capacity_kib: u64,
    #[serde(default)]
    pub free_kib: u64,
}

/// Storage pools by key
pub type StoragePoolIndex = BTreeMap<StoragePoolKey, StoragePool>;

// =============================================================================
// Resource Definition
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationVolumeDefinition {
    pub minor: u32,
}

/// Definition-level replication configuration for one suffix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationDefinition {
    pub port: u16,
    pub secret: String,
    pub transport: String,
    pub peer_slots: u16,
    pub al_stripes: u32,
    #[serde(default)]
    pub volumes: BTreeMap<u32, ReplicationVolumeDefinition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub name: String,
    /// Replication definitions keyed by resource-name suffix
    #[serde(default)]
    pub replication: BTreeMap<String, ReplicationDefinition>,
}

impl ResourceDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replication: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Stack Metadata
// =============================================================================

/// Derived, non-persisted description of a loaded stack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackMetadata {
    /// Kinds along the first root's leftmost descendant chain
    pub layer_stack: Vec<LayerKind>,
    /// True when no storage volume has a backing object
    pub diskless: bool,
    pub volume_numbers: BTreeSet<u32>,
}

impl StackMetadata {
    pub fn derive(tree: &LayerTree) -> Self {
        let mut layer_stack = Vec::new();
        let mut cursor = tree.roots().first().and_then(|id| tree.get(*id));
        while let Some(node) = cursor {
            layer_stack.push(node.kind());
            cursor = node.children.first().and_then(|id| tree.get(*id));
        }

        let diskless = !tree.storage_volumes().any(|(_, leaf)| {
            leaf.storage()
                .is_some_and(|storage| storage.provider.has_backing_object())
        });

        let volume_numbers = tree
            .iter()
            .flat_map(|node| node.volumes.keys().copied())
            .collect();

        Self {
            layer_stack,
            diskless,
            volume_numbers,
        }
    }
}

// =============================================================================
// Resource
// =============================================================================

/// One resource instance and its layer tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub key: ResourceKey,
    pub definition: Arc<ResourceDefinition>,
    pub tree: LayerTree,
    pub metadata: StackMetadata,
}

impl Resource {
    pub fn new(key: ResourceKey, definition: Arc<ResourceDefinition>) -> Self {
        Self {
            key,
            definition,
            tree: LayerTree::new(),
            metadata: StackMetadata::default(),
        }
    }

    pub fn refresh_metadata(&mut self) {
        self.metadata = StackMetadata::derive(&self.tree);
    }
}
