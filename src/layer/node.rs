//! Layer Nodes and Volume Leaves
//!
//! A [`LayerNode`] is one device layer of a resource's stack; each node owns
//! one [`VolumeLeaf`] per volume. Controller-authored configuration and
//! satellite-observed facts live in separate fields and are never mixed.

use super::kind::{AttributeFamily, LayerKind, ProviderKind};
use crate::storage::size::SizeState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Layer Node ID
// =============================================================================

/// Surrogate id of a layer node, unique across all resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LayerNodeId(pub u64);

impl std::fmt::Display for LayerNodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for LayerNodeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

// =============================================================================
// Node Payload
// =============================================================================

/// Per-node replication settings (controller-authored)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationNodeData {
    /// Replication node id of this peer
    pub node_id: u32,
    pub peer_slots: u16,
    pub al_stripes: u32,
    pub al_stripe_size_kib: u64,
}

/// Kind-specific node payload; the node's kind is derived from it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodePayload {
    Replication(ReplicationNodeData),
    Encryption,
    RemoteAttach,
    Storage,
}

impl NodePayload {
    pub fn kind(&self) -> LayerKind {
        match self {
            NodePayload::Replication(_) => LayerKind::Replication,
            NodePayload::Encryption => LayerKind::Encryption,
            NodePayload::RemoteAttach => LayerKind::RemoteAttach,
            NodePayload::Storage => LayerKind::Storage,
        }
    }
}

// =============================================================================
// Volume Facts
// =============================================================================

/// Physical facts observed by the satellite, common to all layer kinds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeFacts {
    pub device_path: Option<String>,
    pub allocated_size_kib: Option<u64>,
    pub usable_size_kib: Option<u64>,
    pub disk_state: Option<String>,
}

/// Kind-specific attributes reported by a storage provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAttributes {
    None,
    Lvm {
        volume_group: Option<String>,
        thin_pool: Option<String>,
    },
    Zfs {
        zpool: Option<String>,
        extent_size_kib: Option<u64>,
    },
    File {
        backing_file: Option<String>,
    },
    Spdk {
        lvol_store: Option<String>,
    },
}

/// Flat form of [`ProviderAttributes`] used in records and reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thin_pool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zpool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent_size_kib: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lvol_store: Option<String>,
}

impl ProviderAttributes {
    /// Empty attribute set for a provider kind
    pub fn empty_for(provider: ProviderKind) -> Self {
        Self::from_fields(provider, &AttributeFields::default())
    }

    /// Pick the fields relevant to the provider's attribute family
    pub fn from_fields(provider: ProviderKind, fields: &AttributeFields) -> Self {
        match provider.attribute_family() {
            AttributeFamily::None => ProviderAttributes::None,
            AttributeFamily::Lvm => ProviderAttributes::Lvm {
                volume_group: fields.volume_group.clone(),
                thin_pool: fields.thin_pool.clone(),
            },
            AttributeFamily::Zfs => ProviderAttributes::Zfs {
                zpool: fields.zpool.clone(),
                extent_size_kib: fields.extent_size_kib,
            },
            AttributeFamily::File => ProviderAttributes::File {
                backing_file: fields.backing_file.clone(),
            },
            AttributeFamily::Spdk => ProviderAttributes::Spdk {
                lvol_store: fields.lvol_store.clone(),
            },
        }
    }

    pub fn to_fields(&self) -> AttributeFields {
        let mut fields = AttributeFields::default();
        match self {
            ProviderAttributes::None => {}
            ProviderAttributes::Lvm {
                volume_group,
                thin_pool,
            } => {
                fields.volume_group = volume_group.clone();
                fields.thin_pool = thin_pool.clone();
            }
            ProviderAttributes::Zfs {
                zpool,
                extent_size_kib,
            } => {
                fields.zpool = zpool.clone();
                fields.extent_size_kib = *extent_size_kib;
            }
            ProviderAttributes::File { backing_file } => {
                fields.backing_file = backing_file.clone();
            }
            ProviderAttributes::Spdk { lvol_store } => {
                fields.lvol_store = lvol_store.clone();
            }
        }
        fields
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationVolumeData {
    pub meta_disk_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionVolumeData {
    pub backing_device: Option<String>,
    pub opened: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVolumeData {
    pub provider: ProviderKind,
    /// Storage pool on the owning node (controller-authored)
    pub storage_pool: String,
    pub attributes: ProviderAttributes,
    /// Whether the backend reported a matching object
    pub exists: bool,
    /// Recomputed on every pass, never persisted
    pub size_state: Option<SizeState>,
}

/// Kind-specific volume payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeData {
    Replication(ReplicationVolumeData),
    Encryption(EncryptionVolumeData),
    RemoteAttach,
    Storage(StorageVolumeData),
}

impl VolumeData {
    pub fn kind(&self) -> LayerKind {
        match self {
            VolumeData::Replication(_) => LayerKind::Replication,
            VolumeData::Encryption(_) => LayerKind::Encryption,
            VolumeData::RemoteAttach => LayerKind::RemoteAttach,
            VolumeData::Storage(_) => LayerKind::Storage,
        }
    }
}

// =============================================================================
// Volume Leaf
// =============================================================================

/// One volume's payload within a layer node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLeaf {
    pub volume_number: u32,
    /// Desired size, authored by the controller
    pub expected_size_kib: u64,
    /// Actual state, observed by the satellite
    pub facts: VolumeFacts,
    pub data: VolumeData,
}

impl VolumeLeaf {
    pub fn new(volume_number: u32, expected_size_kib: u64, data: VolumeData) -> Self {
        Self {
            volume_number,
            expected_size_kib,
            facts: VolumeFacts::default(),
            data,
        }
    }

    pub fn storage(&self) -> Option<&StorageVolumeData> {
        match &self.data {
            VolumeData::Storage(data) => Some(data),
            _ => None,
        }
    }
}

// =============================================================================
// Layer Node
// =============================================================================

/// One node in a resource's layer stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerNode {
    pub id: LayerNodeId,
    /// Weak back-reference; `None` for roots
    pub parent: Option<LayerNodeId>,
    /// Owned children, stored in the same arena
    pub children: Vec<LayerNodeId>,
    pub suffix: String,
    pub suspended: bool,
    pub payload: NodePayload,
    pub volumes: BTreeMap<u32, VolumeLeaf>,
}

impl LayerNode {
    /// Create a detached node with no children and no volumes
    pub fn new(id: LayerNodeId, suffix: impl Into<String>, payload: NodePayload) -> Self {
        Self {
            id,
            parent: None,
            children: Vec::new(),
            suffix: suffix.into(),
            suspended: false,
            payload,
            volumes: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> LayerKind {
        self.payload.kind()
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn volume(&self, volume_number: u32) -> Option<&VolumeLeaf> {
        self.volumes.get(&volume_number)
    }
}
