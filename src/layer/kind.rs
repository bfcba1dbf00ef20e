//! Layer and Provider Kinds
//!
//! Closed sets of device-layer kinds and storage-provider kinds. Both the
//! loader and the merge engine match on these exhaustively.

use serde::{Deserialize, Serialize};

// =============================================================================
// Layer Kind
// =============================================================================

/// Device-layer kind of a node in a resource's layer stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LayerKind {
    Replication,
    Encryption,
    RemoteAttach,
    Storage,
}

impl LayerKind {
    /// All kinds, in stack order (top to bottom)
    pub const ALL: [LayerKind; 4] = [
        LayerKind::Replication,
        LayerKind::Encryption,
        LayerKind::RemoteAttach,
        LayerKind::Storage,
    ];

    /// Persisted discriminator
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Replication => "REPLICATION",
            LayerKind::Encryption => "ENCRYPTION",
            LayerKind::RemoteAttach => "REMOTE_ATTACH",
            LayerKind::Storage => "STORAGE",
        }
    }

    /// Parse a persisted or reported discriminator
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "REPLICATION" => Some(LayerKind::Replication),
            "ENCRYPTION" => Some(LayerKind::Encryption),
            "REMOTE_ATTACH" => Some(LayerKind::RemoteAttach),
            "STORAGE" => Some(LayerKind::Storage),
            _ => None,
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Provider Kind
// =============================================================================

/// Storage-provider kind backing a storage-layer volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
    FileThin,
    Spdk,
    RemoteSpdk,
}

/// Attribute family shared by related provider kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeFamily {
    None,
    Lvm,
    Zfs,
    File,
    Spdk,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        ProviderKind::Diskless,
        ProviderKind::Lvm,
        ProviderKind::LvmThin,
        ProviderKind::Zfs,
        ProviderKind::ZfsThin,
        ProviderKind::File,
        ProviderKind::FileThin,
        ProviderKind::Spdk,
        ProviderKind::RemoteSpdk,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Diskless => "DISKLESS",
            ProviderKind::Lvm => "LVM",
            ProviderKind::LvmThin => "LVM_THIN",
            ProviderKind::Zfs => "ZFS",
            ProviderKind::ZfsThin => "ZFS_THIN",
            ProviderKind::File => "FILE",
            ProviderKind::FileThin => "FILE_THIN",
            ProviderKind::Spdk => "SPDK",
            ProviderKind::RemoteSpdk => "REMOTE_SPDK",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DISKLESS" => Some(ProviderKind::Diskless),
            "LVM" => Some(ProviderKind::Lvm),
            "LVM_THIN" => Some(ProviderKind::LvmThin),
            "ZFS" => Some(ProviderKind::Zfs),
            "ZFS_THIN" => Some(ProviderKind::ZfsThin),
            "FILE" => Some(ProviderKind::File),
            "FILE_THIN" => Some(ProviderKind::FileThin),
            "SPDK" => Some(ProviderKind::Spdk),
            "REMOTE_SPDK" => Some(ProviderKind::RemoteSpdk),
            _ => None,
        }
    }

    /// Whether volumes of this kind correspond to an object in a backend
    pub fn has_backing_object(&self) -> bool {
        !matches!(self, ProviderKind::Diskless)
    }

    /// Which kind-specific attributes this provider reports
    pub fn attribute_family(&self) -> AttributeFamily {
        match self {
            ProviderKind::Diskless => AttributeFamily::None,
            ProviderKind::Lvm | ProviderKind::LvmThin => AttributeFamily::Lvm,
            ProviderKind::Zfs | ProviderKind::ZfsThin => AttributeFamily::Zfs,
            ProviderKind::File | ProviderKind::FileThin => AttributeFamily::File,
            ProviderKind::Spdk | ProviderKind::RemoteSpdk => AttributeFamily::Spdk,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
