//! Satellite Reports
//!
//! Wire form of the layer data a satellite sends back after applying a
//! resource. Structural fields are optional on the wire so that a truncated
//! report is detected during the merge instead of failing deserialization.

use crate::error::{Error, Result};
use crate::layer::{AttributeFields, ResourceKey};
use serde::{Deserialize, Serialize};

/// Unwrap a structural report field
pub fn require<T>(value: Option<T>, field: &'static str) -> Result<T> {
    value.ok_or(Error::MissingReportField { field })
}

/// Layer data reported for one resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteReport {
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default)]
    pub resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
    #[serde(default)]
    pub roots: Vec<ReportNode>,
}

impl SatelliteReport {
    /// Key of the resource this report describes
    pub fn resource_key(&self) -> Result<ResourceKey> {
        let node_name = require(self.node_name.clone(), "node_name")?;
        let resource_name = require(self.resource_name.clone(), "resource_name")?;
        Ok(match &self.snapshot_name {
            Some(snapshot) => ResourceKey::snapshot(node_name, resource_name, snapshot.clone()),
            None => ResourceKey::new(node_name, resource_name),
        })
    }
}

/// Definition-level replication settings echoed by the satellite
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportReplicationDefinition {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub peer_slots: Option<u16>,
    /// Volume numbers of the replication volume definitions
    #[serde(default)]
    pub volumes: Vec<u32>,
}

/// One reported layer node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportNode {
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub suffix: Option<String>,
    /// Ignored; suspension is controller-authored
    #[serde(default)]
    pub suspended: Option<bool>,
    /// Ignored; the satellite cannot rewire the stack
    #[serde(default)]
    pub parent_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_definition: Option<ReportReplicationDefinition>,
    #[serde(default)]
    pub volumes: Vec<ReportVolume>,
    #[serde(default)]
    pub children: Vec<ReportNode>,
}

/// One reported volume
///
/// Fact fields may legitimately be null; kind-specific fields are only read
/// for the matching layer kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportVolume {
    #[serde(default)]
    pub volume_number: Option<u32>,
    #[serde(default)]
    pub device_path: Option<String>,
    #[serde(default)]
    pub allocated_size_kib: Option<u64>,
    #[serde(default)]
    pub usable_size_kib: Option<u64>,
    #[serde(default)]
    pub disk_state: Option<String>,

    // Replication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_disk_path: Option<String>,

    // Encryption
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened: Option<bool>,

    // Storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Ignored; pool assignment is controller-authored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_pool: Option<String>,
    #[serde(flatten)]
    pub attributes: AttributeFields,
}

impl ReportVolume {
    pub fn numbered(volume_number: u32) -> Self {
        Self {
            volume_number: Some(volume_number),
            ..Default::default()
        }
    }
}
