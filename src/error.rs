//! Error types for the layer-stack controller
//!
//! Load and merge faults describe bad cluster state and are kept apart from
//! request errors and from storage-layer failures, so callers can route them
//! differently.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the controller core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Load Inconsistency (persisted graph does not cross-reference)
    // =========================================================================
    #[error("Unknown layer kind '{kind}' in persisted layer record {record_id}")]
    UnknownLayerKind { record_id: u64, kind: String },

    #[error("Layer record {record_id} references parent {parent_id} which was never loaded")]
    DanglingParent { record_id: u64, parent_id: u64 },

    #[error("Owning resource {owner} not found for layer record {record_id}")]
    MissingOwner { record_id: u64, owner: String },

    #[error("Storage pool {pool} not found on node {node} (layer record {record_id})")]
    MissingStoragePool {
        record_id: u64,
        node: String,
        pool: String,
    },

    #[error("Load inconsistency: {0}")]
    LoadInconsistency(String),

    // =========================================================================
    // Satellite Merge Faults
    // =========================================================================
    #[error("Received unknown object from satellite for resource {resource}: {detail}")]
    UnknownSatelliteObject { resource: String, detail: String },

    #[error("Missing volume {volume_number} from satellite for resource {resource} ({layer})")]
    MissingSatelliteVolume {
        resource: String,
        layer: String,
        volume_number: u32,
    },

    /// Raised while walking a truncated report; never escapes the merge
    /// entry point, which rewraps it as [`Error::UnknownSatelliteObject`].
    #[error("Satellite report is missing field '{field}'")]
    MissingReportField { field: &'static str },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    #[error("Resource not found: {resource}")]
    ResourceNotFound { resource: String },

    #[error("Resource graph has not been loaded yet")]
    NotLoaded,

    #[error("Resource graph was already loaded")]
    AlreadyLoaded,

    // =========================================================================
    // Storage Backend Errors
    // =========================================================================
    #[error("Storage backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Storage backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    #[error("Storage backend {backend} timed out during {operation} after {timeout:?}")]
    BackendTimeout {
        backend: String,
        operation: String,
        timeout: Duration,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification used to route faults
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    /// Persisted or reported cluster state is inconsistent
    ClusterState,
    /// A storage backend failed (possibly after retries)
    StorageLayer,
    /// Bad input or configuration from an operator
    Request,
    /// Programming error
    Internal,
}

impl Error {
    /// Determine the fault class of this error
    pub fn fault_class(&self) -> FaultClass {
        match self {
            Error::UnknownLayerKind { .. }
            | Error::DanglingParent { .. }
            | Error::MissingOwner { .. }
            | Error::MissingStoragePool { .. }
            | Error::LoadInconsistency(_)
            | Error::UnknownSatelliteObject { .. }
            | Error::MissingSatelliteVolume { .. }
            | Error::MissingReportField { .. } => FaultClass::ClusterState,

            Error::BackendUnavailable { .. }
            | Error::BackendOperationFailed { .. }
            | Error::BackendTimeout { .. } => FaultClass::StorageLayer,

            Error::Configuration(_)
            | Error::ResourceNotFound { .. }
            | Error::JsonParse(_)
            | Error::YamlParse(_) => FaultClass::Request,

            Error::Internal(_) | Error::NotLoaded | Error::AlreadyLoaded | Error::Io(_) => {
                FaultClass::Internal
            }
        }
    }

    /// Faults raised while loading the persisted graph abort startup
    pub fn is_load_fault(&self) -> bool {
        matches!(
            self,
            Error::UnknownLayerKind { .. }
                | Error::DanglingParent { .. }
                | Error::MissingOwner { .. }
                | Error::MissingStoragePool { .. }
                | Error::LoadInconsistency(_)
        )
    }

    /// Check if this error is transient (worth retrying at the adapter boundary)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable { .. } | Error::BackendTimeout { .. }
        )
    }

    /// Load and merge faults are never retried
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
