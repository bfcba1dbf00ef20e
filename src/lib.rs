//! Layer-Stack Controller Core
//!
//! Controller-side model of per-resource device layer stacks (replication,
//! encryption, remote attach, storage), rebuilt from flat persisted records
//! and kept in sync with the layer data satellites report back.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         Reconcile Service                            │
//! │   satellite report ──► facts fetch ──► merge ──► persist ──► events  │
//! ├───────────────────────────────┬──────────────────────────────────────┤
//! │      Reconciliation Engine    │        Resource Registry             │
//! │  (per-kind merge, absences,   │  (per-resource locks, pool index,    │
//! │   size classification)        │   single install)                    │
//! ├───────────────────────────────┴──────────────────────────────────────┤
//! │                         Layer Tree (arena)                           │
//! │        REPLICATION ─► ENCRYPTION ─► STORAGE    REMOTE_ATTACH         │
//! ├───────────────────────────────┬──────────────────────────────────────┤
//! │   Persistent Loader / flatten │   Storage Provider Adapters          │
//! │   (breadth-first passes)      │   (timeouts, bounded retry)          │
//! └───────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`layer`]: Layer tree data model
//! - [`persistence`]: Flat records, record stores, loader and flattener
//! - [`reconcile`]: Satellite reports and the reconciliation engine
//! - [`storage`]: Size classification, backend identifiers, adapters
//! - [`controller`]: Registry, reconcile service, events and metrics
//! - [`domain`]: Ports to external collaborators
//! - [`config`]: Controller configuration
//! - [`error`]: Error types and fault classification

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod layer;
pub mod persistence;
pub mod reconcile;
pub mod storage;

#[cfg(test)]
pub(crate) mod fixtures;

// Re-export commonly used types
pub use config::{ControllerConfig, InboxConfig};

pub use controller::{
    ControllerEvent, ReconcileMetrics, ReconcileMetricsSnapshot, ReconcileService,
    ResourceRegistry,
};

pub use domain::ports::{
    FactsMap, FreeSpace, ProviderFacts, RecordStore, StorageProviderAdapter, VolumeSpec,
};

pub use error::{Error, FaultClass, Result};

pub use layer::{
    LayerKind, LayerNode, LayerNodeId, LayerTree, ProviderKind, Resource, ResourceKey,
    StoragePool, StoragePoolKey, VolumeLeaf,
};

pub use persistence::{
    flatten, JsonFileRecordStore, LoadContext, MemoryRecordStore, PersistentLoader,
    RecordDocument,
};

pub use reconcile::{MergeSummary, ReconciliationEngine, SatelliteReport};

pub use storage::{
    classify, InMemoryProviderAdapter, RetryConfig, RetryingAdapter, SizeClassifier, SizeState,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
