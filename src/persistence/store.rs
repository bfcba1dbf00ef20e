//! Record Stores
//!
//! Implementations of the [`RecordStore`] port: an in-memory store for tests
//! and a single-document JSON file store for standalone controller runs.

use super::record::{LayerRecord, ObjectCatalog, RecordDocument, VolumeRecord};
use crate::domain::ports::RecordStore;
use crate::error::Result;
use crate::layer::ResourceKey;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

// =============================================================================
// Memory Record Store
// =============================================================================

/// Record store keeping one document in memory
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    document: RwLock<RecordDocument>,
}

impl MemoryRecordStore {
    pub fn new(document: RecordDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }

    /// Copy of the current document
    pub fn snapshot(&self) -> RecordDocument {
        self.document.read().clone()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_catalog(&self) -> Result<ObjectCatalog> {
        Ok(self.document.read().catalog.clone())
    }

    async fn load_layer_records(&self) -> Result<Vec<LayerRecord>> {
        Ok(self.document.read().layers.clone())
    }

    async fn load_volume_records(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self.document.read().volumes.clone())
    }

    async fn save_resource(
        &self,
        key: &ResourceKey,
        layers: Vec<LayerRecord>,
        volumes: Vec<VolumeRecord>,
    ) -> Result<()> {
        self.document.write().replace_resource(key, layers, volumes);
        Ok(())
    }
}

// =============================================================================
// JSON File Record Store
// =============================================================================

/// Record store backed by one JSON document on disk
///
/// Writes go to a sibling temporary file which is then renamed over the
/// document, so readers never see a half-written file.
pub struct JsonFileRecordStore {
    path: PathBuf,
    /// Serializes read-modify-write cycles
    write_lock: Mutex<()>,
}

impl JsonFileRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_document(&self) -> Result<RecordDocument> {
        let bytes = tokio::fs::read(&self.path).await?;
        let document = serde_json::from_slice(&bytes)?;
        debug!(path = %self.path.display(), "Read record document");
        Ok(document)
    }

    async fn write_document(&self, document: &RecordDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn load_catalog(&self) -> Result<ObjectCatalog> {
        Ok(self.read_document().await?.catalog)
    }

    async fn load_layer_records(&self) -> Result<Vec<LayerRecord>> {
        Ok(self.read_document().await?.layers)
    }

    async fn load_volume_records(&self) -> Result<Vec<VolumeRecord>> {
        Ok(self.read_document().await?.volumes)
    }

    async fn save_resource(
        &self,
        key: &ResourceKey,
        layers: Vec<LayerRecord>,
        volumes: Vec<VolumeRecord>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;
        let layer_count = layers.len();
        document.replace_resource(key, layers, volumes);
        self.write_document(&document).await?;
        info!(resource = %key, layers = layer_count, path = %self.path.display(), "Saved resource records");
        Ok(())
    }
}
