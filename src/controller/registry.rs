//! Resource Registry
//!
//! Holds the loaded layer graph. Each resource sits behind its own async
//! mutex so merges of different resources run concurrently while merges of
//! the same resource are serialized. The graph is installed exactly once.

use super::events::ControllerEvent;
use crate::domain::ports::FreeSpace;
use crate::error::{Error, Result};
use crate::layer::{Resource, ResourceKey, StoragePoolIndex, StoragePoolKey};
use crate::persistence::LoadContext;
use dashmap::DashMap;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

/// Capacity of the event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Shared handle to one resource
pub type ResourceHandle = Arc<Mutex<Resource>>;

pub struct ResourceRegistry {
    resources: DashMap<ResourceKey, ResourceHandle>,
    /// Replaced wholesale on update so readers keep a consistent view
    pools: RwLock<Arc<StoragePoolIndex>>,
    loaded: AtomicBool,
    /// Serializes installation
    install_lock: SyncMutex<()>,
    layer_count: AtomicUsize,
    event_sender: broadcast::Sender<ControllerEvent>,
}

impl ResourceRegistry {
    pub fn new() -> Arc<Self> {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            resources: DashMap::new(),
            pools: RwLock::new(Arc::new(StoragePoolIndex::new())),
            loaded: AtomicBool::new(false),
            install_lock: SyncMutex::new(()),
            layer_count: AtomicUsize::new(0),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.event_sender.subscribe()
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        let _ = self.event_sender.send(event);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Install a freshly loaded graph
    ///
    /// Nothing is visible to readers until every resource is in place.
    pub fn install(&self, ctx: LoadContext) -> Result<usize> {
        let _guard = self.install_lock.lock();
        if self.is_loaded() {
            return Err(Error::AlreadyLoaded);
        }

        let layers = ctx.layer_count();
        let passes = ctx.passes.len();
        let resources = ctx.resources.len();

        for (key, resource) in ctx.resources {
            self.resources.insert(key, Arc::new(Mutex::new(resource)));
        }
        *self.pools.write() = Arc::new(ctx.storage_pools);
        self.layer_count.store(layers, Ordering::Relaxed);
        self.loaded.store(true, Ordering::Release);

        info!(resources, layers, passes, "Installed layer graph");
        self.emit(ControllerEvent::ResourcesLoaded {
            resources,
            layers,
            passes,
        });

        Ok(resources)
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(Error::NotLoaded)
        }
    }

    /// Get the handle of one resource
    pub fn get(&self, key: &ResourceKey) -> Result<ResourceHandle> {
        self.ensure_loaded()?;
        self.resources
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::ResourceNotFound {
                resource: key.to_string(),
            })
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.is_loaded() && self.resources.contains_key(key)
    }

    /// All resource keys, sorted
    pub fn keys(&self) -> Vec<ResourceKey> {
        let mut keys: Vec<ResourceKey> = self
            .resources
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn layer_count(&self) -> usize {
        self.layer_count.load(Ordering::Relaxed)
    }

    /// Current storage pool index
    pub fn pools(&self) -> Result<Arc<StoragePoolIndex>> {
        self.ensure_loaded()?;
        Ok(self.pools.read().clone())
    }

    /// Update the capacity of one storage pool
    pub fn update_pool_space(&self, key: &StoragePoolKey, space: FreeSpace) -> Result<()> {
        self.ensure_loaded()?;
        let mut pools = self.pools.write();
        let mut updated = (**pools).clone();
        let pool = updated.get_mut(key).ok_or_else(|| {
            Error::Configuration(format!("storage pool {} is not known", key))
        })?;
        pool.capacity_kib = space.capacity_kib;
        pool.free_kib = space.free_kib;
        *pools = Arc::new(updated);
        Ok(())
    }
}
