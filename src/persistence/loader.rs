//! Persistent Loader
//!
//! Rebuilds every resource's layer tree from flat, parent-linked records.
//!
//! Records are processed in breadth-first passes: the first pass loads all
//! rows without a parent, every following pass loads the rows whose parent
//! was loaded by the previous pass. A kind loader therefore always sees its
//! parent fully materialized. Any row that fails to cross-reference aborts
//! the whole load.

use super::record::{LayerRecord, ObjectCatalog, VolumePayloadRecord, VolumeRecord};
use crate::domain::ports::RecordStore;
use crate::error::{Error, Result};
use crate::layer::{
    EncryptionVolumeData, LayerKind, LayerNode, LayerNodeId, NodePayload, ProviderAttributes,
    ProviderKind, ReplicationVolumeData, Resource, ResourceDefinition, ResourceKey,
    StorageVolumeData, StoragePoolIndex, StoragePoolKey, VolumeData, VolumeFacts, VolumeLeaf,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Load Context
// =============================================================================

/// Everything the loader materialized, handed back to the caller
#[derive(Debug, Default)]
pub struct LoadContext {
    pub definitions: BTreeMap<String, Arc<ResourceDefinition>>,
    pub resources: BTreeMap<ResourceKey, Resource>,
    pub storage_pools: StoragePoolIndex,
    /// Layer ids materialized by each pass, in pass order
    pub passes: Vec<Vec<LayerNodeId>>,
    /// Owning resource of every loaded layer node
    owners: HashMap<LayerNodeId, ResourceKey>,
}

impl LoadContext {
    fn from_catalog(catalog: ObjectCatalog) -> Result<Self> {
        let mut ctx = LoadContext::default();

        for definition in catalog.definitions {
            ctx.definitions
                .insert(definition.name.clone(), Arc::new(definition));
        }

        for pool in catalog.storage_pools {
            ctx.storage_pools.insert(pool.key.clone(), pool);
        }

        for record in catalog.resources {
            let definition = ctx
                .definitions
                .get(&record.definition)
                .cloned()
                .ok_or_else(|| {
                    Error::LoadInconsistency(format!(
                        "resource {} references unknown definition {}",
                        record.key, record.definition
                    ))
                })?;
            ctx.resources
                .insert(record.key.clone(), Resource::new(record.key, definition));
        }

        Ok(ctx)
    }

    /// Total number of loaded layer nodes
    pub fn layer_count(&self) -> usize {
        self.owners.len()
    }

    /// Pass in which a layer node was materialized
    pub fn pass_of(&self, id: LayerNodeId) -> Option<usize> {
        self.passes.iter().position(|pass| pass.contains(&id))
    }
}

// =============================================================================
// Persistent Loader
// =============================================================================

/// Reconstructs layer trees from a [`RecordStore`]
pub struct PersistentLoader;

impl PersistentLoader {
    /// Fetch all records and rebuild every resource's layer tree
    ///
    /// The caller must hold the graph exclusively until the returned context
    /// is installed; nothing may observe a partially loaded graph.
    pub async fn load_all(store: &dyn RecordStore) -> Result<LoadContext> {
        let catalog = store.load_catalog().await?;
        let layers = store.load_layer_records().await?;
        let volumes = store.load_volume_records().await?;
        Self::build(catalog, layers, volumes)
    }

    /// Rebuild layer trees from already fetched records
    pub fn build(
        catalog: ObjectCatalog,
        layers: Vec<LayerRecord>,
        volumes: Vec<VolumeRecord>,
    ) -> Result<LoadContext> {
        let mut ctx = LoadContext::from_catalog(catalog)?;

        let mut seen = HashSet::with_capacity(layers.len());
        for record in &layers {
            if !seen.insert(record.id) {
                return Err(Error::LoadInconsistency(format!(
                    "duplicate layer record id {}",
                    record.id
                )));
            }
        }

        let mut volumes_by_layer: HashMap<u64, Vec<VolumeRecord>> = HashMap::new();
        for volume in volumes {
            volumes_by_layer
                .entry(volume.layer_id)
                .or_default()
                .push(volume);
        }

        let mut pending = layers;
        let mut previous: Option<HashSet<u64>> = None;

        loop {
            let (ready, rest): (Vec<LayerRecord>, Vec<LayerRecord>) =
                pending.into_iter().partition(|record| match (&previous, record.parent_id) {
                    (None, parent) => parent.is_none(),
                    (Some(loaded), Some(parent)) => loaded.contains(&parent),
                    (Some(_), None) => false,
                });
            pending = rest;

            if ready.is_empty() {
                break;
            }

            let mut pass = Vec::with_capacity(ready.len());
            for record in ready {
                let record_volumes = volumes_by_layer.remove(&record.id).unwrap_or_default();
                pass.push(load_record(&mut ctx, record, record_volumes)?);
            }
            debug!(pass = ctx.passes.len() + 1, nodes = pass.len(), "Loaded layer pass");

            previous = Some(pass.iter().map(|id| id.0).collect());
            ctx.passes.push(pass);
        }

        if !pending.is_empty() {
            return Err(unresolved_parent(&pending));
        }

        if let Some(layer_id) = volumes_by_layer.keys().min() {
            return Err(Error::LoadInconsistency(format!(
                "volume rows reference unknown layer record {}",
                layer_id
            )));
        }

        for resource in ctx.resources.values_mut() {
            resource.refresh_metadata();
        }

        info!(
            resources = ctx.resources.len(),
            layers = ctx.layer_count(),
            passes = ctx.passes.len(),
            "Loaded layer trees"
        );

        Ok(ctx)
    }
}

/// Explain why records were left over after the last pass
///
/// A leftover record whose parent is not itself left over hangs below a
/// parent that was never loaded. When every leftover parent is also left
/// over, the parent links must close a cycle.
fn unresolved_parent(pending: &[LayerRecord]) -> Error {
    let parents: HashMap<u64, Option<u64>> = pending
        .iter()
        .map(|record| (record.id, record.parent_id))
        .collect();

    let dangling = pending
        .iter()
        .filter_map(|record| {
            record
                .parent_id
                .filter(|parent_id| !parents.contains_key(parent_id))
                .map(|parent_id| (record.id, parent_id))
        })
        .min();
    if let Some((record_id, parent_id)) = dangling {
        return Error::DanglingParent {
            record_id,
            parent_id,
        };
    }

    let mut current = parents.keys().min().copied();
    let mut visited = HashSet::new();
    while let Some(id) = current {
        if !visited.insert(id) {
            return Error::LoadInconsistency(format!(
                "layer record {} is part of a parent cycle",
                id
            ));
        }
        current = parents.get(&id).copied().flatten();
    }

    Error::Internal("leftover layer records without a parent chain".into())
}

// =============================================================================
// Record Loading
// =============================================================================

/// Load one record and attach it to its parent or owning resource
fn load_record(
    ctx: &mut LoadContext,
    record: LayerRecord,
    volumes: Vec<VolumeRecord>,
) -> Result<LayerNodeId> {
    let kind = LayerKind::parse(&record.kind).ok_or_else(|| Error::UnknownLayerKind {
        record_id: record.id,
        kind: record.kind.clone(),
    })?;

    if let Some(parent_id) = record.parent_id {
        let parent_owner = ctx.owners.get(&LayerNodeId(parent_id));
        if parent_owner != Some(&record.owner) {
            return Err(Error::LoadInconsistency(format!(
                "layer record {} is owned by {} but its parent {} is not",
                record.id, record.owner, parent_id
            )));
        }
    }

    let resource = ctx
        .resources
        .get(&record.owner)
        .ok_or_else(|| Error::MissingOwner {
            record_id: record.id,
            owner: record.owner.to_string(),
        })?;
    let parent = record
        .parent_id
        .and_then(|parent_id| resource.tree.get(LayerNodeId(parent_id)));

    let node = match kind {
        LayerKind::Replication => load_replication(&record, resource, volumes)?,
        LayerKind::Encryption => load_encryption(&record, parent, volumes)?,
        LayerKind::RemoteAttach => load_remote_attach(&record, parent, volumes)?,
        LayerKind::Storage => load_storage(&record, parent, &ctx.storage_pools, volumes)?,
    };

    let id = node.id;
    let owner = record.owner;
    let resource = ctx
        .resources
        .get_mut(&owner)
        .ok_or_else(|| Error::Internal(format!("resource {} vanished during load", owner)))?;
    match record.parent_id {
        Some(parent_id) => resource.tree.insert_child(LayerNodeId(parent_id), node)?,
        None => resource.tree.insert_root(node)?,
    };
    ctx.owners.insert(id, owner);

    Ok(id)
}

fn new_node(record: &LayerRecord, payload: NodePayload) -> LayerNode {
    let mut node = LayerNode::new(LayerNodeId(record.id), record.suffix.clone(), payload);
    node.suspended = record.suspended;
    node
}

fn leaf(volume: &VolumeRecord, data: VolumeData) -> VolumeLeaf {
    VolumeLeaf {
        volume_number: volume.volume_number,
        expected_size_kib: volume.expected_size_kib,
        facts: VolumeFacts {
            device_path: volume.device_path.clone(),
            allocated_size_kib: volume.allocated_size_kib,
            usable_size_kib: volume.usable_size_kib,
            disk_state: volume.disk_state.clone(),
        },
        data,
    }
}

fn payload_mismatch(record: &LayerRecord, volume: &VolumeRecord) -> Error {
    Error::LoadInconsistency(format!(
        "volume {} of layer record {} ({}) carries a foreign payload",
        volume.volume_number, record.id, record.kind
    ))
}

/// Child suffixes extend the suffix of their parent
fn check_suffix_scope(record: &LayerRecord, parent: Option<&LayerNode>) -> Result<()> {
    match parent {
        Some(parent) if !record.suffix.starts_with(&parent.suffix) => {
            Err(Error::LoadInconsistency(format!(
                "layer record {} suffix '{}' is outside its parent's suffix '{}'",
                record.id, record.suffix, parent.suffix
            )))
        }
        _ => Ok(()),
    }
}

fn attach_volumes(
    node: &mut LayerNode,
    record: &LayerRecord,
    volumes: Vec<VolumeRecord>,
    mut convert: impl FnMut(&VolumeRecord) -> Result<VolumeData>,
) -> Result<()> {
    for volume in volumes {
        let data = convert(&volume)?;
        if node
            .volumes
            .insert(volume.volume_number, leaf(&volume, data))
            .is_some()
        {
            return Err(Error::LoadInconsistency(format!(
                "layer record {} has volume {} twice",
                record.id, volume.volume_number
            )));
        }
    }
    Ok(())
}

fn load_replication(
    record: &LayerRecord,
    resource: &Resource,
    volumes: Vec<VolumeRecord>,
) -> Result<LayerNode> {
    let node_data = record.replication.clone().ok_or_else(|| {
        Error::LoadInconsistency(format!(
            "replication layer record {} has no node data",
            record.id
        ))
    })?;
    let definition = resource
        .definition
        .replication
        .get(&record.suffix)
        .ok_or_else(|| {
            Error::LoadInconsistency(format!(
                "replication layer record {} has no definition for suffix '{}' in {}",
                record.id, record.suffix, resource.definition.name
            ))
        })?;

    let mut node = new_node(record, NodePayload::Replication(node_data));
    attach_volumes(&mut node, record, volumes, |volume| {
        let VolumePayloadRecord::Replication { meta_disk_path } = &volume.payload else {
            return Err(payload_mismatch(record, volume));
        };
        if !definition.volumes.contains_key(&volume.volume_number) {
            return Err(Error::LoadInconsistency(format!(
                "replication volume {} of layer record {} has no volume definition",
                volume.volume_number, record.id
            )));
        }
        Ok(VolumeData::Replication(ReplicationVolumeData {
            meta_disk_path: meta_disk_path.clone(),
        }))
    })?;
    Ok(node)
}

fn load_encryption(
    record: &LayerRecord,
    parent: Option<&LayerNode>,
    volumes: Vec<VolumeRecord>,
) -> Result<LayerNode> {
    check_suffix_scope(record, parent)?;
    let mut node = new_node(record, NodePayload::Encryption);
    attach_volumes(&mut node, record, volumes, |volume| {
        let VolumePayloadRecord::Encryption {
            backing_device,
            opened,
        } = &volume.payload
        else {
            return Err(payload_mismatch(record, volume));
        };
        Ok(VolumeData::Encryption(EncryptionVolumeData {
            backing_device: backing_device.clone(),
            opened: *opened,
        }))
    })?;
    Ok(node)
}

fn load_remote_attach(
    record: &LayerRecord,
    parent: Option<&LayerNode>,
    volumes: Vec<VolumeRecord>,
) -> Result<LayerNode> {
    check_suffix_scope(record, parent)?;
    let mut node = new_node(record, NodePayload::RemoteAttach);
    attach_volumes(&mut node, record, volumes, |volume| match &volume.payload {
        VolumePayloadRecord::RemoteAttach => Ok(VolumeData::RemoteAttach),
        _ => Err(payload_mismatch(record, volume)),
    })?;
    Ok(node)
}

fn load_storage(
    record: &LayerRecord,
    parent: Option<&LayerNode>,
    storage_pools: &StoragePoolIndex,
    volumes: Vec<VolumeRecord>,
) -> Result<LayerNode> {
    check_suffix_scope(record, parent)?;
    let mut node = new_node(record, NodePayload::Storage);
    attach_volumes(&mut node, record, volumes, |volume| {
        let VolumePayloadRecord::Storage {
            provider,
            storage_pool,
            exists,
            attributes,
        } = &volume.payload
        else {
            return Err(payload_mismatch(record, volume));
        };

        let provider = ProviderKind::parse(provider).ok_or_else(|| {
            Error::LoadInconsistency(format!(
                "storage volume {} of layer record {} has unknown provider kind '{}'",
                volume.volume_number, record.id, provider
            ))
        })?;

        // Pools are scoped by the node of the enclosing resource
        let pool_key = StoragePoolKey::new(record.owner.node_name.clone(), storage_pool.clone());
        let pool = storage_pools
            .get(&pool_key)
            .ok_or_else(|| Error::MissingStoragePool {
                record_id: record.id,
                node: pool_key.node_name.clone(),
                pool: pool_key.pool_name.clone(),
            })?;
        if pool.provider != provider {
            return Err(Error::LoadInconsistency(format!(
                "storage volume {} of layer record {} is {} but pool {} is {}",
                volume.volume_number, record.id, provider, pool.key, pool.provider
            )));
        }

        Ok(VolumeData::Storage(StorageVolumeData {
            provider,
            storage_pool: storage_pool.clone(),
            attributes: ProviderAttributes::from_fields(provider, attributes),
            exists: *exists,
            size_state: None,
        }))
    })?;
    Ok(node)
}
