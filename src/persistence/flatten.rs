//! Tree Flattening
//!
//! Inverse of the loader: turns a resource's layer tree back into flat,
//! parent-linked rows. Rows come out parent-before-child.

use super::record::{LayerRecord, VolumePayloadRecord, VolumeRecord};
use crate::layer::{LayerNode, NodePayload, Resource, VolumeData, VolumeLeaf};

/// Flatten one resource into layer and volume rows
pub fn flatten(resource: &Resource) -> (Vec<LayerRecord>, Vec<VolumeRecord>) {
    let mut layers = Vec::with_capacity(resource.tree.len());
    let mut volumes = Vec::new();

    for id in resource.tree.pre_order() {
        let Some(node) = resource.tree.get(id) else {
            continue;
        };
        layers.push(layer_record(resource, node));
        volumes.extend(node.volumes.values().map(|leaf| volume_record(node, leaf)));
    }

    (layers, volumes)
}

fn layer_record(resource: &Resource, node: &LayerNode) -> LayerRecord {
    let replication = match &node.payload {
        NodePayload::Replication(data) => Some(data.clone()),
        NodePayload::Encryption | NodePayload::RemoteAttach | NodePayload::Storage => None,
    };

    LayerRecord {
        id: node.id.0,
        parent_id: node.parent.map(|parent| parent.0),
        kind: node.kind().as_str().to_string(),
        suffix: node.suffix.clone(),
        owner: resource.key.clone(),
        suspended: node.suspended,
        replication,
    }
}

fn volume_record(node: &LayerNode, leaf: &VolumeLeaf) -> VolumeRecord {
    let payload = match &leaf.data {
        VolumeData::Replication(data) => VolumePayloadRecord::Replication {
            meta_disk_path: data.meta_disk_path.clone(),
        },
        VolumeData::Encryption(data) => VolumePayloadRecord::Encryption {
            backing_device: data.backing_device.clone(),
            opened: data.opened,
        },
        VolumeData::RemoteAttach => VolumePayloadRecord::RemoteAttach,
        VolumeData::Storage(data) => VolumePayloadRecord::Storage {
            provider: data.provider.as_str().to_string(),
            storage_pool: data.storage_pool.clone(),
            exists: data.exists,
            attributes: data.attributes.to_fields(),
        },
    };

    VolumeRecord {
        layer_id: node.id.0,
        volume_number: leaf.volume_number,
        expected_size_kib: leaf.expected_size_kib,
        device_path: leaf.facts.device_path.clone(),
        allocated_size_kib: leaf.facts.allocated_size_kib,
        usable_size_kib: leaf.facts.usable_size_kib,
        disk_state: leaf.facts.disk_state.clone(),
        payload,
    }
}
