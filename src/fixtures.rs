//! Shared fixtures for unit tests

use crate::domain::ports::{FactsMap, ProviderFacts};
use crate::layer::{
    AttributeFields, ProviderKind, ReplicationDefinition, ReplicationNodeData,
    ReplicationVolumeDefinition, ResourceDefinition, ResourceKey, StoragePool, StoragePoolKey,
};
use crate::persistence::record::{
    LayerRecord, ObjectCatalog, RecordDocument, ResourceRecord, VolumePayloadRecord, VolumeRecord,
};
use crate::persistence::{LoadContext, PersistentLoader};
use crate::reconcile::report::{
    ReportNode, ReportReplicationDefinition, ReportVolume, SatelliteReport,
};
use std::collections::BTreeMap;

pub fn resource_key() -> ResourceKey {
    ResourceKey::new("n1", "r1")
}

pub fn definition() -> ResourceDefinition {
    let mut definition = ResourceDefinition::new("r1");
    definition.replication.insert(
        String::new(),
        ReplicationDefinition {
            port: 7000,
            secret: "s3cr3t".into(),
            transport: "IP".into(),
            peer_slots: 7,
            al_stripes: 1,
            volumes: BTreeMap::from([(0, ReplicationVolumeDefinition { minor: 1000 })]),
        },
    );
    definition
}

pub fn lvm_pool() -> StoragePool {
    StoragePool {
        key: StoragePoolKey::new("n1", "lvm1"),
        provider: ProviderKind::Lvm,
        extent_size_kib: 4,
        capacity_kib: 10_485_760,
        free_kib: 8_388_608,
    }
}

fn layer(id: u64, parent_id: Option<u64>, kind: &str, suffix: &str) -> LayerRecord {
    LayerRecord {
        id,
        parent_id,
        kind: kind.into(),
        suffix: suffix.into(),
        owner: resource_key(),
        suspended: false,
        replication: None,
    }
}

fn volume(layer_id: u64, expected_size_kib: u64, payload: VolumePayloadRecord) -> VolumeRecord {
    VolumeRecord {
        layer_id,
        volume_number: 0,
        expected_size_kib,
        device_path: None,
        allocated_size_kib: None,
        usable_size_kib: None,
        disk_state: None,
        payload,
    }
}

fn lvm_volume(layer_id: u64, expected_size_kib: u64) -> VolumeRecord {
    volume(
        layer_id,
        expected_size_kib,
        VolumePayloadRecord::Storage {
            provider: "LVM".into(),
            storage_pool: "lvm1".into(),
            exists: false,
            attributes: AttributeFields {
                volume_group: Some("vg0".into()),
                ..Default::default()
            },
        },
    )
}

/// Replication over encryption over LVM, plus an LVM metadata volume:
///
/// ```text
/// 1 REPLICATION ""
/// ├── 2 ENCRYPTION ""
/// │   └── 3 STORAGE ""
/// └── 4 STORAGE ".meta"
/// ```
pub fn replicated_document() -> RecordDocument {
    let mut root = layer(1, None, "REPLICATION", "");
    root.replication = Some(ReplicationNodeData {
        node_id: 0,
        peer_slots: 7,
        al_stripes: 1,
        al_stripe_size_kib: 32,
    });

    RecordDocument {
        catalog: ObjectCatalog {
            definitions: vec![definition()],
            resources: vec![ResourceRecord {
                key: resource_key(),
                definition: "r1".into(),
            }],
            storage_pools: vec![lvm_pool()],
        },
        layers: vec![
            root,
            layer(2, Some(1), "ENCRYPTION", ""),
            layer(3, Some(2), "STORAGE", ""),
            layer(4, Some(1), "STORAGE", ".meta"),
        ],
        volumes: vec![
            volume(
                1,
                102_400,
                VolumePayloadRecord::Replication {
                    meta_disk_path: None,
                },
            ),
            volume(
                2,
                102_400,
                VolumePayloadRecord::Encryption {
                    backing_device: None,
                    opened: false,
                },
            ),
            lvm_volume(3, 102_400),
            lvm_volume(4, 4_096),
        ],
    }
}

/// A remote-attach root over a diskless storage node, on node "n2"
pub fn remote_attach_document() -> RecordDocument {
    let key = ResourceKey::new("n2", "r1");
    let mut root = layer(11, None, "REMOTE_ATTACH", "");
    root.owner = key.clone();
    let mut storage = layer(12, Some(11), "STORAGE", "");
    storage.owner = key.clone();

    RecordDocument {
        catalog: ObjectCatalog {
            definitions: vec![definition()],
            resources: vec![ResourceRecord {
                key,
                definition: "r1".into(),
            }],
            storage_pools: vec![StoragePool {
                key: StoragePoolKey::new("n2", "diskless"),
                provider: ProviderKind::Diskless,
                extent_size_kib: 1,
                capacity_kib: 0,
                free_kib: 0,
            }],
        },
        layers: vec![root, storage],
        volumes: vec![
            volume(11, 102_400, VolumePayloadRecord::RemoteAttach),
            volume(
                12,
                102_400,
                VolumePayloadRecord::Storage {
                    provider: "DISKLESS".into(),
                    storage_pool: "diskless".into(),
                    exists: false,
                    attributes: AttributeFields::default(),
                },
            ),
        ],
    }
}

pub fn load(document: RecordDocument) -> LoadContext {
    PersistentLoader::build(document.catalog, document.layers, document.volumes).unwrap()
}

fn storage_report_volume(device_path: &str, size_kib: u64) -> ReportVolume {
    ReportVolume {
        device_path: Some(device_path.into()),
        allocated_size_kib: Some(size_kib),
        usable_size_kib: Some(size_kib),
        provider: Some("LVM".into()),
        attributes: AttributeFields {
            volume_group: Some("vg0".into()),
            ..Default::default()
        },
        ..ReportVolume::numbered(0)
    }
}

fn report_node(kind: &str, suffix: &str, volumes: Vec<ReportVolume>) -> ReportNode {
    ReportNode {
        kind: Some(kind.into()),
        suffix: Some(suffix.into()),
        volumes,
        ..Default::default()
    }
}

/// Full report matching [`replicated_document`]
pub fn replicated_report() -> SatelliteReport {
    let mut storage = report_node(
        "STORAGE",
        "",
        vec![storage_report_volume("/dev/vg0/r1_00000", 102_400)],
    );
    storage.suspended = Some(false);

    let mut encryption = report_node(
        "ENCRYPTION",
        "",
        vec![ReportVolume {
            device_path: Some("/dev/mapper/r1_00000".into()),
            allocated_size_kib: Some(102_400),
            usable_size_kib: Some(102_398),
            backing_device: Some("/dev/vg0/r1_00000".into()),
            opened: Some(true),
            ..ReportVolume::numbered(0)
        }],
    );
    encryption.children = vec![storage];

    let meta = report_node(
        "STORAGE",
        ".meta",
        vec![storage_report_volume("/dev/vg0/r1.meta_00000", 4_100)],
    );

    let mut root = report_node(
        "REPLICATION",
        "",
        vec![ReportVolume {
            device_path: Some("/dev/drbd1000".into()),
            allocated_size_kib: Some(102_400),
            usable_size_kib: Some(102_396),
            disk_state: Some("UpToDate".into()),
            meta_disk_path: Some("/dev/vg0/r1.meta_00000".into()),
            ..ReportVolume::numbered(0)
        }],
    );
    root.replication_definition = Some(ReportReplicationDefinition {
        port: Some(7000),
        transport: Some("IP".into()),
        peer_slots: Some(7),
        volumes: vec![0],
    });
    root.children = vec![encryption, meta];

    SatelliteReport {
        node_name: Some("n1".into()),
        resource_name: Some("r1".into()),
        snapshot_name: None,
        roots: vec![root],
    }
}

/// Backend facts matching [`replicated_report`]
pub fn replicated_facts() -> FactsMap {
    let object = |path: &str, size_kib| ProviderFacts {
        exists: true,
        path: Some(path.into()),
        size_kib,
        attributes: BTreeMap::new(),
    };
    FactsMap::from([
        ("r1_00000".to_string(), object("/dev/vg0/r1_00000", 102_400)),
        ("r1.meta_00000".to_string(), object("/dev/vg0/r1.meta_00000", 4_100)),
    ])
}
