//! Reconciliation Engine
//!
//! Merges a satellite report into a resource's persisted layer tree. The
//! report is walked in lock-step with the tree, matching nodes by kind and
//! suffix below the same parent. The merge runs on a working copy that
//! replaces the persisted tree only once every step succeeded.

use super::layers::{merge_node, LayerContext};
use super::report::{require, ReportNode, SatelliteReport};
use crate::domain::ports::FactsMap;
use crate::error::{Error, Result};
use crate::layer::{LayerKind, LayerNodeId, LayerTree, Resource, StoragePoolIndex};
use crate::storage::{SizeClassifier, SizeState};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// A storage volume whose backend size is out of tolerance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftWarning {
    /// Backend identifier of the volume
    pub identifier: String,
    pub state: SizeState,
    pub expected_kib: u64,
    pub actual_kib: u64,
}

/// What one merge did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Persisted volumes that were present in the report
    pub merged_volumes: usize,
    /// Persisted volumes missing from the report without being fatal
    pub tolerated_absences: usize,
    /// Number of fields whose value changed
    pub changed_fields: usize,
    pub drift: Vec<DriftWarning>,
}

/// Merges satellite reports into persisted layer trees
#[derive(Debug, Clone, Default)]
pub struct ReconciliationEngine {
    classifier: SizeClassifier,
}

impl ReconciliationEngine {
    pub fn new(classifier: SizeClassifier) -> Self {
        Self { classifier }
    }

    pub fn classifier(&self) -> &SizeClassifier {
        &self.classifier
    }

    /// Merge `report` into `resource`
    ///
    /// On error the resource is left exactly as it was. A report that lacks
    /// a structural field is rejected as an unknown object.
    pub fn merge_layer_data(
        &self,
        resource: &mut Resource,
        report: &SatelliteReport,
        facts: &FactsMap,
        pools: &StoragePoolIndex,
    ) -> Result<MergeSummary> {
        let ctx = LayerContext {
            key: &resource.key,
            definition: &resource.definition,
            pools,
            facts,
            classifier: &self.classifier,
        };

        let mut working = resource.tree.clone();
        let mut summary = MergeSummary::default();

        match merge_report(&ctx, &mut working, report, &mut summary) {
            Ok(()) => {}
            Err(Error::MissingReportField { field }) => {
                return Err(ctx.unknown(format!("report is missing field '{}'", field)));
            }
            Err(err) => return Err(err),
        }

        resource.tree = working;
        resource.refresh_metadata();

        for warning in &summary.drift {
            warn!(
                resource = %resource.key,
                identifier = %warning.identifier,
                state = %warning.state,
                expected_kib = warning.expected_kib,
                actual_kib = warning.actual_kib,
                "Volume size drifted"
            );
        }
        debug!(
            resource = %resource.key,
            merged = summary.merged_volumes,
            tolerated = summary.tolerated_absences,
            changed = summary.changed_fields,
            "Merged satellite report"
        );

        Ok(summary)
    }
}

fn merge_report(
    ctx: &LayerContext<'_>,
    tree: &mut LayerTree,
    report: &SatelliteReport,
    summary: &mut MergeSummary,
) -> Result<()> {
    let reported_key = report.resource_key()?;
    if &reported_key != ctx.key {
        return Err(ctx.unknown(format!("report describes resource {}", reported_key)));
    }
    merge_level(ctx, tree, None, &report.roots, summary)
}

fn merge_level(
    ctx: &LayerContext<'_>,
    tree: &mut LayerTree,
    parent: Option<LayerNodeId>,
    reported: &[ReportNode],
    summary: &mut MergeSummary,
) -> Result<()> {
    let mut matched_ids = BTreeSet::new();
    for report_node in reported {
        let kind_name = require(report_node.kind.as_deref(), "kind")?;
        let kind = LayerKind::parse(kind_name)
            .ok_or_else(|| ctx.unknown(format!("layer kind '{}'", kind_name)))?;
        let suffix = require(report_node.suffix.as_deref(), "suffix")?;

        let matched = match parent {
            Some(parent) => tree.find_child(parent, kind, suffix),
            None => tree.find_root(kind, suffix),
        };
        let id = matched.ok_or_else(|| match parent {
            Some(parent) => ctx.unknown(format!(
                "{} layer '{}' below layer {}",
                kind, suffix, parent
            )),
            None => ctx.unknown(format!("top-level {} layer '{}'", kind, suffix)),
        })?;
        if !matched_ids.insert(id) {
            return Err(ctx.unknown(format!("{} layer '{}' reported twice", kind, suffix)));
        }

        let node = tree
            .get_mut(id)
            .ok_or_else(|| Error::Internal(format!("layer node {} vanished during merge", id)))?;
        merge_node(ctx, node, report_node, summary)?;

        merge_level(ctx, tree, Some(id), &report_node.children, summary)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::layer::{ProviderKind, ResourceKey, VolumeData};
    use crate::reconcile::report::ReportVolume;
    use assert_matches::assert_matches;

    fn loaded() -> (Resource, StoragePoolIndex) {
        let mut ctx = fixtures::load(fixtures::replicated_document());
        let resource = ctx.resources.remove(&fixtures::resource_key()).unwrap();
        (resource, ctx.storage_pools)
    }

    fn storage_leaf(resource: &Resource, id: u64) -> &crate::layer::VolumeLeaf {
        resource.tree.get(LayerNodeId(id)).unwrap().volume(0).unwrap()
    }

    #[test]
    fn test_merge_copies_reported_facts() {
        let (mut resource, pools) = loaded();
        let engine = ReconciliationEngine::default();

        let summary = engine
            .merge_layer_data(
                &mut resource,
                &fixtures::replicated_report(),
                &fixtures::replicated_facts(),
                &pools,
            )
            .unwrap();

        assert_eq!(summary.merged_volumes, 4);
        assert_eq!(summary.tolerated_absences, 0);
        assert!(summary.drift.is_empty());

        let leaf = storage_leaf(&resource, 3);
        assert_eq!(leaf.facts.device_path.as_deref(), Some("/dev/vg0/r1_00000"));
        assert_eq!(leaf.expected_size_kib, 102_400);
        let storage = leaf.storage().unwrap();
        assert!(storage.exists);
        assert_eq!(storage.size_state, Some(SizeState::AsExpected));

        let meta = storage_leaf(&resource, 4).storage().unwrap();
        assert_eq!(meta.size_state, Some(SizeState::TooLargeWithinTolerance));

        let replication = storage_leaf(&resource, 1);
        assert_eq!(replication.facts.disk_state.as_deref(), Some("UpToDate"));
        assert_matches!(
            &replication.data,
            VolumeData::Replication(data) if data.meta_disk_path.as_deref() == Some("/dev/vg0/r1.meta_00000")
        );

        let encryption = storage_leaf(&resource, 2);
        assert_matches!(&encryption.data, VolumeData::Encryption(data) if data.opened);
        assert_eq!(encryption.facts.usable_size_kib, Some(102_398));
    }

    #[test]
    fn test_facts_only_change_keeps_structure() {
        let (mut resource, pools) = loaded();
        let engine = ReconciliationEngine::default();
        let before = resource.tree.pre_order();

        let summary = engine
            .merge_layer_data(
                &mut resource,
                &fixtures::replicated_report(),
                &fixtures::replicated_facts(),
                &pools,
            )
            .unwrap();

        assert!(summary.changed_fields > 0);
        assert_eq!(resource.tree.pre_order(), before);
        for id in before {
            let node = resource.tree.get(id).unwrap();
            assert_eq!(node.volumes.len(), 1);
        }
    }

    #[test]
    fn test_remerge_is_idempotent() {
        let (mut resource, pools) = loaded();
        let engine = ReconciliationEngine::default();
        let report = fixtures::replicated_report();
        let facts = fixtures::replicated_facts();

        engine.merge_layer_data(&mut resource, &report, &facts, &pools).unwrap();
        let after_first = resource.clone();
        let summary = engine.merge_layer_data(&mut resource, &report, &facts, &pools).unwrap();

        assert_eq!(summary.changed_fields, 0);
        assert_eq!(resource, after_first);
    }

    #[test]
    fn test_unknown_layer_leaves_tree_untouched() {
        let (mut resource, pools) = loaded();
        let engine = ReconciliationEngine::default();
        let original = resource.clone();

        let mut report = fixtures::replicated_report();
        report.roots[0].children.push(ReportNode {
            kind: Some("STORAGE".into()),
            suffix: Some(".data".into()),
            ..Default::default()
        });

        let err = engine
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains(".data"));
        assert_eq!(resource, original);
    }

    #[test]
    fn test_missing_field_becomes_unknown_object() {
        let (mut resource, pools) = loaded();
        let engine = ReconciliationEngine::default();
        let original = resource.clone();

        let mut report = fixtures::replicated_report();
        report.roots[0].children[1].volumes[0].volume_number = None;

        let err = engine
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("volume_number"));
        assert_eq!(resource, original);
    }

    #[test]
    fn test_unknown_volume_is_fatal() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.roots[0].volumes.push(ReportVolume::numbered(7));

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { .. });
    }

    #[test]
    fn test_unknown_encryption_volume_is_fatal() {
        let (mut resource, pools) = loaded();
        let original = resource.clone();
        let mut report = fixtures::replicated_report();
        report.roots[0].children[0]
            .volumes
            .push(ReportVolume::numbered(3));

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("volume 3 on ENCRYPTION"));
        assert_eq!(resource, original);
    }

    #[test]
    fn test_duplicate_volume_is_fatal() {
        let (mut resource, pools) = loaded();
        let original = resource.clone();
        let mut report = fixtures::replicated_report();
        let duplicate = ReportVolume {
            disk_state: Some("Failed".into()),
            ..report.roots[0].volumes[0].clone()
        };
        report.roots[0].volumes.push(duplicate);

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("reported twice"));
        assert_eq!(resource, original);
    }

    #[test]
    fn test_duplicate_layer_is_fatal() {
        let (mut resource, pools) = loaded();
        let original = resource.clone();
        let mut report = fixtures::replicated_report();
        let encryption = report.roots[0].children[0].clone();
        report.roots[0].children.push(encryption);

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("ENCRYPTION layer '' reported twice"));
        assert_eq!(resource, original);
    }

    #[test]
    fn test_encryption_and_storage_absence_tolerated() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.roots[0].children[0].volumes.clear();
        report.roots[0].children[0].children[0].volumes.clear();

        let summary = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap();
        assert_eq!(summary.tolerated_absences, 2);
        assert_eq!(summary.merged_volumes, 2);

        let encryption = storage_leaf(&resource, 2);
        assert_eq!(encryption.facts.device_path, None);
        assert_matches!(&encryption.data, VolumeData::Encryption(data) if !data.opened && data.backing_device.is_none());

        let storage = storage_leaf(&resource, 3);
        assert_eq!(storage.facts.device_path, None);
        assert_eq!(storage.facts.allocated_size_kib, None);
        assert!(!storage.storage().unwrap().exists);
        assert_eq!(storage.storage().unwrap().size_state, None);
    }

    #[test]
    fn test_replication_absence_tolerated() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.roots[0].volumes.clear();

        let summary = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap();
        assert_eq!(summary.tolerated_absences, 1);
        assert_eq!(summary.merged_volumes, 3);
        assert_eq!(storage_leaf(&resource, 1).facts.disk_state, None);
    }

    #[test]
    fn test_unreported_subtree_is_left_alone() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.roots[0].children.truncate(1);

        let summary = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap();
        assert_eq!(summary.merged_volumes, 3);
        assert!(!storage_leaf(&resource, 4).storage().unwrap().exists);
    }

    #[test]
    fn test_remote_attach_absence_is_fatal() {
        let mut ctx = fixtures::load(fixtures::remote_attach_document());
        let key = ResourceKey::new("n2", "r1");
        let mut resource = ctx.resources.remove(&key).unwrap();
        let original = resource.clone();

        let report = SatelliteReport {
            node_name: Some("n2".into()),
            resource_name: Some("r1".into()),
            snapshot_name: None,
            roots: vec![ReportNode {
                kind: Some("REMOTE_ATTACH".into()),
                suffix: Some(String::new()),
                ..Default::default()
            }],
        };

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &FactsMap::new(), &ctx.storage_pools)
            .unwrap_err();
        assert_matches!(err, Error::MissingSatelliteVolume { volume_number: 0, .. });
        assert_eq!(resource, original);
    }

    #[test]
    fn test_diskless_storage_skips_backend_lookup() {
        let mut ctx = fixtures::load(fixtures::remote_attach_document());
        let key = ResourceKey::new("n2", "r1");
        let mut resource = ctx.resources.remove(&key).unwrap();

        let report = SatelliteReport {
            node_name: Some("n2".into()),
            resource_name: Some("r1".into()),
            snapshot_name: None,
            roots: vec![ReportNode {
                kind: Some("REMOTE_ATTACH".into()),
                suffix: Some(String::new()),
                volumes: vec![ReportVolume {
                    device_path: Some("/dev/nvme1n1".into()),
                    ..ReportVolume::numbered(0)
                }],
                children: vec![ReportNode {
                    kind: Some("STORAGE".into()),
                    suffix: Some(String::new()),
                    volumes: vec![ReportVolume {
                        provider: Some("DISKLESS".into()),
                        ..ReportVolume::numbered(0)
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }],
        };

        ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &FactsMap::new(), &ctx.storage_pools)
            .unwrap();
        let storage = storage_leaf(&resource, 12).storage().unwrap();
        assert_eq!(storage.provider, ProviderKind::Diskless);
        assert!(!storage.exists);
        assert_eq!(storage.size_state, None);
        assert!(resource.metadata.diskless);
    }

    #[test]
    fn test_unknown_replication_volume_definition_is_fatal() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        if let Some(definition) = report.roots[0].replication_definition.as_mut() {
            definition.volumes.push(1);
        }

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("volume definition 1"));
    }

    #[test]
    fn test_reported_definition_values_are_discarded() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        if let Some(definition) = report.roots[0].replication_definition.as_mut() {
            definition.port = Some(7999);
            definition.transport = Some("RDMA".into());
        }

        ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap();
        assert_eq!(resource.definition.replication[""].port, 7000);
        assert_eq!(resource.definition.replication[""].transport, "IP");
    }

    #[test]
    fn test_provider_mismatch_is_fatal() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.roots[0].children[1].volumes[0].provider = Some("ZFS".into());

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("persisted as LVM"));
    }

    #[test]
    fn test_unknown_provider_kind_is_fatal() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.roots[0].children[1].volumes[0].provider = Some("EXOS".into());

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref detail, .. } if detail.contains("EXOS"));
    }

    #[test]
    fn test_rewiring_fields_are_ignored() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        let meta = &mut report.roots[0].children[1];
        meta.parent_id = Some(999);
        meta.suspended = Some(true);
        meta.volumes[0].storage_pool = Some("elsewhere".into());

        ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap();
        let node = resource.tree.get(LayerNodeId(4)).unwrap();
        assert_eq!(node.parent, Some(LayerNodeId(1)));
        assert!(!node.suspended);
        assert_eq!(storage_leaf(&resource, 4).storage().unwrap().storage_pool, "lvm1");
    }

    #[test]
    fn test_size_drift_reported() {
        let (mut resource, pools) = loaded();
        let mut facts = fixtures::replicated_facts();
        if let Some(object) = facts.get_mut("r1_00000") {
            object.size_kib = 90_000;
        }

        let summary = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &fixtures::replicated_report(), &facts, &pools)
            .unwrap();
        assert_eq!(
            summary.drift,
            vec![DriftWarning {
                identifier: "r1_00000".into(),
                state: SizeState::TooSmall,
                expected_kib: 102_400,
                actual_kib: 90_000,
            }]
        );
    }

    #[test]
    fn test_missing_backend_object() {
        let (mut resource, pools) = loaded();
        ReconciliationEngine::default()
            .merge_layer_data(
                &mut resource,
                &fixtures::replicated_report(),
                &FactsMap::new(),
                &pools,
            )
            .unwrap();
        let storage = storage_leaf(&resource, 3).storage().unwrap();
        assert!(!storage.exists);
        assert_eq!(storage.size_state, None);
    }

    #[test]
    fn test_report_for_other_resource_is_rejected() {
        let (mut resource, pools) = loaded();
        let mut report = fixtures::replicated_report();
        report.node_name = Some("n9".into());

        let err = ReconciliationEngine::default()
            .merge_layer_data(&mut resource, &report, &fixtures::replicated_facts(), &pools)
            .unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { .. });
    }
}
