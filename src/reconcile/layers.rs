//! Per-Kind Merge Steps
//!
//! Each layer kind decides which reported facts it copies and how it treats
//! a persisted volume the satellite did not report. Controller-authored
//! fields (expected size, pool assignment, replication settings) are never
//! taken from a report.

use super::engine::{DriftWarning, MergeSummary};
use super::report::{require, ReportNode, ReportVolume};
use crate::domain::ports::FactsMap;
use crate::error::{Error, Result};
use crate::layer::{
    LayerKind, LayerNode, ProviderAttributes, ProviderKind, ResourceDefinition, ResourceKey,
    StoragePoolIndex, StoragePoolKey, StorageVolumeData, VolumeData, VolumeFacts,
};
use crate::storage::{storage_identifier, SizeClassifier, SizeState};
use std::collections::BTreeSet;
use tracing::debug;

// =============================================================================
// Absence Handling
// =============================================================================

/// How a layer kind treats a persisted volume missing from a report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbsencePolicy {
    /// The layer may not have created the volume yet
    Tolerate,
    /// The volume must exist once the layer is applied
    Fatal,
}

impl AbsencePolicy {
    pub fn for_kind(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Replication | LayerKind::Encryption | LayerKind::Storage => {
                AbsencePolicy::Tolerate
            }
            LayerKind::RemoteAttach => AbsencePolicy::Fatal,
        }
    }

    pub fn outcome(self) -> MergeOutcome {
        match self {
            AbsencePolicy::Tolerate => MergeOutcome::AbsentTolerated,
            AbsencePolicy::Fatal => MergeOutcome::AbsentFatal,
        }
    }
}

/// Result of merging one persisted volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged,
    AbsentTolerated,
    AbsentFatal,
}

// =============================================================================
// Merge Context
// =============================================================================

/// Read-only inputs shared by all merge steps of one resource
pub struct LayerContext<'a> {
    pub key: &'a ResourceKey,
    pub definition: &'a ResourceDefinition,
    pub pools: &'a StoragePoolIndex,
    pub facts: &'a FactsMap,
    pub classifier: &'a SizeClassifier,
}

impl LayerContext<'_> {
    pub fn unknown(&self, detail: impl Into<String>) -> Error {
        Error::UnknownSatelliteObject {
            resource: self.key.to_string(),
            detail: detail.into(),
        }
    }
}

/// Overwrite `slot` and count it when the value differs
fn assign<T: PartialEq>(slot: &mut T, value: T) -> usize {
    if *slot == value {
        0
    } else {
        *slot = value;
        1
    }
}

// =============================================================================
// Node Merge
// =============================================================================

/// Merge one reported node into its matched persisted node
pub fn merge_node(
    ctx: &LayerContext<'_>,
    node: &mut LayerNode,
    reported: &ReportNode,
    summary: &mut MergeSummary,
) -> Result<()> {
    let kind = node.kind();
    match kind {
        LayerKind::Replication => check_replication_definition(ctx, &node.suffix, reported)?,
        LayerKind::Encryption | LayerKind::RemoteAttach | LayerKind::Storage => {
            if reported.replication_definition.is_some() {
                return Err(ctx.unknown(format!(
                    "replication definition on {} layer '{}'",
                    kind, node.suffix
                )));
            }
        }
    }

    let outcomes = merge_volumes(ctx, node, &reported.volumes, summary)?;

    for (volume_number, outcome) in outcomes {
        match outcome {
            MergeOutcome::Merged => summary.merged_volumes += 1,
            MergeOutcome::AbsentTolerated => {
                debug!(
                    resource = %ctx.key,
                    layer = %kind,
                    suffix = %node.suffix,
                    volume = volume_number,
                    "Volume not reported yet, keeping persisted state"
                );
                summary.tolerated_absences += 1;
            }
            MergeOutcome::AbsentFatal => {
                return Err(Error::MissingSatelliteVolume {
                    resource: ctx.key.to_string(),
                    layer: format!("{} '{}'", kind, node.suffix),
                    volume_number,
                });
            }
        }
    }

    Ok(())
}

/// Definition-level settings are read-only; the report only has to agree
/// with what the controller knows
fn check_replication_definition(
    ctx: &LayerContext<'_>,
    suffix: &str,
    reported: &ReportNode,
) -> Result<()> {
    let definition = ctx.definition.replication.get(suffix).ok_or_else(|| {
        ctx.unknown(format!("replication definition for suffix '{}'", suffix))
    })?;

    if let Some(reported_definition) = &reported.replication_definition {
        for volume_number in &reported_definition.volumes {
            if !definition.volumes.contains_key(volume_number) {
                return Err(ctx.unknown(format!(
                    "replication volume definition {} for suffix '{}'",
                    volume_number, suffix
                )));
            }
        }
    }

    Ok(())
}

fn merge_volumes(
    ctx: &LayerContext<'_>,
    node: &mut LayerNode,
    reported: &[ReportVolume],
    summary: &mut MergeSummary,
) -> Result<Vec<(u32, MergeOutcome)>> {
    let kind = node.kind();
    let policy = AbsencePolicy::for_kind(kind);
    let LayerNode {
        suffix, volumes, ..
    } = node;

    let mut seen = BTreeSet::new();
    for volume in reported {
        let volume_number = require(volume.volume_number, "volume_number")?;
        let leaf = volumes.get_mut(&volume_number).ok_or_else(|| {
            ctx.unknown(format!(
                "volume {} on {} layer '{}'",
                volume_number, kind, suffix
            ))
        })?;
        if !seen.insert(volume_number) {
            return Err(ctx.unknown(format!(
                "volume {} on {} layer '{}' reported twice",
                volume_number, kind, suffix
            )));
        }

        let changed = match &mut leaf.data {
            VolumeData::Replication(data) => {
                copy_facts(&mut leaf.facts, volume, true)
                    + assign(&mut data.meta_disk_path, volume.meta_disk_path.clone())
            }
            VolumeData::Encryption(data) => {
                copy_facts(&mut leaf.facts, volume, true)
                    + assign(&mut data.backing_device, volume.backing_device.clone())
                    + assign(&mut data.opened, volume.opened.unwrap_or(false))
            }
            VolumeData::RemoteAttach => copy_facts(&mut leaf.facts, volume, true),
            VolumeData::Storage(data) => {
                let identifier = storage_identifier(ctx.key, suffix, volume_number);
                copy_facts(&mut leaf.facts, volume, false)
                    + merge_storage(
                        ctx,
                        &identifier,
                        leaf.expected_size_kib,
                        data,
                        volume,
                        summary,
                    )?
            }
        };
        summary.changed_fields += changed;
    }

    Ok(volumes
        .keys()
        .map(|volume_number| {
            let outcome = if seen.contains(volume_number) {
                MergeOutcome::Merged
            } else {
                policy.outcome()
            };
            (*volume_number, outcome)
        })
        .collect())
}

/// Copy the physical facts common to all kinds
fn copy_facts(facts: &mut VolumeFacts, reported: &ReportVolume, with_disk_state: bool) -> usize {
    let mut changed = assign(&mut facts.device_path, reported.device_path.clone())
        + assign(&mut facts.allocated_size_kib, reported.allocated_size_kib)
        + assign(&mut facts.usable_size_kib, reported.usable_size_kib);
    if with_disk_state {
        changed += assign(&mut facts.disk_state, reported.disk_state.clone());
    }
    changed
}

// =============================================================================
// Storage Providers
// =============================================================================

fn merge_storage(
    ctx: &LayerContext<'_>,
    identifier: &str,
    expected_size_kib: u64,
    data: &mut StorageVolumeData,
    reported: &ReportVolume,
    summary: &mut MergeSummary,
) -> Result<usize> {
    let provider_name = require(reported.provider.as_deref(), "provider")?;
    let provider = ProviderKind::parse(provider_name).ok_or_else(|| {
        ctx.unknown(format!(
            "storage provider kind '{}' for {}",
            provider_name, identifier
        ))
    })?;
    if provider != data.provider {
        return Err(ctx.unknown(format!(
            "{} reported as {} but persisted as {}",
            identifier, provider, data.provider
        )));
    }

    let attributes = ProviderAttributes::from_fields(provider, &reported.attributes);
    let (exists, size_state) = observe_backend(ctx, identifier, expected_size_kib, data, summary)?;

    Ok(assign(&mut data.attributes, attributes)
        + assign(&mut data.exists, exists)
        + assign(&mut data.size_state, size_state))
}

/// Look up the backend object and classify its size
fn observe_backend(
    ctx: &LayerContext<'_>,
    identifier: &str,
    expected_size_kib: u64,
    data: &StorageVolumeData,
    summary: &mut MergeSummary,
) -> Result<(bool, Option<SizeState>)> {
    if !data.provider.has_backing_object() {
        return Ok((false, None));
    }

    let Some(facts) = ctx.facts.get(identifier).filter(|facts| facts.exists) else {
        return Ok((false, None));
    };

    let pool_key = StoragePoolKey::new(ctx.key.node_name.clone(), data.storage_pool.clone());
    let pool = ctx
        .pools
        .get(&pool_key)
        .ok_or_else(|| Error::Internal(format!("storage pool {} is not indexed", pool_key)))?;

    let state = ctx
        .classifier
        .classify(expected_size_kib, facts.size_kib, pool.extent_size_kib);
    if state.is_drift() {
        summary.drift.push(DriftWarning {
            identifier: identifier.to_string(),
            state,
            expected_kib: expected_size_kib,
            actual_kib: facts.size_kib,
        });
    }

    Ok((true, Some(state)))
}
