//! Controller Events
//!
//! Events emitted by the controller for external consumers to react to
//! load and reconciliation results.

use crate::error::FaultClass;
use crate::storage::SizeState;
use serde::{Deserialize, Serialize};

/// Events emitted by the resource registry and reconcile service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerEvent {
    /// The persisted graph was loaded and installed
    ResourcesLoaded {
        resources: usize,
        layers: usize,
        passes: usize,
    },

    /// A satellite report was merged and persisted
    MergeApplied {
        resource: String,
        merged_volumes: usize,
        tolerated_absences: usize,
        changed_fields: usize,
    },

    /// A satellite report was rejected; the resource is unchanged
    MergeFailed {
        resource: String,
        fault: FaultClass,
        reason: String,
    },

    /// A storage volume's backend size is out of tolerance
    SizeDrift {
        resource: String,
        identifier: String,
        state: SizeState,
        expected_kib: u64,
        actual_kib: u64,
    },
}

impl ControllerEvent {
    /// Resource this event is about, if any
    pub fn resource(&self) -> Option<&str> {
        match self {
            ControllerEvent::ResourcesLoaded { .. } => None,
            ControllerEvent::MergeApplied { resource, .. } => Some(resource),
            ControllerEvent::MergeFailed { resource, .. } => Some(resource),
            ControllerEvent::SizeDrift { resource, .. } => Some(resource),
        }
    }

    /// Check if this event reports a problem
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            ControllerEvent::MergeFailed { .. } | ControllerEvent::SizeDrift { .. }
        )
    }
}
