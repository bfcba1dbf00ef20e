//! Reconciliation
//!
//! Merges satellite reports into persisted layer trees.

pub mod engine;
pub mod layers;
pub mod report;

pub use engine::{DriftWarning, MergeSummary, ReconciliationEngine};
pub use layers::{AbsencePolicy, MergeOutcome};
pub use report::{ReportNode, ReportReplicationDefinition, ReportVolume, SatelliteReport};
