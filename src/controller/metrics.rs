//! Reconcile Metrics
//!
//! Lock-free counters updated on every load and merge, with a snapshot for
//! callers and Prometheus text exposition for the metrics endpoint.

use crate::error::{Error, FaultClass, Result};
use crate::reconcile::MergeSummary;
use chrono::Utc;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicU64, Ordering};

/// Metric name prefix
const PREFIX: &str = "layerstack";

// =============================================================================
// Reconcile Metrics
// =============================================================================

#[derive(Debug, Default)]
pub struct ReconcileMetrics {
    /// Resources installed by the last load
    pub loaded_resources: AtomicU64,
    /// Layer nodes installed by the last load
    pub loaded_layers: AtomicU64,
    pub merges_applied: AtomicU64,
    /// Merges rejected because of bad cluster state
    pub merges_rejected: AtomicU64,
    /// Merges that failed in the storage layer or while persisting
    pub merges_failed: AtomicU64,
    pub tolerated_absences: AtomicU64,
    pub changed_fields: AtomicU64,
    pub drift_warnings: AtomicU64,
    /// Last merge timestamp (Unix millis)
    pub last_merge_ms: AtomicU64,
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_load(&self, resources: usize, layers: usize) {
        self.loaded_resources.store(resources as u64, Ordering::Relaxed);
        self.loaded_layers.store(layers as u64, Ordering::Relaxed);
    }

    /// Record a successful merge
    pub fn record_merge(&self, summary: &MergeSummary) {
        self.merges_applied.fetch_add(1, Ordering::Relaxed);
        self.tolerated_absences
            .fetch_add(summary.tolerated_absences as u64, Ordering::Relaxed);
        self.changed_fields
            .fetch_add(summary.changed_fields as u64, Ordering::Relaxed);
        self.drift_warnings
            .fetch_add(summary.drift.len() as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Record a failed merge
    pub fn record_failure(&self, fault: FaultClass) {
        match fault {
            FaultClass::ClusterState => self.merges_rejected.fetch_add(1, Ordering::Relaxed),
            FaultClass::StorageLayer | FaultClass::Request | FaultClass::Internal => {
                self.merges_failed.fetch_add(1, Ordering::Relaxed)
            }
        };
        self.touch();
    }

    #[inline]
    fn touch(&self) {
        self.last_merge_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    pub fn snapshot(&self) -> ReconcileMetricsSnapshot {
        ReconcileMetricsSnapshot {
            loaded_resources: self.loaded_resources.load(Ordering::Relaxed),
            loaded_layers: self.loaded_layers.load(Ordering::Relaxed),
            merges_applied: self.merges_applied.load(Ordering::Relaxed),
            merges_rejected: self.merges_rejected.load(Ordering::Relaxed),
            merges_failed: self.merges_failed.load(Ordering::Relaxed),
            tolerated_absences: self.tolerated_absences.load(Ordering::Relaxed),
            changed_fields: self.changed_fields.load(Ordering::Relaxed),
            drift_warnings: self.drift_warnings.load(Ordering::Relaxed),
        }
    }

    /// Render all counters in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let snapshot = self.snapshot();
        let registry = Registry::new();

        let gauges = [
            ("loaded_resources", "Resources installed by the last load", snapshot.loaded_resources),
            ("loaded_layers", "Layer nodes installed by the last load", snapshot.loaded_layers),
        ];
        for (name, help, value) in gauges {
            let gauge = IntGauge::new(format!("{}_{}", PREFIX, name), help).map_err(metrics_error)?;
            gauge.set(value as i64);
            registry.register(Box::new(gauge)).map_err(metrics_error)?;
        }

        let counters = [
            ("merges_applied_total", "Satellite reports merged", snapshot.merges_applied),
            ("merges_rejected_total", "Satellite reports rejected as inconsistent", snapshot.merges_rejected),
            ("merges_failed_total", "Merges failed in the storage layer", snapshot.merges_failed),
            ("tolerated_absences_total", "Persisted volumes missing from reports", snapshot.tolerated_absences),
            ("changed_fields_total", "Fields changed by merges", snapshot.changed_fields),
            ("size_drift_total", "Storage volumes with out-of-tolerance size", snapshot.drift_warnings),
        ];
        for (name, help, value) in counters {
            let counter = IntCounter::new(format!("{}_{}", PREFIX, name), help).map_err(metrics_error)?;
            counter.inc_by(value);
            registry.register(Box::new(counter)).map_err(metrics_error)?;
        }

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }
}

fn metrics_error(err: prometheus::Error) -> Error {
    Error::Internal(format!("Metrics encoding failed: {}", err))
}

// =============================================================================
// Snapshot
// =============================================================================

/// Point-in-time snapshot of reconcile metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileMetricsSnapshot {
    pub loaded_resources: u64,
    pub loaded_layers: u64,
    pub merges_applied: u64,
    pub merges_rejected: u64,
    pub merges_failed: u64,
    pub tolerated_absences: u64,
    pub changed_fields: u64,
    pub drift_warnings: u64,
}

impl ReconcileMetricsSnapshot {
    /// Total merges attempted
    pub fn total_merges(&self) -> u64 {
        self.merges_applied + self.merges_rejected + self.merges_failed
    }
}
