//! Reconcile Service
//!
//! Drives the controller core: loads the persisted graph once, then merges
//! satellite reports one resource at a time. Backend facts are fetched
//! before the resource lock is taken, so a slow backend never blocks other
//! readers of the same resource for longer than the merge itself.

use super::events::ControllerEvent;
use super::metrics::ReconcileMetrics;
use super::registry::ResourceRegistry;
use crate::config::ControllerConfig;
use crate::domain::ports::{RecordStoreRef, StorageProviderAdapter, StorageProviderAdapterRef};
use crate::error::{Error, FaultClass, Result};
use crate::layer::ResourceKey;
use crate::persistence::{flatten, PersistentLoader};
use crate::reconcile::{MergeSummary, ReconciliationEngine, SatelliteReport};
use crate::storage::{backend_identifiers, RetryingAdapter};
use futures::future::join_all;
use indexmap::IndexMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Placeholder name for reports that do not name their resource
const UNNAMED_RESOURCE: &str = "<unnamed>";

pub struct ReconcileService {
    registry: Arc<ResourceRegistry>,
    store: RecordStoreRef,
    adapter: RetryingAdapter,
    engine: ReconciliationEngine,
    metrics: Arc<ReconcileMetrics>,
}

impl ReconcileService {
    pub fn new(
        registry: Arc<ResourceRegistry>,
        store: RecordStoreRef,
        adapter: StorageProviderAdapterRef,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            registry,
            store,
            adapter: RetryingAdapter::new(adapter, config.retry.clone()),
            engine: ReconciliationEngine::new(config.classifier()),
            metrics: Arc::new(ReconcileMetrics::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<ReconcileMetrics> {
        &self.metrics
    }

    /// Load the persisted graph and install it
    ///
    /// Must run before any report is handled; a second call fails.
    pub async fn load(&self) -> Result<usize> {
        if self.registry.is_loaded() {
            return Err(Error::AlreadyLoaded);
        }

        let ctx = PersistentLoader::load_all(self.store.as_ref())
            .await
            .map_err(|err| {
                error!(error = %err, "Loading persisted layer records failed");
                err
            })?;
        let layers = ctx.layer_count();
        let resources = self.registry.install(ctx)?;
        self.metrics.record_load(resources, layers);
        Ok(resources)
    }

    /// Merge one satellite report and persist the result
    pub async fn handle_report(&self, report: &SatelliteReport) -> Result<MergeSummary> {
        let key = match report.resource_key() {
            Ok(key) => key,
            Err(Error::MissingReportField { field }) => {
                let err = Error::UnknownSatelliteObject {
                    resource: UNNAMED_RESOURCE.to_string(),
                    detail: format!("report is missing field '{}'", field),
                };
                self.record_failure(UNNAMED_RESOURCE, &err);
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        match self.reconcile(&key, report).await {
            Ok(summary) => {
                self.record_success(&key, &summary);
                Ok(summary)
            }
            Err(err) => {
                self.record_failure(&key.to_string(), &err);
                Err(err)
            }
        }
    }

    /// Merge several reports concurrently
    ///
    /// Reports for different resources proceed in parallel. Reports for the
    /// same resource are applied one after the other in input order, so a
    /// later report always wins. Results are returned in input order.
    pub async fn handle_reports(&self, reports: &[SatelliteReport]) -> Vec<Result<MergeSummary>> {
        let mut batches: IndexMap<Option<ResourceKey>, Vec<usize>> = IndexMap::new();
        for (index, report) in reports.iter().enumerate() {
            batches
                .entry(report.resource_key().ok())
                .or_default()
                .push(index);
        }

        let batches = batches.into_values().map(|indices| async move {
            let mut results = Vec::with_capacity(indices.len());
            for index in indices {
                results.push((index, self.handle_report(&reports[index]).await));
            }
            results
        });

        let mut results: Vec<(usize, Result<MergeSummary>)> =
            join_all(batches).await.into_iter().flatten().collect();
        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    async fn reconcile(&self, key: &ResourceKey, report: &SatelliteReport) -> Result<MergeSummary> {
        let handle = self.registry.get(key)?;

        let identifiers = backend_identifiers(&*handle.lock().await);
        let facts = self.adapter.get_facts(&identifiers).await?;
        debug!(resource = %key, requested = identifiers.len(), found = facts.len(), "Fetched backend facts");

        let pools = self.registry.pools()?;

        let mut resource = handle.lock().await;
        let mut updated = resource.clone();
        let summary = self
            .engine
            .merge_layer_data(&mut updated, report, &facts, &pools)?;

        let (layers, volumes) = flatten(&updated);
        self.store.save_resource(key, layers, volumes).await?;
        *resource = updated;

        Ok(summary)
    }

    fn record_success(&self, key: &ResourceKey, summary: &MergeSummary) {
        self.metrics.record_merge(summary);
        info!(
            resource = %key,
            merged = summary.merged_volumes,
            tolerated = summary.tolerated_absences,
            changed = summary.changed_fields,
            drift = summary.drift.len(),
            "Applied satellite report"
        );

        let resource = key.to_string();
        self.registry.emit(ControllerEvent::MergeApplied {
            resource: resource.clone(),
            merged_volumes: summary.merged_volumes,
            tolerated_absences: summary.tolerated_absences,
            changed_fields: summary.changed_fields,
        });
        for warning in &summary.drift {
            self.registry.emit(ControllerEvent::SizeDrift {
                resource: resource.clone(),
                identifier: warning.identifier.clone(),
                state: warning.state,
                expected_kib: warning.expected_kib,
                actual_kib: warning.actual_kib,
            });
        }
    }

    fn record_failure(&self, resource: &str, err: &Error) {
        let fault = err.fault_class();
        self.metrics.record_failure(fault);
        match fault {
            FaultClass::ClusterState | FaultClass::Internal => {
                error!(resource, error = %err, ?fault, "Rejected satellite report")
            }
            FaultClass::StorageLayer | FaultClass::Request => {
                warn!(resource, error = %err, ?fault, "Satellite report not applied")
            }
        }
        self.registry.emit(ControllerEvent::MergeFailed {
            resource: resource.to_string(),
            fault,
            reason: err.to_string(),
        });
    }

    /// Refresh capacity of every pool that has backend objects
    pub async fn refresh_free_space(&self) -> Result<usize> {
        let pools = self.registry.pools()?;
        let mut refreshed = 0;
        for (key, pool) in pools.iter() {
            if !pool.provider.has_backing_object() {
                continue;
            }
            let space = self.adapter.get_free_space(key).await?;
            self.registry.update_pool_space(key, space)?;
            refreshed += 1;
        }
        debug!(pools = refreshed, "Refreshed storage pool capacity");
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::FreeSpace;
    use crate::fixtures;
    use crate::layer::{LayerNodeId, StoragePoolKey};
    use crate::persistence::{MemoryRecordStore, RecordDocument};
    use crate::reconcile::ReportVolume;
    use crate::storage::{InMemoryProviderAdapter, RetryConfig, SizeState};
    use assert_matches::assert_matches;

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            retry: RetryConfig {
                max_attempts: 3,
                initial_interval_ms: 1,
                max_interval_ms: 2,
                call_timeout_ms: 1_000,
            },
            ..Default::default()
        }
    }

    fn combined_document() -> RecordDocument {
        let mut doc = fixtures::replicated_document();
        let other = fixtures::remote_attach_document();
        doc.catalog.resources.extend(other.catalog.resources);
        doc.catalog.storage_pools.extend(other.catalog.storage_pools);
        doc.layers.extend(other.layers);
        doc.volumes.extend(other.volumes);
        doc
    }

    fn service(
        document: RecordDocument,
    ) -> (ReconcileService, Arc<MemoryRecordStore>, Arc<InMemoryProviderAdapter>) {
        let store = Arc::new(MemoryRecordStore::new(document));
        let adapter = Arc::new(InMemoryProviderAdapter::with_facts(
            "lvm",
            fixtures::replicated_facts(),
        ));
        let service = ReconcileService::new(
            ResourceRegistry::new(),
            store.clone(),
            adapter.clone(),
            &fast_config(),
        );
        (service, store, adapter)
    }

    #[tokio::test]
    async fn test_report_before_load_is_rejected() {
        let (service, _, _) = service(fixtures::replicated_document());
        let err = service
            .handle_report(&fixtures::replicated_report())
            .await
            .unwrap_err();
        assert_matches!(err, Error::NotLoaded);
    }

    #[tokio::test]
    async fn test_load_only_once() {
        let (service, _, _) = service(fixtures::replicated_document());
        assert_eq!(service.load().await.unwrap(), 1);
        assert_matches!(service.load().await, Err(Error::AlreadyLoaded));
        assert_eq!(service.metrics().snapshot().loaded_layers, 4);
    }

    #[tokio::test]
    async fn test_merge_is_persisted() {
        let (service, store, _) = service(fixtures::replicated_document());
        service.load().await.unwrap();
        let mut events = service.registry().subscribe();

        let summary = service
            .handle_report(&fixtures::replicated_report())
            .await
            .unwrap();
        assert_eq!(summary.merged_volumes, 4);

        let saved = store.snapshot();
        let volume = saved.volumes.iter().find(|v| v.layer_id == 3).unwrap();
        assert_eq!(volume.device_path.as_deref(), Some("/dev/vg0/r1_00000"));
        assert_eq!(volume.usable_size_kib, Some(102_400));

        let handle = service.registry().get(&fixtures::resource_key()).unwrap();
        let resource = handle.lock().await;
        let leaf = resource.tree.get(LayerNodeId(3)).unwrap().volume(0).unwrap();
        assert_eq!(leaf.storage().unwrap().size_state, Some(SizeState::AsExpected));

        assert_matches!(
            events.try_recv(),
            Ok(ControllerEvent::MergeApplied { merged_volumes: 4, .. })
        );
        assert_eq!(service.metrics().snapshot().merges_applied, 1);
    }

    #[tokio::test]
    async fn test_rejected_report_changes_nothing() {
        let (service, store, _) = service(fixtures::replicated_document());
        service.load().await.unwrap();
        let before_store = store.snapshot();
        let handle = service.registry().get(&fixtures::resource_key()).unwrap();
        let before = handle.lock().await.clone();
        let mut events = service.registry().subscribe();

        let mut report = fixtures::replicated_report();
        report.roots[0].volumes.push(ReportVolume::numbered(3));
        let err = service.handle_report(&report).await.unwrap_err();

        assert_matches!(err, Error::UnknownSatelliteObject { .. });
        assert_eq!(*handle.lock().await, before);
        assert_eq!(store.snapshot(), before_store);
        assert_matches!(
            events.try_recv(),
            Ok(ControllerEvent::MergeFailed { fault: FaultClass::ClusterState, .. })
        );
        assert_eq!(service.metrics().snapshot().merges_rejected, 1);
    }

    #[tokio::test]
    async fn test_unnamed_report_is_unknown_object() {
        let (service, _, _) = service(fixtures::replicated_document());
        service.load().await.unwrap();

        let mut report = fixtures::replicated_report();
        report.resource_name = None;
        let err = service.handle_report(&report).await.unwrap_err();
        assert_matches!(err, Error::UnknownSatelliteObject { ref resource, .. } if resource == UNNAMED_RESOURCE);
    }

    #[tokio::test]
    async fn test_transient_backend_failure_is_retried() {
        let (service, _, adapter) = service(fixtures::replicated_document());
        service.load().await.unwrap();

        adapter.fail_next(2);
        service
            .handle_report(&fixtures::replicated_report())
            .await
            .unwrap();
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_backend_outage_leaves_resource_unchanged() {
        let (service, _, adapter) = service(fixtures::replicated_document());
        service.load().await.unwrap();
        let handle = service.registry().get(&fixtures::resource_key()).unwrap();
        let before = handle.lock().await.clone();

        adapter.fail_next(10);
        let err = service
            .handle_report(&fixtures::replicated_report())
            .await
            .unwrap_err();

        assert_matches!(err, Error::BackendUnavailable { .. });
        assert_eq!(err.fault_class(), FaultClass::StorageLayer);
        assert_eq!(*handle.lock().await, before);
        assert_eq!(service.metrics().snapshot().merges_failed, 1);
    }

    #[tokio::test]
    async fn test_reports_for_different_resources() {
        let (service, _, _) = service(combined_document());
        assert_eq!(service.load().await.unwrap(), 2);

        let mut remote = SatelliteReport {
            node_name: Some("n2".into()),
            resource_name: Some("r1".into()),
            ..Default::default()
        };
        remote.roots = vec![crate::reconcile::ReportNode {
            kind: Some("REMOTE_ATTACH".into()),
            suffix: Some(String::new()),
            volumes: vec![ReportVolume {
                device_path: Some("/dev/nvme1n1".into()),
                ..ReportVolume::numbered(0)
            }],
            ..Default::default()
        }];

        let results = service
            .handle_reports(&[fixtures::replicated_report(), remote])
            .await;
        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(service.metrics().snapshot().merges_applied, 2);
    }

    /// Adapter whose first fact query is slower than the ones after it
    struct SlowFirstQuery {
        inner: InMemoryProviderAdapter,
        queries: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl StorageProviderAdapter for SlowFirstQuery {
        async fn get_facts(
            &self,
            identifiers: &std::collections::BTreeSet<String>,
        ) -> Result<crate::domain::ports::FactsMap> {
            let query = self
                .queries
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if query == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
            }
            self.inner.get_facts(identifiers).await
        }

        async fn get_free_space(&self, pool: &StoragePoolKey) -> Result<FreeSpace> {
            self.inner.get_free_space(pool).await
        }

        async fn create(&self, spec: &crate::domain::ports::VolumeSpec) -> Result<()> {
            self.inner.create(spec).await
        }

        async fn resize(&self, spec: &crate::domain::ports::VolumeSpec) -> Result<()> {
            self.inner.resize(spec).await
        }

        async fn delete(&self, identifier: &str) -> Result<()> {
            self.inner.delete(identifier).await
        }

        async fn activate(&self, identifier: &str) -> Result<()> {
            self.inner.activate(identifier).await
        }

        async fn deactivate(&self, identifier: &str) -> Result<()> {
            self.inner.deactivate(identifier).await
        }

        fn backend_name(&self) -> &str {
            self.inner.backend_name()
        }
    }

    #[tokio::test]
    async fn test_reports_for_one_resource_apply_in_order() {
        let store = Arc::new(MemoryRecordStore::new(fixtures::replicated_document()));
        let adapter = Arc::new(SlowFirstQuery {
            inner: InMemoryProviderAdapter::with_facts("lvm", fixtures::replicated_facts()),
            queries: std::sync::atomic::AtomicU32::new(0),
        });
        let service = ReconcileService::new(
            ResourceRegistry::new(),
            store.clone(),
            adapter,
            &fast_config(),
        );
        service.load().await.unwrap();

        let mut older = fixtures::replicated_report();
        older.roots[0].volumes[0].disk_state = Some("Outdated".into());
        let mut newer = fixtures::replicated_report();
        newer.roots[0].volumes[0].disk_state = Some("UpToDate".into());

        let results = service.handle_reports(&[older, newer]).await;
        assert!(results.iter().all(|result| result.is_ok()));
        // the second report only sees changes relative to the first
        assert!(results[1].as_ref().unwrap().changed_fields > 0);

        let handle = service.registry().get(&fixtures::resource_key()).unwrap();
        let resource = handle.lock().await;
        let leaf = resource.tree.get(LayerNodeId(1)).unwrap().volume(0).unwrap();
        assert_eq!(leaf.facts.disk_state.as_deref(), Some("UpToDate"));

        let saved = store.snapshot();
        let volume = saved.volumes.iter().find(|v| v.layer_id == 1).unwrap();
        assert_eq!(volume.disk_state.as_deref(), Some("UpToDate"));
    }

    #[tokio::test]
    async fn test_batch_results_keep_input_order() {
        let (service, _, _) = service(combined_document());
        service.load().await.unwrap();

        let mut unknown = fixtures::replicated_report();
        unknown.roots[0].volumes.push(ReportVolume::numbered(3));
        let mut unnamed = fixtures::replicated_report();
        unnamed.node_name = None;

        let results = service
            .handle_reports(&[unknown, fixtures::replicated_report(), unnamed])
            .await;
        assert_eq!(results.len(), 3);
        assert_matches!(results[0], Err(Error::UnknownSatelliteObject { .. }));
        assert_matches!(results[1], Ok(MergeSummary { merged_volumes: 4, .. }));
        assert_matches!(results[2], Err(Error::UnknownSatelliteObject { ref resource, .. }) if resource == UNNAMED_RESOURCE);
    }

    #[tokio::test]
    async fn test_drift_emits_event() {
        let (service, _, adapter) = service(fixtures::replicated_document());
        service.load().await.unwrap();
        adapter
            .resize(&crate::domain::ports::VolumeSpec {
                identifier: "r1_00000".into(),
                pool: StoragePoolKey::new("n1", "lvm1"),
                size_kib: 204_800,
            })
            .await
            .unwrap();
        let mut events = service.registry().subscribe();

        let summary = service
            .handle_report(&fixtures::replicated_report())
            .await
            .unwrap();
        assert_eq!(summary.drift.len(), 1);

        assert_matches!(events.try_recv(), Ok(ControllerEvent::MergeApplied { .. }));
        assert_matches!(
            events.try_recv(),
            Ok(ControllerEvent::SizeDrift { state: SizeState::TooLarge, actual_kib: 204_800, .. })
        );
    }

    #[tokio::test]
    async fn test_refresh_free_space() {
        let (service, _, adapter) = service(combined_document());
        service.load().await.unwrap();
        let key = StoragePoolKey::new("n1", "lvm1");
        adapter
            .set_pool(
                key.clone(),
                FreeSpace {
                    capacity_kib: 1_000,
                    free_kib: 250,
                },
            )
            .await;

        // The diskless pool on n2 is skipped
        assert_eq!(service.refresh_free_space().await.unwrap(), 1);
        assert_eq!(service.registry().pools().unwrap()[&key].free_kib, 250);
    }
}
