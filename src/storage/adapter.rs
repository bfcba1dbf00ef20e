//! Storage Provider Adapters
//!
//! [`RetryingAdapter`] wraps any provider with a per-call timeout and bounded
//! exponential retry of transient failures. [`InMemoryProviderAdapter`] keeps
//! facts in memory and backs tests and file-driven controller runs.

use crate::domain::ports::{
    FactsMap, FreeSpace, ProviderFacts, StorageProviderAdapter, StorageProviderAdapterRef,
    VolumeSpec,
};
use crate::error::{Error, Result};
use crate::layer::StoragePoolKey;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// =============================================================================
// Retry Configuration
// =============================================================================

/// Retry and timeout settings for backend calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first
    pub max_attempts: u32,
    /// First backoff interval in milliseconds
    pub initial_interval_ms: u64,
    /// Upper bound for one backoff interval in milliseconds
    pub max_interval_ms: u64,
    /// Timeout applied to each individual attempt in milliseconds
    pub call_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_ms: 200,
            max_interval_ms: 2_000,
            call_timeout_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

// =============================================================================
// Retrying Adapter
// =============================================================================

/// Adapter decorator adding timeouts and bounded retries
pub struct RetryingAdapter {
    inner: StorageProviderAdapterRef,
    config: RetryConfig,
}

impl RetryingAdapter {
    pub fn new(inner: StorageProviderAdapterRef, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run one backend operation under the retry policy
    async fn call<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_interval_ms))
            .with_max_interval(Duration::from_millis(self.config.max_interval_ms))
            .with_max_elapsed_time(None)
            .build();

        let max_attempts = self.config.max_attempts.max(1);
        let timeout = self.config.call_timeout();
        let backend = self.inner.backend_name();
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        backoff::future::retry(policy, || {
            let fut = op();
            async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let result = match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::BackendTimeout {
                        backend: backend.to_string(),
                        operation: operation.to_string(),
                        timeout,
                    }),
                };

                result.map_err(|err| {
                    if err.is_transient() && attempt < max_attempts {
                        warn!(
                            backend,
                            operation,
                            attempt,
                            max_attempts,
                            error = %err,
                            "Transient storage backend failure, retrying"
                        );
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        })
        .await
    }
}

#[async_trait]
impl StorageProviderAdapter for RetryingAdapter {
    async fn get_facts(&self, identifiers: &BTreeSet<String>) -> Result<FactsMap> {
        self.call("get_facts", || self.inner.get_facts(identifiers)).await
    }

    async fn get_free_space(&self, pool: &StoragePoolKey) -> Result<FreeSpace> {
        self.call("get_free_space", || self.inner.get_free_space(pool))
            .await
    }

    async fn create(&self, spec: &VolumeSpec) -> Result<()> {
        self.call("create", || self.inner.create(spec)).await
    }

    async fn resize(&self, spec: &VolumeSpec) -> Result<()> {
        self.call("resize", || self.inner.resize(spec)).await
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.call("delete", || self.inner.delete(identifier)).await
    }

    async fn activate(&self, identifier: &str) -> Result<()> {
        self.call("activate", || self.inner.activate(identifier)).await
    }

    async fn deactivate(&self, identifier: &str) -> Result<()> {
        self.call("deactivate", || self.inner.deactivate(identifier))
            .await
    }

    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }
}

// =============================================================================
// In-Memory Adapter
// =============================================================================

/// Provider that keeps backend objects in memory
pub struct InMemoryProviderAdapter {
    name: String,
    objects: RwLock<FactsMap>,
    pools: RwLock<BTreeMap<StoragePoolKey, FreeSpace>>,
    /// Number of upcoming calls that fail as unavailable
    failures_pending: AtomicU32,
    calls: AtomicU32,
}

impl InMemoryProviderAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_facts(name, FactsMap::new())
    }

    pub fn with_facts(name: impl Into<String>, facts: FactsMap) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(facts),
            pools: RwLock::new(BTreeMap::new()),
            failures_pending: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Load backend objects from a JSON map of identifier to facts
    pub async fn from_json_file(name: impl Into<String>, path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let facts: FactsMap = serde_json::from_slice(&bytes)?;
        let adapter = Self::with_facts(name, facts);
        info!(backend = %adapter.name, path = %path.display(), "Loaded backend facts");
        Ok(adapter)
    }

    pub async fn set_pool(&self, pool: StoragePoolKey, space: FreeSpace) {
        self.pools.write().await.insert(pool, space);
    }

    /// Make the next `count` calls fail with a transient error (for testing)
    pub fn fail_next(&self, count: u32) {
        self.failures_pending.store(count, Ordering::Relaxed);
    }

    /// Total calls received, including failed ones
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }

    fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let pending = self.failures_pending.load(Ordering::Relaxed);
        if pending > 0 {
            self.failures_pending.store(pending - 1, Ordering::Relaxed);
            return Err(Error::BackendUnavailable {
                backend: self.name.clone(),
            });
        }
        Ok(())
    }

    fn not_found(&self, operation: &str, identifier: &str) -> Error {
        Error::BackendOperationFailed {
            backend: self.name.clone(),
            operation: operation.to_string(),
            reason: format!("no such object: {}", identifier),
        }
    }
}

#[async_trait]
impl StorageProviderAdapter for InMemoryProviderAdapter {
    async fn get_facts(&self, identifiers: &BTreeSet<String>) -> Result<FactsMap> {
        self.enter()?;
        let objects = self.objects.read().await;
        Ok(identifiers
            .iter()
            .filter_map(|id| objects.get(id).map(|facts| (id.clone(), facts.clone())))
            .collect())
    }

    async fn get_free_space(&self, pool: &StoragePoolKey) -> Result<FreeSpace> {
        self.enter()?;
        self.pools
            .read()
            .await
            .get(pool)
            .copied()
            .ok_or_else(|| self.not_found("get_free_space", &pool.to_string()))
    }

    async fn create(&self, spec: &VolumeSpec) -> Result<()> {
        self.enter()?;
        info!(backend = %self.name, identifier = %spec.identifier, size_kib = spec.size_kib, "Creating backend object");
        self.objects.write().await.insert(
            spec.identifier.clone(),
            ProviderFacts {
                exists: true,
                path: None,
                size_kib: spec.size_kib,
                attributes: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn resize(&self, spec: &VolumeSpec) -> Result<()> {
        self.enter()?;
        let mut objects = self.objects.write().await;
        let facts = objects
            .get_mut(&spec.identifier)
            .ok_or_else(|| self.not_found("resize", &spec.identifier))?;
        facts.size_kib = spec.size_kib;
        Ok(())
    }

    async fn delete(&self, identifier: &str) -> Result<()> {
        self.enter()?;
        debug!(backend = %self.name, identifier, "Deleting backend object");
        self.objects
            .write()
            .await
            .remove(identifier)
            .map(|_| ())
            .ok_or_else(|| self.not_found("delete", identifier))
    }

    async fn activate(&self, identifier: &str) -> Result<()> {
        self.enter()?;
        let mut objects = self.objects.write().await;
        let facts = objects
            .get_mut(identifier)
            .ok_or_else(|| self.not_found("activate", identifier))?;
        facts.path = Some(format!("/dev/{}/{}", self.name, identifier));
        Ok(())
    }

    async fn deactivate(&self, identifier: &str) -> Result<()> {
        self.enter()?;
        let mut objects = self.objects.write().await;
        let facts = objects
            .get_mut(identifier)
            .ok_or_else(|| self.not_found("deactivate", identifier))?;
        facts.path = None;
        Ok(())
    }

    fn backend_name(&self) -> &str {
        &self.name
    }
}
