//! Controller Configuration
//!
//! Settings are read from an optional YAML file; command-line flags and
//! environment variables override individual fields afterwards.

use crate::error::{Error, Result};
use crate::storage::{RetryConfig, SizeClassifier, DEFAULT_TOLERANCE_FACTOR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// =============================================================================
// Report Inbox
// =============================================================================

/// Directory polled for satellite report files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InboxConfig {
    pub dir: PathBuf,
    /// Glob pattern matched inside `dir`
    pub pattern: String,
    pub poll_interval_ms: u64,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("inbox"),
            pattern: "*.json".to_string(),
            poll_interval_ms: 1_000,
        }
    }
}

impl InboxConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Full glob pattern for report files
    pub fn glob_pattern(&self) -> String {
        self.dir.join(&self.pattern).to_string_lossy().into_owned()
    }
}

// =============================================================================
// Controller Configuration
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Extents a storage volume may overshoot its expected size by
    pub tolerance_factor: u64,
    /// Backend call timeout and retry policy
    pub retry: RetryConfig,
    /// JSON document holding the persisted records
    pub records_path: PathBuf,
    /// JSON file with backend facts for the in-memory provider
    pub facts_path: Option<PathBuf>,
    pub inbox: InboxConfig,
    /// How often `serve` refreshes storage pool capacity
    pub pool_refresh_interval_ms: u64,
    /// Health server bind address
    pub health_addr: String,
    /// Metrics server bind address
    pub metrics_addr: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tolerance_factor: DEFAULT_TOLERANCE_FACTOR,
            retry: RetryConfig::default(),
            records_path: PathBuf::from("records.json"),
            facts_path: None,
            inbox: InboxConfig::default(),
            pool_refresh_interval_ms: 60_000,
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ControllerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::Configuration(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.call_timeout_ms == 0 {
            return Err(Error::Configuration(
                "retry.call_timeout_ms must be positive".into(),
            ));
        }
        if self.inbox.poll_interval_ms == 0 {
            return Err(Error::Configuration(
                "inbox.poll_interval_ms must be positive".into(),
            ));
        }
        if self.pool_refresh_interval_ms == 0 {
            return Err(Error::Configuration(
                "pool_refresh_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn pool_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.pool_refresh_interval_ms)
    }

    pub fn classifier(&self) -> SizeClassifier {
        SizeClassifier::new(self.tolerance_factor)
    }
}
