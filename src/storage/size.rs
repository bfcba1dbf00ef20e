//! Size Drift Classifier
//!
//! Compares the controller's expected volume size with the size a backend
//! actually provisioned. Backends round up to their extent size, so a small
//! overshoot is tolerated.

use serde::{Deserialize, Serialize};

/// Default number of extents a volume may overshoot its expected size by
pub const DEFAULT_TOLERANCE_FACTOR: u64 = 3;

/// Result of comparing expected and actual volume size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SizeState {
    AsExpected,
    TooSmall,
    TooLarge,
    TooLargeWithinTolerance,
}

impl SizeState {
    /// Whether this state should be surfaced to operators
    pub fn is_drift(&self) -> bool {
        matches!(self, SizeState::TooSmall | SizeState::TooLarge)
    }
}

impl std::fmt::Display for SizeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SizeState::AsExpected => write!(f, "as-expected"),
            SizeState::TooSmall => write!(f, "too-small"),
            SizeState::TooLarge => write!(f, "too-large"),
            SizeState::TooLargeWithinTolerance => write!(f, "too-large-within-tolerance"),
        }
    }
}

/// Classify an observed size against the expected size
pub fn classify(expected: u64, actual: u64, extent_size: u64, tolerance_factor: u64) -> SizeState {
    if actual == expected {
        SizeState::AsExpected
    } else if actual < expected {
        SizeState::TooSmall
    } else {
        let tolerated = expected.saturating_add(extent_size.saturating_mul(tolerance_factor));
        if actual < tolerated {
            SizeState::TooLargeWithinTolerance
        } else {
            SizeState::TooLarge
        }
    }
}

/// Classifier carrying a configured tolerance factor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeClassifier {
    pub tolerance_factor: u64,
}

impl SizeClassifier {
    pub fn new(tolerance_factor: u64) -> Self {
        Self { tolerance_factor }
    }

    pub fn classify(&self, expected: u64, actual: u64, extent_size: u64) -> SizeState {
        classify(expected, actual, extent_size, self.tolerance_factor)
    }
}

impl Default for SizeClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_TOLERANCE_FACTOR)
    }
}
