//! Storage Provider Layer
//!
//! Size-drift classification, backend identifiers, and provider adapters
//! supplying per-volume facts.

pub mod adapter;
pub mod identifier;
pub mod size;

pub use adapter::{InMemoryProviderAdapter, RetryConfig, RetryingAdapter};
pub use identifier::{backend_identifiers, storage_identifier};
pub use size::{classify, SizeClassifier, SizeState, DEFAULT_TOLERANCE_FACTOR};
