//! Controller Service
//!
//! Registry of loaded resources, reconcile service, events and metrics.

pub mod events;
pub mod metrics;
pub mod registry;
pub mod service;

pub use events::ControllerEvent;
pub use metrics::{ReconcileMetrics, ReconcileMetricsSnapshot};
pub use registry::{ResourceHandle, ResourceRegistry};
pub use service::ReconcileService;
