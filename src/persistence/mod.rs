//! Persistence
//!
//! Flat record types, record stores, and the loader/flattener pair that
//! converts between rows and layer trees.

pub mod flatten;
pub mod loader;
pub mod record;
pub mod store;

pub use flatten::flatten;
pub use loader::{LoadContext, PersistentLoader};
pub use record::{
    LayerRecord, ObjectCatalog, RecordDocument, ResourceRecord, VolumePayloadRecord, VolumeRecord,
};
pub use store::{JsonFileRecordStore, MemoryRecordStore};
