//! Backend Object Identifiers
//!
//! Names under which storage providers know a volume. The same name is used
//! when querying facts, so it must be stable across controller restarts.

use crate::layer::{Resource, ResourceKey};
use std::collections::BTreeSet;

/// Backend identifier for one storage volume
///
/// `<resource><suffix>_<volume:05>`, with `_<snapshot>` appended for
/// snapshot resources.
pub fn storage_identifier(key: &ResourceKey, suffix: &str, volume_number: u32) -> String {
    match &key.snapshot_name {
        Some(snapshot) => format!(
            "{}{}_{:05}_{}",
            key.resource_name, suffix, volume_number, snapshot
        ),
        None => format!("{}{}_{:05}", key.resource_name, suffix, volume_number),
    }
}

/// Identifiers of every storage volume of `resource` that has a backend object
pub fn backend_identifiers(resource: &Resource) -> BTreeSet<String> {
    resource
        .tree
        .storage_volumes()
        .filter(|(_, leaf)| {
            leaf.storage()
                .is_some_and(|storage| storage.provider.has_backing_object())
        })
        .map(|(node, leaf)| storage_identifier(&resource.key, &node.suffix, leaf.volume_number))
        .collect()
}
