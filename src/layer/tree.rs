//! Layer Tree Arena
//!
//! Stores all nodes of one resource in an arena keyed by surrogate id.
//! Children are owned arena entries; the parent link is an index, so the
//! whole tree can be dropped as a unit.

use super::kind::LayerKind;
use super::node::{LayerNode, LayerNodeId, VolumeLeaf};
use crate::error::{Error, Result};
use indexmap::IndexMap;

/// Arena of layer nodes forming one resource's (possibly multi-rooted) tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LayerTree {
    nodes: IndexMap<LayerNodeId, LayerNode>,
    roots: Vec<LayerNodeId>,
}

impl LayerTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[LayerNodeId] {
        &self.roots
    }

    pub fn contains(&self, id: LayerNodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn get(&self, id: LayerNodeId) -> Option<&LayerNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: LayerNodeId) -> Option<&mut LayerNode> {
        self.nodes.get_mut(&id)
    }

    /// Nodes in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &LayerNode> {
        self.nodes.values()
    }

    /// Insert a top-level node
    pub fn insert_root(&mut self, mut node: LayerNode) -> Result<LayerNodeId> {
        let id = node.id;
        self.check_vacant(id)?;
        node.parent = None;
        node.children.clear();
        self.nodes.insert(id, node);
        self.roots.push(id);
        Ok(id)
    }

    /// Insert a node below an already present parent
    pub fn insert_child(&mut self, parent: LayerNodeId, mut node: LayerNode) -> Result<LayerNodeId> {
        let id = node.id;
        self.check_vacant(id)?;
        let parent_node = self.nodes.get_mut(&parent).ok_or(Error::DanglingParent {
            record_id: id.0,
            parent_id: parent.0,
        })?;
        parent_node.children.push(id);
        node.parent = Some(parent);
        node.children.clear();
        self.nodes.insert(id, node);
        Ok(id)
    }

    fn check_vacant(&self, id: LayerNodeId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::LoadInconsistency(format!(
                "layer node {} inserted twice",
                id
            )));
        }
        Ok(())
    }

    /// Children of a node, in attach order
    pub fn children(&self, id: LayerNodeId) -> impl Iterator<Item = &LayerNode> {
        self.nodes
            .get(&id)
            .map(|node| node.children.as_slice())
            .unwrap_or(&[])
            .iter()
            .filter_map(|child| self.nodes.get(child))
    }

    pub fn find_root(&self, kind: LayerKind, suffix: &str) -> Option<LayerNodeId> {
        self.roots.iter().copied().find(|id| {
            self.nodes
                .get(id)
                .is_some_and(|node| node.kind() == kind && node.suffix == suffix)
        })
    }

    pub fn find_child(&self, parent: LayerNodeId, kind: LayerKind, suffix: &str) -> Option<LayerNodeId> {
        self.children(parent)
            .find(|node| node.kind() == kind && node.suffix == suffix)
            .map(|node| node.id)
    }

    /// Depth-first, parent-before-child traversal over all roots
    pub fn pre_order(&self) -> Vec<LayerNodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<LayerNodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                order.push(id);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        order
    }

    /// Depth of a node (roots are at depth 0)
    pub fn depth(&self, id: LayerNodeId) -> Option<usize> {
        let mut node = self.nodes.get(&id)?;
        let mut depth = 0;
        while let Some(parent) = node.parent {
            node = self.nodes.get(&parent)?;
            depth += 1;
        }
        Some(depth)
    }

    /// All storage-layer volumes with the suffix of their owning node
    pub fn storage_volumes(&self) -> impl Iterator<Item = (&LayerNode, &VolumeLeaf)> {
        self.nodes
            .values()
            .filter(|node| node.kind() == LayerKind::Storage)
            .flat_map(|node| node.volumes.values().map(move |leaf| (node, leaf)))
    }
}
