//! Layer Data Model
//!
//! In-memory representation of a resource's layer stack: typed nodes in a
//! per-resource arena, each carrying per-volume leaves.

pub mod kind;
pub mod node;
pub mod resource;
pub mod tree;

pub use kind::*;
pub use node::*;
pub use resource::*;
pub use tree::*;
