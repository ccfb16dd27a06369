//! relstore
//!
//! An in-memory relational store: payloads become nodes, nodes are linked by
//! typed relationships, and every change is published on an event bus.
//!
//! # Features
//!
//! - Nodes addressable by id, by caller-supplied key or by payload identity
//! - Directed edges carrying a user-defined [`Relationship`] type
//! - Payload updates through JSON Patch operations
//! - Synchronous or deferred event delivery, drained with
//!   [`RelationalStore::flush`]
//! - Conditional edges that remove themselves when their condition fails
//! - Optional channel of serializable [`EventRecord`]s for tokio consumers
//!
//! ## Example Usage
//!
//! ```rust
//! use relstore::graph::{shared, Relationship, RelationalStore};
//! use relstore::patch::PatchOperation;
//! use serde_json::json;
//!
//! #[derive(Debug)]
//! struct IsFriendOf;
//! impl Relationship for IsFriendOf {}
//!
//! let mut store = RelationalStore::new();
//!
//! let john = shared(json!({ "name": "John" }));
//! let smith = shared(json!({ "name": "Smith" }));
//! store.add_node(john.clone(), None);
//! store.add_node(smith.clone(), Some("smith"));
//!
//! store.add_edge(&john, "smith", IsFriendOf).unwrap();
//! assert!(store.has_relationship::<IsFriendOf>(&john, &smith));
//!
//! store
//!     .patch_node("smith", &[PatchOperation::add("/town", "Leeds")])
//!     .unwrap();
//! assert_eq!(smith.borrow()["town"], "Leeds");
//!
//! // run deferred notifications
//! store.flush();
//! ```

#![allow(missing_docs)]
#![warn(clippy::all)]

pub mod graph;
pub mod index;
pub mod patch;

// Re-export main types for convenience
pub use graph::{
    Delivery, Edge, EdgeId, EventFilter, EventKind, EventRecord, GraphError, GraphResult, Node,
    NodeId, NodeRef, RelationalStore, Relationship, RelationshipKind, StoreConfig, StoreEvent,
    SubscriptionId,
};

pub use index::KeyIndex;

pub use patch::{PatchError, PatchOperation, PatchResult, Patchable};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get version string
pub fn version() -> &'static str {
    VERSION
}
