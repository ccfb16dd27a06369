//! Relational graph store
//!
//! This module implements the in-memory relational model:
//! - Nodes wrapping shared, patchable payloads, addressable by id, key or payload
//! - Directed edges carrying a typed relationship
//! - Conditional edges that remove themselves once their condition fails
//! - Store events with synchronous or deferred delivery

pub mod config;
pub mod edge;
pub mod event;
pub mod keepalive;
pub mod node;
pub mod relationship;
pub(crate) mod scheduler;
pub mod store;
pub mod types;

use std::cell::RefCell;
use std::rc::Rc;

// Re-export main types
pub use config::StoreConfig;
pub use edge::Edge;
pub use event::{EventFilter, EventKind, EventRecord, StoreCallback, StoreEvent};
pub use keepalive::EdgeCondition;
pub use node::{Node, PayloadCallback};
pub use relationship::{AttachedRelationship, Relationship, RelationshipKind, RelationshipType};
pub use store::{GraphError, GraphResult, NodeRef, RelationalStore};
pub use types::{Delivery, EdgeId, NodeId, SubscriptionId};

/// Wrap a value in the shared cell the store identifies payloads by
pub fn shared<T>(value: T) -> Rc<RefCell<T>> {
    Rc::new(RefCell::new(value))
}
