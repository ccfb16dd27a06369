//! Store events
//!
//! Every structural change and every payload patch is announced as a
//! [`StoreEvent`]. Subscribers register for one [`EventKind`] or for all of
//! them via [`EventFilter::Any`].

use super::edge::Edge;
use super::keepalive::Keepalive;
use super::store::RelationalStore;
use super::types::{EdgeId, NodeId};
use crate::patch::PatchOperation;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// Event type names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "node:added")]
    NodeAdded,
    #[serde(rename = "node:removed")]
    NodeRemoved,
    #[serde(rename = "node:data:updated")]
    NodeDataUpdated,
    #[serde(rename = "edge:added")]
    EdgeAdded,
    #[serde(rename = "edge:removed")]
    EdgeRemoved,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::NodeAdded,
        EventKind::NodeRemoved,
        EventKind::NodeDataUpdated,
        EventKind::EdgeAdded,
        EventKind::EdgeRemoved,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NodeAdded => "node:added",
            EventKind::NodeRemoved => "node:removed",
            EventKind::NodeDataUpdated => "node:data:updated",
            EventKind::EdgeAdded => "edge:added",
            EventKind::EdgeRemoved => "edge:removed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which events a subscription receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFilter {
    /// Wildcard
    Any,
    Kind(EventKind),
}

impl From<EventKind> for EventFilter {
    fn from(kind: EventKind) -> Self {
        EventFilter::Kind(kind)
    }
}

/// A change announced by the store
#[derive(Debug)]
pub enum StoreEvent<T> {
    NodeAdded {
        node: NodeId,
        payload: Rc<RefCell<T>>,
    },
    /// The node is gone from the store; `edges` are the edges it had
    NodeRemoved {
        node: NodeId,
        payload: Rc<RefCell<T>>,
        key: Option<String>,
        edges: Vec<Rc<Edge>>,
    },
    NodeDataUpdated {
        node: NodeId,
        payload: Rc<RefCell<T>>,
        operations: Rc<[PatchOperation]>,
    },
    EdgeAdded {
        edge: Rc<Edge>,
    },
    EdgeRemoved {
        edge: Rc<Edge>,
    },
}

impl<T> StoreEvent<T> {
    pub fn kind(&self) -> EventKind {
        match self {
            StoreEvent::NodeAdded { .. } => EventKind::NodeAdded,
            StoreEvent::NodeRemoved { .. } => EventKind::NodeRemoved,
            StoreEvent::NodeDataUpdated { .. } => EventKind::NodeDataUpdated,
            StoreEvent::EdgeAdded { .. } => EventKind::EdgeAdded,
            StoreEvent::EdgeRemoved { .. } => EventKind::EdgeRemoved,
        }
    }

    /// Node the event is about, for node events
    pub fn node(&self) -> Option<NodeId> {
        match self {
            StoreEvent::NodeAdded { node, .. }
            | StoreEvent::NodeRemoved { node, .. }
            | StoreEvent::NodeDataUpdated { node, .. } => Some(*node),
            StoreEvent::EdgeAdded { .. } | StoreEvent::EdgeRemoved { .. } => None,
        }
    }

    /// Edge the event is about, for edge events
    pub fn edge(&self) -> Option<&Rc<Edge>> {
        match self {
            StoreEvent::EdgeAdded { edge } | StoreEvent::EdgeRemoved { edge } => Some(edge),
            _ => None,
        }
    }

    /// Thread-safe, serializable snapshot of this event
    pub fn record(&self) -> EventRecord {
        let mut record = EventRecord {
            kind: self.kind(),
            node: self.node(),
            edge: None,
            source: None,
            target: None,
            relationship: None,
            removed_edges: Vec::new(),
            operations: Vec::new(),
        };

        match self {
            StoreEvent::EdgeAdded { edge } | StoreEvent::EdgeRemoved { edge } => {
                record.edge = Some(edge.id);
                record.source = Some(edge.source);
                record.target = Some(edge.target);
                record.relationship = Some(edge.kind().short_name().to_string());
            }
            StoreEvent::NodeRemoved { edges, .. } => {
                record.removed_edges = edges.iter().map(|edge| edge.id).collect();
            }
            StoreEvent::NodeDataUpdated { operations, .. } => {
                record.operations = operations.to_vec();
            }
            StoreEvent::NodeAdded { .. } => {}
        }
        record
    }
}

/// Detached copy of a [`StoreEvent`], sent on the store's event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge: Option<EdgeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed_edges: Vec<EdgeId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operations: Vec<PatchOperation>,
}

/// Store-level subscriber. Receives a read-only view of the store.
pub type StoreCallback<T> = Rc<dyn Fn(&RelationalStore<T>, &StoreEvent<T>)>;

pub(crate) enum Listener<T> {
    Callback(StoreCallback<T>),
    Keepalive(Rc<RefCell<Keepalive<T>>>),
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        match self {
            Listener::Callback(callback) => Listener::Callback(Rc::clone(callback)),
            Listener::Keepalive(keepalive) => Listener::Keepalive(Rc::clone(keepalive)),
        }
    }
}
