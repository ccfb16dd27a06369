//! Edge implementation
//!
//! An edge pairs a source node, a target node and exactly one bound
//! relationship. It refers to its endpoints by handle and never owns them;
//! the store owns the edge.

use super::relationship::{AttachedRelationship, Relationship, RelationshipKind};
use super::types::{EdgeId, NodeId};

/// A directed, typed connection between two nodes
#[derive(Debug)]
pub struct Edge {
    /// Unique identifier for this edge
    pub id: EdgeId,

    /// Source node (edge goes FROM this node)
    pub source: NodeId,

    /// Target node (edge goes TO this node)
    pub target: NodeId,

    relationship: AttachedRelationship,
}

impl Edge {
    /// Create an edge, binding `relationship` to it
    pub fn new(id: EdgeId, source: NodeId, target: NodeId, relationship: Box<dyn Relationship>) -> Self {
        Edge {
            id,
            source,
            target,
            relationship: AttachedRelationship::bind(relationship, id),
        }
    }

    pub fn relationship(&self) -> &AttachedRelationship {
        &self.relationship
    }

    pub fn kind(&self) -> RelationshipKind {
        self.relationship.kind()
    }

    /// Check if this edge's relationship is of type `R`
    pub fn is<R: Relationship>(&self) -> bool {
        self.relationship.is::<R>()
    }

    /// True if the edge joins `a` and `b`, whichever way it points
    pub fn connects(&self, a: NodeId, b: NodeId) -> bool {
        (self.source == a && self.target == b) || (self.source == b && self.target == a)
    }

    /// The endpoint that is not `node`
    pub fn peer_of(&self, node: NodeId) -> NodeId {
        if self.source == node {
            self.target
        } else {
            self.source
        }
    }
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Edge {}

impl std::hash::Hash for Edge {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
