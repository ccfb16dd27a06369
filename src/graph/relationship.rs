//! Relationship kinds
//!
//! A relationship describes what an edge means ("is friend of", "lives in the
//! same town as"). Kinds are distinguished by their Rust type, not by stored
//! data: two `IsFriendOf` values are the same kind of relationship.
//!
//! ```rust
//! use relstore::graph::{Relationship, RelationshipKind};
//!
//! #[derive(Debug)]
//! struct IsFriendOf;
//! impl Relationship for IsFriendOf {}
//!
//! let rel: Box<dyn Relationship> = Box::new(IsFriendOf);
//! assert_eq!(rel.kind(), RelationshipKind::of::<IsFriendOf>());
//! ```

use super::types::EdgeId;
use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Runtime discriminant of a relationship type
#[derive(Clone, Copy)]
pub struct RelationshipKind {
    id: TypeId,
    name: &'static str,
}

impl RelationshipKind {
    pub fn of<R: Relationship>() -> Self {
        RelationshipKind {
            id: TypeId::of::<R>(),
            name: std::any::type_name::<R>(),
        }
    }

    /// Fully qualified type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Type name without its module path
    pub fn short_name(&self) -> &'static str {
        self.name.rsplit("::").next().unwrap_or(self.name)
    }
}

impl PartialEq for RelationshipKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RelationshipKind {}

impl Hash for RelationshipKind {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelationshipKind({})", self.short_name())
    }
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Object-safe access to the concrete type behind a `dyn Relationship`.
///
/// Implemented for every relationship automatically.
pub trait RelationshipType: Any {
    fn kind(&self) -> RelationshipKind;
    fn as_any(&self) -> &dyn Any;
}

impl<R: Relationship> RelationshipType for R {
    fn kind(&self) -> RelationshipKind {
        RelationshipKind::of::<R>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Marker for types that can label an edge
pub trait Relationship: RelationshipType + fmt::Debug {}

impl dyn Relationship {
    pub fn is<R: Relationship>(&self) -> bool {
        self.as_any().is::<R>()
    }

    pub fn downcast_ref<R: Relationship>(&self) -> Option<&R> {
        self.as_any().downcast_ref::<R>()
    }
}

/// A relationship bound to the edge that owns it.
///
/// Binding consumes the detached relationship, so one relationship value can
/// back at most one edge.
#[derive(Debug)]
pub struct AttachedRelationship {
    edge: EdgeId,
    inner: Box<dyn Relationship>,
}

impl AttachedRelationship {
    pub fn bind(relationship: Box<dyn Relationship>, edge: EdgeId) -> Self {
        AttachedRelationship { edge, inner: relationship }
    }

    /// Back-reference to the owning edge
    pub fn edge(&self) -> EdgeId {
        self.edge
    }

    pub fn kind(&self) -> RelationshipKind {
        self.inner.kind()
    }

    pub fn get(&self) -> &dyn Relationship {
        &*self.inner
    }

    pub fn is<R: Relationship>(&self) -> bool {
        self.inner.is::<R>()
    }

    pub fn downcast_ref<R: Relationship>(&self) -> Option<&R> {
        self.inner.downcast_ref::<R>()
    }
}
