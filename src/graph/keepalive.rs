//! Standing conditions on conditional edges
//!
//! A conditional edge carries a keep-alive predicate. The store evaluates it
//! on every event after the edge was added; once it fails, the edge is
//! removed. Each condition is a small state machine:
//!
//! ```text
//! Active ──condition fails──▶ Removing ──edge removed──▶ Removed
//!    └──────────── own edge already gone ─────────────────▲
//! ```
//!
//! `Removing` is entered at most once, which keeps the removal's own
//! `edge:removed` event from re-entering the same condition.

use super::relationship::Relationship;
use super::store::RelationalStore;
use super::types::{EdgeId, NodeId, SubscriptionId};
use std::rc::Rc;

/// Keep-alive predicate: `(store, source, target, relationship) -> keep?`
pub type EdgeCondition<T> = Rc<dyn Fn(&RelationalStore<T>, NodeId, NodeId, &dyn Relationship) -> bool>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveState {
    Active,
    Removing,
    Removed,
}

pub(crate) struct Keepalive<T> {
    pub edge: EdgeId,
    pub subscription: SubscriptionId,
    pub condition: EdgeCondition<T>,
    state: KeepaliveState,
}

impl<T> Keepalive<T> {
    pub fn new(edge: EdgeId, subscription: SubscriptionId, condition: EdgeCondition<T>) -> Self {
        Keepalive {
            edge,
            subscription,
            condition,
            state: KeepaliveState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == KeepaliveState::Active
    }

    /// Active -> Removing. Returns false if removal already started.
    pub fn begin_removal(&mut self) -> bool {
        if self.state != KeepaliveState::Active {
            return false;
        }
        self.state = KeepaliveState::Removing;
        true
    }

    pub fn finish(&mut self) {
        self.state = KeepaliveState::Removed;
    }
}
