//! In-memory relational store
//!
//! Owns every node and edge, the key index and the subscriber registry, and
//! turns each mutation into a [`StoreEvent`].
//!
//! Layout:
//! - nodes: NodeId -> Node (insertion ordered)
//! - payload_index: payload identity -> NodeId
//! - adjacency: NodeId -> set of EdgeId touching the node (both directions)
//! - edges: EdgeId -> Edge
//! - keys: key <-> payload identity
//! - subscribers: filter -> registrations (registration ordered)
//! - forwarders: NodeId -> the node subscription that re-emits payload patches

use super::config::StoreConfig;
use super::edge::Edge;
use super::event::{EventFilter, EventRecord, Listener, StoreCallback, StoreEvent};
use super::keepalive::{EdgeCondition, Keepalive};
use super::node::{same_callback, Node, PayloadCallback, PayloadId};
use super::relationship::{Relationship, RelationshipKind};
use super::scheduler::{Task, TaskQueue};
use super::types::{Delivery, EdgeId, NodeId, SubscriptionId};
use crate::index::KeyIndex;
use crate::patch::{PatchError, PatchOperation, Patchable};
use indexmap::{IndexMap, IndexSet};
use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, warn};

/// Errors that can occur during store operations
#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("Node {0} not found")]
    NodeNotFound(String),

    #[error("Invalid edge: source node {0} does not exist")]
    InvalidEdgeSource(String),

    #[error("Invalid edge: target node {0} does not exist")]
    InvalidEdgeTarget(String),

    #[error("Patch failed: {0}")]
    Patch(#[from] PatchError),
}

pub type GraphResult<T> = Result<T, GraphError>;

/// Any of the ways a caller can point at a node
pub enum NodeRef<'a, T> {
    Id(NodeId),
    Key(&'a str),
    Payload(&'a Rc<RefCell<T>>),
}

impl<T> Clone for NodeRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for NodeRef<'_, T> {}

impl<'a, T> From<NodeId> for NodeRef<'a, T> {
    fn from(id: NodeId) -> Self {
        NodeRef::Id(id)
    }
}

impl<'a, T> From<&'a Node<T>> for NodeRef<'a, T> {
    fn from(node: &'a Node<T>) -> Self {
        NodeRef::Id(node.id())
    }
}

impl<'a, T> From<&'a str> for NodeRef<'a, T> {
    fn from(key: &'a str) -> Self {
        NodeRef::Key(key)
    }
}

impl<'a, T> From<&'a String> for NodeRef<'a, T> {
    fn from(key: &'a String) -> Self {
        NodeRef::Key(key.as_str())
    }
}

impl<'a, T> From<&'a Rc<RefCell<T>>> for NodeRef<'a, T> {
    fn from(payload: &'a Rc<RefCell<T>>) -> Self {
        NodeRef::Payload(payload)
    }
}

impl<T> fmt::Display for NodeRef<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Id(id) => write!(f, "{}", id),
            NodeRef::Key(key) => write!(f, "'{}'", key),
            NodeRef::Payload(payload) => write!(f, "payload@{:p}", Rc::as_ptr(payload)),
        }
    }
}

struct Registration<T> {
    listener: Listener<T>,
    delivery: Delivery,
}

/// In-memory labeled graph with change notification
pub struct RelationalStore<T> {
    config: StoreConfig,

    nodes: IndexMap<NodeId, Node<T>>,

    payload_index: HashMap<PayloadId, NodeId>,

    adjacency: HashMap<NodeId, IndexSet<EdgeId>>,

    edges: HashMap<EdgeId, Rc<Edge>>,

    keys: KeyIndex<String, PayloadId>,

    subscribers: HashMap<EventFilter, IndexMap<SubscriptionId, Registration<T>>>,

    forwarders: HashMap<NodeId, SubscriptionId>,

    /// Deferred work, drained by `flush`
    queue: TaskQueue<T>,

    /// Optional event record sender
    event_sender: Option<UnboundedSender<EventRecord>>,

    next_node_id: u64,

    next_edge_id: u64,

    next_subscription_id: u64,
}

impl<T: 'static> RelationalStore<T> {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        RelationalStore {
            config,
            nodes: IndexMap::new(),
            payload_index: HashMap::new(),
            adjacency: HashMap::new(),
            edges: HashMap::new(),
            keys: KeyIndex::new(),
            subscribers: HashMap::new(),
            forwarders: HashMap::new(),
            queue: TaskQueue::new(),
            event_sender: None,
            next_node_id: 1,
            next_edge_id: 1,
            next_subscription_id: 1,
        }
    }

    /// Create a store that also sends an [`EventRecord`] for every event
    pub fn with_event_channel() -> (Self, UnboundedReceiver<EventRecord>) {
        let (tx, rx) = unbounded_channel();
        let mut store = Self::new();
        store.event_sender = Some(tx);
        (store, rx)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ============================================================
    // Nodes
    // ============================================================

    /// Register a payload as a node, optionally under `key`.
    ///
    /// Registering the same payload cell again returns the existing node and
    /// emits nothing.
    pub fn add_node(&mut self, payload: Rc<RefCell<T>>, key: Option<&str>) -> NodeId {
        let payload_id = PayloadId::of(&payload);
        if let Some(&existing) = self.payload_index.get(&payload_id) {
            return existing;
        }

        let id = NodeId::new(self.next_node_id);
        self.next_node_id += 1;

        let mut node = Node::new(id, Rc::clone(&payload), self.queue.clone());
        self.adjacency.insert(id, IndexSet::new());
        if let Some(key) = key.filter(|k| !k.is_empty()) {
            self.keys.insert(key.to_string(), payload_id);
        }

        // re-emit payload patches as store events
        let queue = self.queue.clone();
        let forwarded = Rc::clone(&payload);
        let forwarder: PayloadCallback<T> = Rc::new(move |_: &T, operations: &[PatchOperation]| {
            queue.push(Task::Emit(StoreEvent::NodeDataUpdated {
                node: id,
                payload: Rc::clone(&forwarded),
                operations: operations.into(),
            }));
        });
        let forwarder_id = node.subscribe(forwarder, Delivery::Deferred);
        self.forwarders.insert(id, forwarder_id);

        self.nodes.insert(id, node);
        self.payload_index.insert(payload_id, id);
        debug!("Added node {}", id);

        self.emit(StoreEvent::NodeAdded { node: id, payload });
        id
    }

    /// Resolve a node from its id, key, payload or the node itself
    pub fn get_node<'a>(&self, node: impl Into<NodeRef<'a, T>>) -> Option<&Node<T>> {
        let id = self.resolve(node.into())?;
        self.nodes.get(&id)
    }

    pub fn node_id<'a>(&self, node: impl Into<NodeRef<'a, T>>) -> Option<NodeId> {
        self.resolve(node.into())
    }

    pub fn contains_node<'a>(&self, node: impl Into<NodeRef<'a, T>>) -> bool {
        self.resolve(node.into()).is_some()
    }

    /// Key the node was registered under, if any
    pub fn key_for<'a>(&self, node: impl Into<NodeRef<'a, T>>) -> Option<&str> {
        let id = self.resolve(node.into())?;
        let payload_id = self.nodes.get(&id)?.payload_id();
        self.keys.get_by_value(&payload_id).map(String::as_str)
    }

    /// Remove a node together with every edge touching it.
    ///
    /// Returns true when every structural removal took effect: the adjacency
    /// entry, the node entry, the payload forwarding subscription and, if the
    /// node had a key, the key binding.
    pub fn remove_node<'a>(&mut self, node: impl Into<NodeRef<'a, T>>) -> bool {
        let Some(id) = self.resolve(node.into()) else {
            return false;
        };

        let edge_ids: Vec<EdgeId> = self
            .adjacency
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        let mut removed_edges = Vec::with_capacity(edge_ids.len());
        for edge_id in edge_ids {
            if let Some(edge) = self.edges.remove(&edge_id) {
                let peer = edge.peer_of(id);
                if let Some(peer_edges) = self.adjacency.get_mut(&peer) {
                    peer_edges.shift_remove(&edge_id);
                }
                removed_edges.push(edge);
            }
        }

        let forwarder_removed = match self.forwarders.remove(&id) {
            Some(subscription) => self
                .nodes
                .get_mut(&id)
                .map_or(false, |node| node.unsubscribe(subscription)),
            None => false,
        };
        let adjacency_removed = self.adjacency.remove(&id).is_some();

        let Some(node) = self.nodes.shift_remove(&id) else {
            return false;
        };
        let payload_id = node.payload_id();
        self.payload_index.remove(&payload_id);

        let key = self.keys.get_by_value(&payload_id).cloned();
        let key_removed = key.is_none() || self.keys.remove_by_value(&payload_id);

        debug!("Removed node {} and {} edges", id, removed_edges.len());
        self.emit(StoreEvent::NodeRemoved {
            node: id,
            payload: Rc::clone(node.payload()),
            key,
            edges: removed_edges,
        });

        adjacency_removed && forwarder_removed && key_removed
    }

    /// Apply patch operations to a node's payload
    pub fn patch_node<'a>(
        &mut self,
        node: impl Into<NodeRef<'a, T>>,
        operations: &[PatchOperation],
    ) -> GraphResult<NodeId>
    where
        T: Patchable,
    {
        let node = node.into();
        let id = self
            .resolve(node)
            .ok_or_else(|| GraphError::NodeNotFound(node.to_string()))?;
        let entry = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;

        if let Err(err) = entry.patch(operations) {
            warn!("Patch on node {} failed: {}", id, err);
            return Err(err.into());
        }

        debug!("Patched node {} with {} operations", id, operations.len());
        Ok(id)
    }

    /// Subscribe to one node's payload patches
    pub fn subscribe_node<'a>(
        &mut self,
        node: impl Into<NodeRef<'a, T>>,
        callback: PayloadCallback<T>,
        delivery: Delivery,
    ) -> Option<SubscriptionId> {
        let id = self.resolve(node.into())?;
        self.nodes.get_mut(&id).map(|node| node.subscribe(callback, delivery))
    }

    pub fn unsubscribe_node<'a>(&mut self, node: impl Into<NodeRef<'a, T>>, subscription: SubscriptionId) -> bool {
        let Some(id) = self.resolve(node.into()) else {
            return false;
        };
        if self.forwarders.get(&id) == Some(&subscription) {
            return false;
        }
        self.nodes
            .get_mut(&id)
            .map_or(false, |node| node.unsubscribe(subscription))
    }

    // ============================================================
    // Edges
    // ============================================================

    /// Connect `source` to `target` with `relationship`
    pub fn add_edge<'a, 'b, R: Relationship>(
        &mut self,
        source: impl Into<NodeRef<'a, T>>,
        target: impl Into<NodeRef<'b, T>>,
        relationship: R,
    ) -> GraphResult<EdgeId> {
        self.add_boxed_edge(source.into(), target.into(), Box::new(relationship))
    }

    /// Connect `source` to `target` and keep the edge only while `condition`
    /// holds.
    ///
    /// The condition is re-evaluated on every store event delivered after the
    /// edge was added (deferred, so during `flush`). When it returns false the
    /// edge is removed.
    pub fn add_edge_if<'a, 'b, R, F>(
        &mut self,
        source: impl Into<NodeRef<'a, T>>,
        target: impl Into<NodeRef<'b, T>>,
        relationship: R,
        condition: F,
    ) -> GraphResult<EdgeId>
    where
        R: Relationship,
        F: Fn(&RelationalStore<T>, NodeId, NodeId, &dyn Relationship) -> bool + 'static,
    {
        let edge_id = self.add_boxed_edge(source.into(), target.into(), Box::new(relationship))?;

        let condition: EdgeCondition<T> = Rc::new(condition);
        let subscription = self.allocate_subscription();
        let keepalive = Keepalive::new(edge_id, subscription, condition);
        self.insert_registration(
            EventFilter::Any,
            subscription,
            Listener::Keepalive(Rc::new(RefCell::new(keepalive))),
            Delivery::Deferred,
        );
        Ok(edge_id)
    }

    fn add_boxed_edge(
        &mut self,
        source: NodeRef<'_, T>,
        target: NodeRef<'_, T>,
        relationship: Box<dyn Relationship>,
    ) -> GraphResult<EdgeId> {
        let source_id = self
            .resolve(source)
            .ok_or_else(|| GraphError::InvalidEdgeSource(source.to_string()))?;
        let target_id = self
            .resolve(target)
            .ok_or_else(|| GraphError::InvalidEdgeTarget(target.to_string()))?;

        let id = EdgeId::new(self.next_edge_id);
        self.next_edge_id += 1;

        let edge = Rc::new(Edge::new(id, source_id, target_id, relationship));
        for endpoint in [source_id, target_id] {
            if let Some(set) = self.adjacency.get_mut(&endpoint) {
                set.insert(id);
            }
        }
        self.edges.insert(id, Rc::clone(&edge));
        debug!("Added edge {} ({} -[{}]-> {})", id, source_id, edge.kind(), target_id);

        self.emit(StoreEvent::EdgeAdded { edge });
        Ok(id)
    }

    pub fn get_edge(&self, id: EdgeId) -> Option<&Rc<Edge>> {
        self.edges.get(&id)
    }

    /// Remove one edge from both endpoints.
    ///
    /// Emits `edge:removed` when the edge was live; returns true only if it
    /// was detached from both adjacency sets.
    pub fn remove_edge(&mut self, id: EdgeId) -> bool {
        let Some(edge) = self.edges.remove(&id) else {
            return false;
        };
        let detached = self.detach_edge(&edge);
        debug!("Removed edge {} ({} -> {})", id, edge.source, edge.target);

        self.emit(StoreEvent::EdgeRemoved { edge });
        detached
    }

    /// Remove every `kind` edge between `source` and `target`, in either
    /// direction.
    ///
    /// Emits one `edge:removed` per match and returns true if at least one
    /// edge was removed.
    pub fn remove_edges<'a, 'b>(
        &mut self,
        source: impl Into<NodeRef<'a, T>>,
        target: impl Into<NodeRef<'b, T>>,
        kind: RelationshipKind,
    ) -> bool {
        let (Some(source_id), Some(target_id)) = (self.resolve(source.into()), self.resolve(target.into())) else {
            return false;
        };

        let matches: Vec<EdgeId> = self
            .adjacency
            .get(&source_id)
            .into_iter()
            .flatten()
            .filter(|id| {
                self.edges
                    .get(*id)
                    .map_or(false, |edge| edge.connects(source_id, target_id) && edge.kind() == kind)
            })
            .copied()
            .collect();

        let mut removed = 0;
        for id in matches {
            if self.remove_edge(id) {
                removed += 1;
            }
        }
        removed > 0
    }

    fn detach_edge(&mut self, edge: &Edge) -> bool {
        let from_source = self
            .adjacency
            .get_mut(&edge.source)
            .map_or(false, |set| set.shift_remove(&edge.id));
        if edge.source == edge.target {
            return from_source;
        }
        let from_target = self
            .adjacency
            .get_mut(&edge.target)
            .map_or(false, |set| set.shift_remove(&edge.id));
        from_source && from_target
    }

    /// All edges touching a node, optionally only those of one relationship
    /// kind. `None` if the node does not exist.
    pub fn edges_for<'a>(
        &self,
        node: impl Into<NodeRef<'a, T>>,
        kind: Option<RelationshipKind>,
    ) -> Option<Vec<Rc<Edge>>> {
        let id = self.resolve(node.into())?;
        let adjacent = self.adjacency.get(&id)?;
        Some(
            adjacent
                .iter()
                .filter_map(|edge_id| self.edges.get(edge_id))
                .filter(|edge| kind.map_or(true, |kind| edge.kind() == kind))
                .cloned()
                .collect(),
        )
    }

    /// Edges of relationship type `R` touching a node
    pub fn relationships_for<'a, R: Relationship>(&self, node: impl Into<NodeRef<'a, T>>) -> Option<Vec<Rc<Edge>>> {
        self.edges_for(node, Some(RelationshipKind::of::<R>()))
    }

    /// True if an edge of `kind` leads from `source` to `target`
    pub fn has_relationship_kind<'a, 'b>(
        &self,
        source: impl Into<NodeRef<'a, T>>,
        target: impl Into<NodeRef<'b, T>>,
        kind: RelationshipKind,
    ) -> bool {
        let (Some(source_id), Some(target_id)) = (self.resolve(source.into()), self.resolve(target.into())) else {
            return false;
        };
        self.adjacency.get(&source_id).map_or(false, |set| {
            set.iter()
                .filter_map(|id| self.edges.get(id))
                .any(|edge| edge.kind() == kind && edge.target == target_id)
        })
    }

    pub fn has_relationship<'a, 'b, R: Relationship>(
        &self,
        source: impl Into<NodeRef<'a, T>>,
        target: impl Into<NodeRef<'b, T>>,
    ) -> bool {
        self.has_relationship_kind(source, target, RelationshipKind::of::<R>())
    }

    /// True while the edge is live and carries a live keep-alive condition
    pub fn is_conditional(&self, edge: EdgeId) -> bool {
        if !self.edges.contains_key(&edge) {
            return false;
        }
        let Some(bucket) = self.subscribers.get(&EventFilter::Any) else {
            return false;
        };
        bucket.values().any(|registration| match &registration.listener {
            Listener::Keepalive(keepalive) => {
                let keepalive = keepalive.borrow();
                keepalive.edge == edge && keepalive.is_active()
            }
            Listener::Callback(_) => false,
        })
    }

    // ============================================================
    // Iteration
    // ============================================================

    /// All nodes in insertion order
    pub fn nodes(&self) -> impl Iterator<Item = &Node<T>> {
        self.nodes.values()
    }

    /// Nodes matching `condition`, lazily
    pub fn iterate<'s, F>(&'s self, condition: F) -> impl Iterator<Item = &'s Node<T>> + 's
    where
        F: Fn(&Node<T>) -> bool + 's,
    {
        self.nodes.values().filter(move |node| condition(*node))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    // ============================================================
    // Events
    // ============================================================

    /// Register a store-level subscriber.
    ///
    /// Subscribing the same callback (by `Rc` identity) to the same filter
    /// again only updates its delivery mode.
    pub fn subscribe(
        &mut self,
        filter: impl Into<EventFilter>,
        callback: StoreCallback<T>,
        delivery: Delivery,
    ) -> SubscriptionId {
        let filter = filter.into();
        if let Some(bucket) = self.subscribers.get_mut(&filter) {
            for (id, registration) in bucket.iter_mut() {
                if let Listener::Callback(existing) = &registration.listener {
                    if same_callback(existing, &callback) {
                        registration.delivery = delivery;
                        return *id;
                    }
                }
            }
        }

        let id = self.allocate_subscription();
        self.insert_registration(filter, id, Listener::Callback(callback), delivery);
        id
    }

    /// Closure form of [`RelationalStore::subscribe`]
    pub fn on<F>(&mut self, filter: impl Into<EventFilter>, delivery: Delivery, callback: F) -> SubscriptionId
    where
        F: Fn(&RelationalStore<T>, &StoreEvent<T>) + 'static,
    {
        self.subscribe(filter, Rc::new(callback), delivery)
    }

    /// Remove a subscription. Deliveries already queued for it still run.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers
            .values_mut()
            .any(|bucket| bucket.shift_remove(&id).is_some())
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.values().map(IndexMap::len).sum()
    }

    /// Number of deferred units waiting for `flush`
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Run deferred work until the queue is empty, including work queued
    /// while flushing. Returns the number of units run.
    pub fn flush(&mut self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.queue.pop() {
            ran += 1;
            match task {
                Task::Payload { callback, payload, operations } => {
                    let run = || callback(&*payload.borrow(), &operations[..]);
                    if self.config.isolate_panics {
                        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(run)) {
                            error!("Payload subscriber panicked: {}", panic_message(&*panic));
                        }
                    } else {
                        run();
                    }
                }
                Task::Emit(event) => {
                    // forwarded patch for a node removed in the meantime
                    if event.node().map_or(false, |id| !self.nodes.contains_key(&id)) {
                        debug!("Dropping {} event for removed node", event.kind());
                        continue;
                    }
                    self.emit(event);
                }
                Task::Deliver { listener, event } => self.dispatch(listener, &event, true),
            }
        }
        ran
    }

    /// Drop every subscriber, node, edge and key. Emits nothing.
    pub fn reset(&mut self) {
        self.subscribers.clear();
        for (id, subscription) in self.forwarders.drain() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.unsubscribe(subscription);
            }
        }
        self.adjacency.clear();
        self.edges.clear();
        self.keys.clear();
        self.payload_index.clear();
        self.nodes.clear();
        self.queue.clear();
        debug!("Store reset");
    }

    fn emit(&mut self, event: StoreEvent<T>) {
        let kind = event.kind();
        if self.config.trace_events {
            debug!("Emitting {} (node: {:?}, edge: {:?})", kind, event.node(), event.edge().map(|e| e.id));
        }
        if let Some(sender) = &self.event_sender {
            let _ = sender.send(event.record());
        }

        let event = Rc::new(event);
        let mut inline = Vec::new();
        for filter in [EventFilter::Any, EventFilter::Kind(kind)] {
            let Some(bucket) = self.subscribers.get(&filter) else {
                continue;
            };
            for registration in bucket.values() {
                match registration.delivery {
                    Delivery::Sync => inline.push(registration.listener.clone()),
                    Delivery::Deferred => self.queue.push(Task::Deliver {
                        listener: registration.listener.clone(),
                        event: Rc::clone(&event),
                    }),
                }
            }
        }

        for listener in inline {
            self.dispatch(listener, &event, false);
        }
    }

    fn dispatch(&mut self, listener: Listener<T>, event: &StoreEvent<T>, deferred: bool) {
        match listener {
            Listener::Callback(callback) => {
                if deferred && self.config.isolate_panics {
                    let store: &Self = self;
                    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(store, event))) {
                        error!("Subscriber for {} panicked: {}", event.kind(), panic_message(&*panic));
                    }
                } else {
                    callback(self, event);
                }
            }
            Listener::Keepalive(keepalive) => self.run_keepalive(&keepalive, event),
        }
    }

    fn run_keepalive(&mut self, keepalive: &Rc<RefCell<Keepalive<T>>>, event: &StoreEvent<T>) {
        let (edge_id, subscription, condition) = {
            let keepalive = keepalive.borrow();
            if !keepalive.is_active() {
                return;
            }
            (keepalive.edge, keepalive.subscription, Rc::clone(&keepalive.condition))
        };

        let own_removal = matches!(event, StoreEvent::EdgeRemoved { edge } if edge.id == edge_id);
        let edge = match self.edges.get(&edge_id) {
            Some(edge) if !own_removal => Rc::clone(edge),
            _ => {
                keepalive.borrow_mut().finish();
                self.unsubscribe(subscription);
                return;
            }
        };

        let relationship = edge.relationship().get();
        let keep = if self.config.isolate_panics {
            let store: &Self = self;
            panic::catch_unwind(AssertUnwindSafe(|| condition(store, edge.source, edge.target, relationship)))
                .unwrap_or_else(|panic| {
                    error!("Condition on edge {} panicked: {}", edge_id, panic_message(&*panic));
                    true
                })
        } else {
            condition(self, edge.source, edge.target, relationship)
        };
        if keep {
            return;
        }

        // unsubscribe before removing so the removal event cannot re-enter
        if !keepalive.borrow_mut().begin_removal() {
            return;
        }
        self.unsubscribe(subscription);
        debug!("Condition on edge {} no longer holds", edge_id);
        self.remove_edge(edge_id);
        keepalive.borrow_mut().finish();
    }

    fn resolve(&self, node: NodeRef<'_, T>) -> Option<NodeId> {
        match node {
            NodeRef::Id(id) => self.nodes.contains_key(&id).then_some(id),
            NodeRef::Key(key) => {
                let payload_id = self.keys.get(key)?;
                self.payload_index.get(payload_id).copied()
            }
            NodeRef::Payload(payload) => self.payload_index.get(&PayloadId::of(payload)).copied(),
        }
    }

    fn allocate_subscription(&mut self) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription_id);
        self.next_subscription_id += 1;
        id
    }

    fn insert_registration(&mut self, filter: EventFilter, id: SubscriptionId, listener: Listener<T>, delivery: Delivery) {
        self.subscribers
            .entry(filter)
            .or_default()
            .insert(id, Registration { listener, delivery });
    }
}

impl<T: 'static> Default for RelationalStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for RelationalStore<T> {
    fn drop(&mut self) {
        // queued tasks may hold forwarders that hold the queue
        self.queue.clear();
    }
}

impl<T> fmt::Debug for RelationalStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationalStore")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges.len())
            .field("keys", &self.keys.len())
            .field("pending", &self.queue.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{shared, EventKind};
    use serde_json::{json, Value};
    use std::cell::Cell;

    #[derive(Debug)]
    struct IsFriendOf;
    impl Relationship for IsFriendOf {}

    #[derive(Debug)]
    struct LivesInSameTown;
    impl Relationship for LivesInSameTown {}

    fn user(name: &str) -> Rc<RefCell<Value>> {
        shared(json!({ "name": name }))
    }

    fn counter(store: &mut RelationalStore<Value>, filter: impl Into<EventFilter>, delivery: Delivery) -> Rc<Cell<usize>> {
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        store.on(filter, delivery, move |_, _| c.set(c.get() + 1));
        count
    }

    #[test]
    fn test_add_node_is_idempotent() {
        let mut store = RelationalStore::new();
        let added = counter(&mut store, EventKind::NodeAdded, Delivery::Sync);
        let john = user("john");

        let first = store.add_node(Rc::clone(&john), None);
        let second = store.add_node(Rc::clone(&john), None);

        assert_eq!(first, second);
        assert_eq!(store.node_count(), 1);
        assert_eq!(added.get(), 1);
    }

    #[test]
    fn test_equal_payloads_are_distinct_nodes() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("john"), None);
        let b = store.add_node(user("john"), None);
        assert_ne!(a, b);
        assert_eq!(store.node_count(), 2);
    }

    #[test]
    fn test_get_node_resolution() {
        let mut store = RelationalStore::new();
        let smith = user("smith");
        let id = store.add_node(Rc::clone(&smith), Some("smith"));

        assert_eq!(store.get_node(&smith).map(Node::id), Some(id));
        assert_eq!(store.get_node("smith").map(Node::id), Some(id));
        assert_eq!(store.get_node(id).map(Node::id), Some(id));
        let node = store.get_node(id).unwrap();
        assert_eq!(store.get_node(node).map(Node::id), Some(id));

        assert!(store.get_node("nobody").is_none());
        assert!(store.get_node(NodeId::new(99)).is_none());
        assert!(store.get_node(&user("smith")).is_none());
        assert_eq!(store.key_for(id), Some("smith"));
    }

    #[test]
    fn test_add_edge_indexes_both_endpoints() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);

        let edge = store.add_edge(a, b, IsFriendOf).unwrap();

        let from_a = store.edges_for(a, None).unwrap();
        let from_b = store.edges_for(b, None).unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_b.len(), 1);
        assert_eq!(from_a[0].id, edge);
        assert_eq!(from_a[0].relationship().edge(), edge);
        assert_eq!(store.edge_count(), 1);
    }

    #[test]
    fn test_add_edge_missing_endpoint() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let added = counter(&mut store, EventKind::EdgeAdded, Delivery::Sync);

        let result = store.add_edge(a, "ghost", IsFriendOf);
        assert_eq!(result, Err(GraphError::InvalidEdgeTarget("'ghost'".to_string())));
        let result = store.add_edge(NodeId::new(42), a, IsFriendOf);
        assert_eq!(result, Err(GraphError::InvalidEdgeSource("NodeId(42)".to_string())));

        assert_eq!(store.edge_count(), 0);
        assert_eq!(store.edges_for(a, None).unwrap().len(), 0);
        assert_eq!(added.get(), 0);
    }

    #[test]
    fn test_remove_edge_from_both_sides() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        let edge = store.add_edge(a, b, IsFriendOf).unwrap();
        let removed = counter(&mut store, EventKind::EdgeRemoved, Delivery::Sync);

        assert!(store.remove_edge(edge));
        assert!(store.edges_for(a, None).unwrap().is_empty());
        assert!(store.edges_for(b, None).unwrap().is_empty());
        assert_eq!(removed.get(), 1);

        // second removal is a no-op and emits nothing
        assert!(!store.remove_edge(edge));
        assert_eq!(removed.get(), 1);
    }

    #[test]
    fn test_self_loop_edge() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let edge = store.add_edge(a, a, IsFriendOf).unwrap();

        assert_eq!(store.edges_for(a, None).unwrap().len(), 1);
        assert!(store.remove_edge(edge));
        assert!(store.edges_for(a, None).unwrap().is_empty());
    }

    #[test]
    fn test_remove_edges_by_kind() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        let c = store.add_node(user("c"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();
        store.add_edge(a, b, IsFriendOf).unwrap();
        store.add_edge(a, b, LivesInSameTown).unwrap();
        store.add_edge(a, c, IsFriendOf).unwrap();
        let removed = counter(&mut store, EventKind::EdgeRemoved, Delivery::Sync);

        assert!(store.remove_edges(a, b, RelationshipKind::of::<IsFriendOf>()));
        assert_eq!(removed.get(), 2);
        assert!(!store.has_relationship::<IsFriendOf>(a, b));
        assert!(store.has_relationship::<LivesInSameTown>(a, b));
        assert!(store.has_relationship::<IsFriendOf>(a, c));

        assert!(!store.remove_edges(a, b, RelationshipKind::of::<IsFriendOf>()));
        assert!(!store.remove_edges(a, "ghost", RelationshipKind::of::<IsFriendOf>()));
    }

    #[test]
    fn test_remove_edges_matches_either_direction() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        store.add_edge(b, a, IsFriendOf).unwrap();
        store.add_edge(a, b, LivesInSameTown).unwrap();
        let removed = counter(&mut store, EventKind::EdgeRemoved, Delivery::Sync);

        assert!(store.remove_edges(a, b, RelationshipKind::of::<IsFriendOf>()));
        assert_eq!(removed.get(), 1);
        assert_eq!(store.edge_count(), 1);
        assert!(!store.has_relationship::<IsFriendOf>(b, a));
        assert_eq!(store.edges_for(a, None).unwrap().len(), 1);
        assert_eq!(store.edges_for(b, None).unwrap().len(), 1);
    }

    #[test]
    fn test_relationships_for_filters_exact_kind() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();
        store.add_edge(a, b, LivesInSameTown).unwrap();

        let friends = store.relationships_for::<IsFriendOf>(a).unwrap();
        assert_eq!(friends.len(), 1);
        assert!(friends[0].is::<IsFriendOf>());
        assert_eq!(store.edges_for(a, None).unwrap().len(), 2);
        assert!(store.relationships_for::<IsFriendOf>(NodeId::new(77)).is_none());
    }

    #[test]
    fn test_has_relationship_is_directional() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();

        assert!(store.has_relationship::<IsFriendOf>(a, b));
        assert!(!store.has_relationship::<IsFriendOf>(b, a));
        assert!(!store.has_relationship::<LivesInSameTown>(a, b));
    }

    #[test]
    fn test_remove_node_cleans_up_everything() {
        let mut store = RelationalStore::new();
        let john = user("john");
        let a = store.add_node(Rc::clone(&john), Some("john"));
        let b = store.add_node(user("b"), None);
        let c = store.add_node(user("c"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();
        store.add_edge(c, a, LivesInSameTown).unwrap();
        let b_c = store.add_edge(b, c, IsFriendOf).unwrap();

        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = Rc::clone(&seen);
        store.on(EventKind::NodeRemoved, Delivery::Sync, move |_, event| {
            if let StoreEvent::NodeRemoved { node, key, edges, .. } = event {
                s.borrow_mut().push((*node, key.clone(), edges.len()));
            }
        });

        assert!(store.remove_node("john"));
        assert_eq!(*seen.borrow(), vec![(a, Some("john".to_string()), 2)]);

        assert!(store.get_node(a).is_none());
        assert!(store.get_node(&john).is_none());
        assert!(store.get_node("john").is_none());
        assert_eq!(store.edges_for(b, None).unwrap().len(), 1);
        assert_eq!(store.edges_for(c, None).unwrap()[0].id, b_c);
        assert_eq!(store.edge_count(), 1);

        assert!(!store.remove_node(a));
    }

    #[test]
    fn test_remove_node_without_key_succeeds() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        assert!(store.remove_node(a));
        assert_eq!(store.node_count(), 0);
    }

    #[test]
    fn test_patch_node() {
        let mut store = RelationalStore::new();
        let john = user("john");
        store.add_node(Rc::clone(&john), Some("john"));
        let updated = counter(&mut store, EventKind::NodeDataUpdated, Delivery::Deferred);

        store
            .patch_node("john", &[PatchOperation::add("/email", "john@example.com")])
            .unwrap();
        assert_eq!(john.borrow()["email"], "john@example.com");
        assert_eq!(updated.get(), 0);

        store.flush();
        assert_eq!(updated.get(), 1);
    }

    #[test]
    fn test_patch_missing_node() {
        let mut store: RelationalStore<Value> = RelationalStore::new();
        let result = store.patch_node("nobody", &[PatchOperation::remove("/x")]);
        assert_eq!(result, Err(GraphError::NodeNotFound("'nobody'".to_string())));
    }

    #[test]
    fn test_invalid_patch_propagates() {
        let mut store = RelationalStore::new();
        let a = store.add_node(user("a"), None);
        let result = store.patch_node(a, &[PatchOperation::replace("/missing", 1)]);
        assert!(matches!(
            result,
            Err(GraphError::Patch(PatchError::Rejected { operation: 0, op: "replace", .. }))
        ));
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_sync_and_deferred_delivery() {
        let mut store = RelationalStore::new();
        let sync = counter(&mut store, EventFilter::Any, Delivery::Sync);
        let deferred = counter(&mut store, EventFilter::Any, Delivery::Deferred);

        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();

        assert_eq!(sync.get(), 3);
        assert_eq!(deferred.get(), 0);
        assert_eq!(store.pending(), 3);

        assert_eq!(store.flush(), 3);
        assert_eq!(deferred.get(), 3);
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_wildcard_runs_before_typed() {
        let mut store = RelationalStore::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let o = Rc::clone(&order);
        store.on(EventKind::NodeAdded, Delivery::Sync, move |_, _| o.borrow_mut().push("typed"));
        let o = Rc::clone(&order);
        store.on(EventFilter::Any, Delivery::Sync, move |_, _| o.borrow_mut().push("any"));

        store.add_node(user("a"), None);
        assert_eq!(*order.borrow(), vec!["any", "typed"]);
    }

    #[test]
    fn test_resubscribe_same_callback() {
        let mut store: RelationalStore<Value> = RelationalStore::new();
        let calls = Rc::new(Cell::new(0));
        let c = Rc::clone(&calls);
        let callback: StoreCallback<Value> = Rc::new(move |_: &RelationalStore<Value>, _: &StoreEvent<Value>| {
            c.set(c.get() + 1)
        });

        let first = store.subscribe(EventFilter::Any, Rc::clone(&callback), Delivery::Deferred);
        let second = store.subscribe(EventFilter::Any, Rc::clone(&callback), Delivery::Sync);
        assert_eq!(first, second);
        assert_eq!(store.subscriber_count(), 1);

        store.add_node(user("a"), None);
        assert_eq!(calls.get(), 1);
        assert_eq!(store.pending(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let mut store = RelationalStore::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let id = store.on(EventFilter::Any, Delivery::Sync, move |_, _| c.set(c.get() + 1));

        store.add_node(user("a"), None);
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.add_node(user("b"), None);
        assert_eq!(count.get(), 1);
    }

    #[test]
    fn test_deferred_panic_is_isolated() {
        let mut store = RelationalStore::new();
        store.on(EventFilter::Any, Delivery::Deferred, |_, _| panic!("subscriber failure"));
        let after = counter(&mut store, EventFilter::Any, Delivery::Deferred);

        store.add_node(user("a"), None);
        assert_eq!(store.flush(), 2);
        assert_eq!(after.get(), 1);
    }

    #[test]
    fn test_subscriber_sees_store() {
        let mut store = RelationalStore::new();
        let seen = Rc::new(Cell::new(0));
        let s = Rc::clone(&seen);
        store.on(EventKind::EdgeAdded, Delivery::Sync, move |store, event| {
            let edge = event.edge().unwrap();
            s.set(store.edges_for(edge.source, None).map_or(0, |edges| edges.len()));
        });

        let a = store.add_node(user("a"), None);
        let b = store.add_node(user("b"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_iterate() {
        let mut store = RelationalStore::new();
        for name in ["a", "b", "c", "d"] {
            store.add_node(user(name), None);
        }

        assert_eq!(store.iterate(|_| true).count(), 4);
        let names: Vec<String> = store
            .iterate(|node| node.data()["name"] != "b")
            .map(|node| node.data()["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_reset() {
        let mut store = RelationalStore::new();
        let events = counter(&mut store, EventFilter::Any, Delivery::Sync);
        let a = store.add_node(user("a"), Some("a"));
        let b = store.add_node(user("b"), None);
        store.add_edge(a, b, IsFriendOf).unwrap();
        assert_eq!(events.get(), 3);

        store.reset();
        assert_eq!(events.get(), 3);
        assert_eq!(store.node_count(), 0);
        assert_eq!(store.edge_count(), 0);
        assert_eq!(store.subscriber_count(), 0);
        assert_eq!(store.pending(), 0);
        assert!(store.get_node("a").is_none());
    }
}
