//! Node implementation
//!
//! A node wraps one payload cell and keeps its own list of payload-change
//! subscribers. Payloads change only through [`Node::patch`], which notifies
//! those subscribers after the patch has been applied.

use super::scheduler::{Task, TaskQueue};
use super::types::{Delivery, NodeId, SubscriptionId};
use crate::patch::{PatchOperation, PatchResult, Patchable};
use indexmap::IndexMap;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

/// Callback invoked with the patched payload and the operations applied
pub type PayloadCallback<T> = Rc<dyn Fn(&T, &[PatchOperation])>;

/// Identity of a payload cell (its address while registered)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct PayloadId(usize);

impl PayloadId {
    pub fn of<T>(payload: &Rc<RefCell<T>>) -> Self {
        PayloadId(Rc::as_ptr(payload) as *const () as usize)
    }
}

struct PayloadSubscriber<T> {
    callback: PayloadCallback<T>,
    delivery: Delivery,
}

/// A node in the relational store
pub struct Node<T> {
    id: NodeId,
    payload: Rc<RefCell<T>>,
    subscribers: IndexMap<SubscriptionId, PayloadSubscriber<T>>,
    next_subscription: u64,
    queue: TaskQueue<T>,
}

impl<T> Node<T> {
    pub(crate) fn new(id: NodeId, payload: Rc<RefCell<T>>, queue: TaskQueue<T>) -> Self {
        Node {
            id,
            payload,
            subscribers: IndexMap::new(),
            next_subscription: 1,
            queue,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The shared payload cell this node was registered with
    pub fn payload(&self) -> &Rc<RefCell<T>> {
        &self.payload
    }

    /// Borrow the current payload value
    pub fn data(&self) -> Ref<'_, T> {
        self.payload.borrow()
    }

    pub(crate) fn payload_id(&self) -> PayloadId {
        PayloadId::of(&self.payload)
    }

    /// Register a payload-change callback.
    ///
    /// Callbacks are deduplicated by `Rc` identity: subscribing the same
    /// callback again only updates its delivery mode and returns the
    /// existing handle.
    pub fn subscribe(&mut self, callback: PayloadCallback<T>, delivery: Delivery) -> SubscriptionId {
        let existing = self
            .subscribers
            .iter_mut()
            .find(|(_, sub)| same_callback(&sub.callback, &callback));
        if let Some((id, sub)) = existing {
            sub.delivery = delivery;
            return *id;
        }

        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.insert(id, PayloadSubscriber { callback, delivery });
        id
    }

    /// Remove exactly the subscription `id`
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.shift_remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Apply `operations` to the payload, then notify subscribers.
    ///
    /// Sync subscribers run inline in registration order. Deferred ones are
    /// queued as one task each. Nothing is notified if the patch fails.
    pub fn patch(&mut self, operations: &[PatchOperation]) -> PatchResult<()>
    where
        T: Patchable,
    {
        self.payload.borrow_mut().apply_patch(operations)?;

        let operations: Rc<[PatchOperation]> = operations.into();
        let data = self.payload.borrow();
        for sub in self.subscribers.values() {
            match sub.delivery {
                Delivery::Sync => (sub.callback)(&*data, &operations[..]),
                Delivery::Deferred => self.queue.push(Task::Payload {
                    callback: Rc::clone(&sub.callback),
                    payload: Rc::clone(&self.payload),
                    operations: Rc::clone(&operations),
                }),
            }
        }
        Ok(())
    }
}

impl<T: fmt::Debug> fmt::Debug for Node<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("payload", &self.payload)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

pub(crate) fn same_callback<F: ?Sized>(a: &Rc<F>, b: &Rc<F>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}
