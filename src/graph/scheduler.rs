//! Deferred work queue
//!
//! Deferred notifications are queued here as independent units and run in
//! FIFO order by [`RelationalStore::flush`](super::RelationalStore::flush).
//! Work queued while the queue is being drained runs in the same flush.

use super::event::{Listener, StoreEvent};
use super::node::PayloadCallback;
use crate::patch::PatchOperation;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub(crate) enum Task<T> {
    /// Node-level payload subscriber
    Payload {
        callback: PayloadCallback<T>,
        payload: Rc<RefCell<T>>,
        operations: Rc<[PatchOperation]>,
    },
    /// Store-level emit requested from outside the store (payload forwarding)
    Emit(StoreEvent<T>),
    /// One store-level subscriber, one event
    Deliver {
        listener: Listener<T>,
        event: Rc<StoreEvent<T>>,
    },
}

/// Shared handle to the queue; the store and every node hold a clone
pub(crate) struct TaskQueue<T> {
    tasks: Rc<RefCell<VecDeque<Task<T>>>>,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        TaskQueue {
            tasks: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn push(&self, task: Task<T>) {
        self.tasks.borrow_mut().push_back(task);
    }

    pub fn pop(&self) -> Option<Task<T>> {
        self.tasks.borrow_mut().pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.borrow().len()
    }

    pub fn clear(&self) {
        self.tasks.borrow_mut().clear();
    }
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        TaskQueue {
            tasks: Rc::clone(&self.tasks),
        }
    }
}
