//! Deferred action queue
//!
//! Holds outbound operations issued while the connection cannot accept them
//! and replays them, in call order, once it can. [`ActionRegistry::fire`]
//! swaps the queue out before invoking anything, so an action that queues
//! new work (a replayed send that finds the connection paused again) lands
//! in the fresh queue and waits for the next `fire`.

use std::cell::RefCell;
use std::fmt;

/// A deferred zero-argument operation
pub type PendingAction = Box<dyn FnOnce()>;

#[derive(Default)]
pub struct ActionRegistry {
    queue: RefCell<Vec<PendingAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action; returns the queue length after the append.
    pub fn add<F>(&self, action: F) -> usize
    where
        F: FnOnce() + 'static,
    {
        let mut queue = self.queue.borrow_mut();
        queue.push(Box::new(action));
        queue.len()
    }

    /// Drain the queue and invoke every drained action in insertion order.
    ///
    /// Returns the number of actions invoked. A panicking action unwinds
    /// through `fire` and the rest of that batch is dropped unrun.
    pub fn fire(&self) -> usize {
        let drained = std::mem::take(&mut *self.queue.borrow_mut());
        let count = drained.len();
        for action in drained {
            action();
        }
        count
    }

    /// Drop every queued action without running it; returns how many were dropped.
    pub fn discard(&self) -> usize {
        let drained = std::mem::take(&mut *self.queue.borrow_mut());
        drained.len()
    }

    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry").field("pending", &self.len()).finish()
    }
}
