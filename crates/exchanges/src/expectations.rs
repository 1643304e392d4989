//! Expectation registry: predicate/handler pairs matched against inbound messages
//!
//! Three classes are scanned in a fixed order on every [`dispatch`]:
//!
//! 1. **Once** - removed on first match. Pending request/response pairs live here.
//! 2. **Keyed** - persistent routes, at most one per key (channel id). A later
//!    registration for the same key replaces the earlier one.
//! 3. **Observe** - passive listeners, only consulted when neither of the
//!    classes above matched, and never reported as consuming the message.
//!
//! Exactly one handler runs per dispatch; within a class the earliest
//! registration wins.
//!
//! No borrow of the registry is held while a handler runs, so handlers may
//! register, cancel or remove expectations (including their own route).
//! Predicates are evaluated under a borrow and must not touch the registry.
//! A panicking predicate is treated as a non-match.
//!
//! A once expectation can be flagged in flight when the request it answers
//! has been written to a transport. Dropping the in-flight entries on
//! teardown keeps replies for a dead connection from claiming a retry's
//! acknowledgement.
//!
//! [`dispatch`]: ExpectationRegistry::dispatch

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tracing::warn;

/// Handle for cancelling a registered expectation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExpectationId(u64);

/// Key of a persistent route
pub type RouteKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectationMode {
    Once,
    Keyed(RouteKey),
    Observe,
}

type Predicate<M> = Box<dyn Fn(&M) -> bool>;
type Handler<M> = Rc<RefCell<dyn FnMut(&M)>>;

struct Expectation<M> {
    id: ExpectationId,
    key: Option<RouteKey>,
    in_flight: bool,
    predicate: Predicate<M>,
    handler: Handler<M>,
}

pub struct ExpectationRegistry<M> {
    once: RefCell<Vec<Expectation<M>>>,
    keyed: RefCell<Vec<Expectation<M>>>,
    observe: RefCell<Vec<Expectation<M>>>,
    next_id: Cell<u64>,
}

impl<M: 'static> ExpectationRegistry<M> {
    pub fn new() -> Self {
        Self {
            once: RefCell::new(Vec::new()),
            keyed: RefCell::new(Vec::new()),
            observe: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
        }
    }

    /// Install an expectation of the given mode.
    ///
    /// A predicate that panics counts as a non-match and the scan moves on
    /// to the next entry. Builds with `panic = "abort"` still abort.
    pub fn register<P, H>(&self, mode: ExpectationMode, predicate: P, handler: H) -> ExpectationId
    where
        P: Fn(&M) -> bool + 'static,
        H: FnMut(&M) + 'static,
    {
        let id = ExpectationId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let key = match mode {
            ExpectationMode::Keyed(key) => Some(key),
            _ => None,
        };
        let expectation = Expectation {
            id,
            key,
            in_flight: false,
            predicate: Box::new(predicate),
            handler: Rc::new(RefCell::new(handler)),
        };

        match mode {
            ExpectationMode::Once => self.once.borrow_mut().push(expectation),
            ExpectationMode::Observe => self.observe.borrow_mut().push(expectation),
            ExpectationMode::Keyed(key) => {
                let mut keyed = self.keyed.borrow_mut();
                match keyed.iter_mut().find(|existing| existing.key == Some(key)) {
                    Some(slot) => *slot = expectation,
                    None => keyed.push(expectation),
                }
            }
        }
        id
    }

    pub fn once<P, H>(&self, predicate: P, handler: H) -> ExpectationId
    where
        P: Fn(&M) -> bool + 'static,
        H: FnMut(&M) + 'static,
    {
        self.register(ExpectationMode::Once, predicate, handler)
    }

    pub fn whenever<P, H>(&self, key: RouteKey, predicate: P, handler: H) -> ExpectationId
    where
        P: Fn(&M) -> bool + 'static,
        H: FnMut(&M) + 'static,
    {
        self.register(ExpectationMode::Keyed(key), predicate, handler)
    }

    pub fn observe<P, H>(&self, predicate: P, handler: H) -> ExpectationId
    where
        P: Fn(&M) -> bool + 'static,
        H: FnMut(&M) + 'static,
    {
        self.register(ExpectationMode::Observe, predicate, handler)
    }

    /// Route `message` to at most one handler.
    ///
    /// Returns `true` when a once or keyed expectation consumed it. An
    /// observer match still returns `false` so the caller's fallback runs.
    pub fn dispatch(&self, message: &M) -> bool {
        let once_hit = {
            let mut once = self.once.borrow_mut();
            once.iter()
                .position(|e| predicate_holds(e, message))
                .map(|index| once.remove(index))
        };
        if let Some(expectation) = once_hit {
            invoke(&expectation.handler, message);
            return true;
        }

        if let Some(handler) = first_match(&self.keyed, message) {
            invoke(&handler, message);
            return true;
        }

        if let Some(handler) = first_match(&self.observe, message) {
            invoke(&handler, message);
        }
        false
    }

    /// Remove a once or observe expectation before it fires.
    pub fn cancel(&self, id: ExpectationId) -> bool {
        [&self.once, &self.keyed, &self.observe].into_iter().any(|list| {
            let mut list = list.borrow_mut();
            let before = list.len();
            list.retain(|e| e.id != id);
            list.len() != before
        })
    }

    /// Remove the persistent route installed under `key`.
    pub fn remove_route(&self, key: RouteKey) -> bool {
        let mut keyed = self.keyed.borrow_mut();
        let before = keyed.len();
        keyed.retain(|e| e.key != Some(key));
        keyed.len() != before
    }

    /// Remove every persistent route; returns how many were dropped.
    pub fn clear_routes(&self) -> usize {
        let dropped = std::mem::take(&mut *self.keyed.borrow_mut());
        dropped.len()
    }

    /// Drop every outstanding once expectation; returns how many were dropped.
    ///
    /// Handlers are dropped unrun, which abandons any outcome they would
    /// have settled.
    pub fn clear_pending(&self) -> usize {
        let dropped = std::mem::take(&mut *self.once.borrow_mut());
        dropped.len()
    }

    /// Flag once expectations whose request was written to the transport.
    pub fn mark_in_flight(&self, ids: &[ExpectationId]) {
        for expectation in self.once.borrow_mut().iter_mut() {
            if ids.contains(&expectation.id) {
                expectation.in_flight = true;
            }
        }
    }

    /// Drop once expectations flagged in flight; returns how many were dropped.
    ///
    /// Entries still waiting on a queued request are kept.
    pub fn drop_in_flight(&self) -> usize {
        let dropped: Vec<Expectation<M>> = {
            let mut once = self.once.borrow_mut();
            let (dropped, kept) = std::mem::take(&mut *once).into_iter().partition(|e| e.in_flight);
            *once = kept;
            dropped
        };
        dropped.len()
    }

    pub fn has_route(&self, key: RouteKey) -> bool {
        self.keyed.borrow().iter().any(|e| e.key == Some(key))
    }

    pub fn once_len(&self) -> usize {
        self.once.borrow().len()
    }

    pub fn route_len(&self) -> usize {
        self.keyed.borrow().len()
    }

    pub fn observer_len(&self) -> usize {
        self.observe.borrow().len()
    }
}

impl<M: 'static> Default for ExpectationRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> fmt::Debug for ExpectationRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectationRegistry")
            .field("once", &self.once.borrow().len())
            .field("keyed", &self.keyed.borrow().len())
            .field("observe", &self.observe.borrow().len())
            .finish()
    }
}

fn first_match<M>(list: &RefCell<Vec<Expectation<M>>>, message: &M) -> Option<Handler<M>> {
    list.borrow()
        .iter()
        .find(|e| predicate_holds(e, message))
        .map(|e| e.handler.clone())
}

fn predicate_holds<M>(expectation: &Expectation<M>, message: &M) -> bool {
    panic::catch_unwind(AssertUnwindSafe(|| (expectation.predicate)(message))).unwrap_or_else(|_| {
        warn!("predicate of expectation {:?} panicked; treated as no match", expectation.id);
        false
    })
}

fn invoke<M>(handler: &Handler<M>, message: &M) {
    match handler.try_borrow_mut() {
        Ok(mut handler) => (&mut *handler)(message),
        Err(_) => warn!("expectation handler re-entered during its own dispatch; message dropped"),
    }
}
