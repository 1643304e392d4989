//! In-memory transport for driving a session without a socket
//!
//! [`LoopbackConnector`] records every frame the session writes and lets the
//! caller play the server side: open the connection, deliver frames, drop
//! the connection. Used by the test suites and handy for replaying captured
//! traffic.

use crate::errors::{ExchangeError, Result};
use crate::transport::{Connector, Transport, TransportEvents};
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use url::Url;

#[derive(Default)]
struct LoopbackState {
    sent: RefCell<Vec<String>>,
    events: RefCell<Option<TransportEvents>>,
    open: RefCell<Rc<Cell<bool>>>,
    opens: Cell<usize>,
    closes: Cell<usize>,
    refuse_next: Cell<bool>,
}

/// Connector whose transports write into a shared in-memory log
#[derive(Clone, Default)]
pub struct LoopbackConnector {
    state: Rc<LoopbackState>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames written so far, oldest first
    pub fn sent(&self) -> Vec<String> {
        self.state.sent.borrow().clone()
    }

    /// Frames written so far, decoded as JSON (undecodable frames become `Null`)
    pub fn sent_json(&self) -> Vec<Value> {
        self.state
            .sent
            .borrow()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap_or(Value::Null))
            .collect()
    }

    /// Drain the written-frame log
    pub fn take_sent(&self) -> Vec<String> {
        std::mem::take(&mut *self.state.sent.borrow_mut())
    }

    /// Event sink of the most recently opened connection
    pub fn events(&self) -> Option<TransportEvents> {
        self.state.events.borrow().clone()
    }

    /// Mark the current connection open and signal it.
    pub fn accept(&self) {
        self.state.open.borrow().set(true);
        if let Some(events) = self.events() {
            events.opened();
        }
    }

    /// Deliver one server frame on the current connection.
    pub fn deliver(&self, text: &str) {
        if let Some(events) = self.events() {
            events.message(text);
        }
    }

    /// Deliver a JSON value as a server frame.
    pub fn deliver_json(&self, frame: &Value) {
        self.deliver(&frame.to_string());
    }

    /// Simulate the server dropping the current connection.
    pub fn drop_connection(&self) {
        self.state.open.borrow().set(false);
        if let Some(events) = self.events() {
            events.closed();
        }
    }

    /// Make the next `open` fail with a network error.
    pub fn refuse_next_open(&self) {
        self.state.refuse_next.set(true);
    }

    pub fn open_count(&self) -> usize {
        self.state.opens.get()
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.get()
    }

    pub fn is_open(&self) -> bool {
        self.state.open.borrow().get()
    }
}

impl Connector for LoopbackConnector {
    fn open(&self, _url: &Url, events: TransportEvents) -> Result<Box<dyn Transport>> {
        if self.state.refuse_next.replace(false) {
            return Err(ExchangeError::NetworkError("loopback refused connection".to_string()));
        }

        self.state.opens.set(self.state.opens.get() + 1);
        let open = Rc::new(Cell::new(false));
        *self.state.open.borrow_mut() = open.clone();
        *self.state.events.borrow_mut() = Some(events);

        Ok(Box::new(LoopbackTransport {
            state: self.state.clone(),
            open,
        }))
    }
}

struct LoopbackTransport {
    state: Rc<LoopbackState>,
    open: Rc<Cell<bool>>,
}

impl Transport for LoopbackTransport {
    fn send(&self, text: &str) -> Result<()> {
        if !self.open.get() {
            return Err(ExchangeError::NetworkError("loopback transport not open".to_string()));
        }
        self.state.sent.borrow_mut().push(text.to_string());
        Ok(())
    }

    fn close(&self) {
        if self.open.replace(false) {
            self.state.closes.set(self.state.closes.get() + 1);
        }
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }
}
