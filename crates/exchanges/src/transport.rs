//! Transport seam between the session engine and a socket implementation
//!
//! A [`Connector`] opens one connection per call and hands back a
//! [`Transport`] handle for writes. Inbound traffic flows the other way
//! through the [`TransportEvents`] sink given to `open`: one `opened`, any
//! number of `message`s, at most one `closed`.
//!
//! Every sink is stamped with the generation of the connection it belongs
//! to. Once the listener moves to a newer generation (reconnect, close), a
//! stale transport's events are dropped by the listener, which detaches the
//! old socket without the transport's cooperation.

use crate::errors::Result;
use std::rc::Weak;
use url::Url;

/// Outbound half of an open connection
pub trait Transport {
    /// Write one text frame.
    fn send(&self, text: &str) -> Result<()>;

    /// Begin closing the connection. Idempotent.
    fn close(&self);

    /// Whether writes are currently accepted
    fn is_open(&self) -> bool;
}

/// Factory for transports
///
/// Implementations must deliver events asynchronously: never call into
/// `events` from inside `open`, `Transport::send` or `Transport::close`.
pub trait Connector {
    fn open(&self, url: &Url, events: TransportEvents) -> Result<Box<dyn Transport>>;
}

/// Receiver of transport events, tagged with the connection generation
pub trait TransportListener {
    fn on_open(&self, generation: u64);
    fn on_message(&self, generation: u64, text: &str);
    fn on_close(&self, generation: u64);
}

/// Event sink handed to a transport when it is opened
#[derive(Clone)]
pub struct TransportEvents {
    listener: Weak<dyn TransportListener>,
    generation: u64,
}

impl TransportEvents {
    pub fn new(listener: Weak<dyn TransportListener>, generation: u64) -> Self {
        Self { listener, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_open(self.generation);
        }
    }

    pub fn message(&self, text: &str) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_message(self.generation, text);
        }
    }

    pub fn closed(&self) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_close(self.generation);
        }
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .field("attached", &(self.listener.strong_count() > 0))
            .finish()
    }
}
