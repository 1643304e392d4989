//! # bfxlink exchanges
//!
//! Client engine for the Bitfinex WebSocket v2 trading protocol.
//!
//! ## Architecture
//!
//! - **ActionRegistry** - ordered queue of deferred sends, replayed on resume
//! - **ExpectationRegistry** - once / keyed / observe predicate routing of inbound frames
//! - **ConnectionController** - transport ownership, version handshake, pause/resume, restart
//! - **BitfinexSession** - subscribe, authenticate, ping and order correlation
//! - **monoio WebSocket** - RFC 6455 client over rustls, pumped on a spawned task
//!
//! Everything runs on one monoio thread; handles are `Rc`-based and not `Send`.

pub mod actions;
pub mod bitfinex;
pub mod errors;
pub mod expectations;
pub mod loopback;
pub mod outcome;
pub mod tls;
pub mod transport;
pub mod websocket;

// Re-export main types
pub use actions::ActionRegistry;
pub use bitfinex::{BitfinexSession, SessionConfig};
pub use errors::{ExchangeError, Result};
pub use expectations::{ExpectationId, ExpectationMode, ExpectationRegistry};
pub use loopback::LoopbackConnector;
pub use outcome::{Completer, Outcome};
pub use transport::{Connector, Transport, TransportEvents, TransportListener};
pub use websocket::{MonoioWebSocket, WsConnector};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::actions::ActionRegistry;
    pub use crate::bitfinex::*;
    pub use crate::errors::{ExchangeError, Result};
    pub use crate::expectations::{ExpectationMode, ExpectationRegistry};
    pub use crate::loopback::LoopbackConnector;
    pub use crate::outcome::{Completer, Outcome};
    pub use crate::transport::{Connector, Transport, TransportEvents};
    pub use crate::websocket::{MonoioWebSocket, WsConnector};
    pub use bfxlink_core::prelude::*;
}
