//! Bitfinex WebSocket v2 session engine
//!
//! [`BitfinexSession`] is the entry point. It composes the
//! [`ConnectionController`] (transport, pause gating, reconnect) with the
//! expectation registry that correlates server acknowledgements with the
//! operations waiting on them.

pub mod auth;
pub mod config;
pub mod connection;
pub mod frames;
pub mod session;
pub mod types;

pub use auth::{Credentials, HmacSha384Signer, PayloadSigner};
pub use config::{DEFAULT_URL, MAX_BATCH_ORDERS, SessionConfig};
pub use connection::ConnectionController;
pub use frames::{
    AuthEvent, ChannelFrame, ChannelPayload, ErrorEvent, Event, Frame, InfoCode, InfoEvent, NotificationBody,
    OrderEcho, PongEvent, SubscribedEvent, UnsubscribedEvent,
};
pub use session::{ACCOUNT_CHANNEL, BitfinexSession};
pub use types::{
    ChannelSubscription, ConnectionState, OrderDefaults, OrderPayload, OrderRequest, PendingOrderCorrelation,
    SessionState, SubscribeParams,
};
