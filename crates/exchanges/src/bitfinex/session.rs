//! Bitfinex protocol session
//!
//! Request/acknowledgement protocols built on the expectation registry and
//! the connection controller:
//!
//! - subscribe / unsubscribe, matched by channel and symbol (or key)
//! - authenticate, answered on channel 0
//! - ping, matched by `cid`
//! - single and batched order placement, matched by the correlation id
//!   echoed in each order notification
//!
//! Every operation registers its expectation before the request is written
//! and returns an [`Outcome`] the caller awaits. Requests issued while the
//! connection is paused or still opening are queued by the controller and go
//! out in call order. A request already written when the transport drops is
//! abandoned and its outcome fails with [`ExchangeError::ConnectionClosed`];
//! issue it again after reconnecting.

use crate::bitfinex::auth::{AuthRequest, Credentials, HmacSha384Signer, PayloadSigner};
use crate::bitfinex::config::SessionConfig;
use crate::bitfinex::connection::ConnectionController;
use crate::bitfinex::frames::{
    AuthEvent, ChannelFrame, ChannelPayload, Event, Frame, NotificationBody, PongEvent, SubscribedEvent,
    UnsubscribedEvent,
};
use crate::bitfinex::types::{
    ChannelSubscription, ConnectionState, OrderPayload, OrderRequest, PendingOrderCorrelation, SessionState,
    SubscribeParams, SubscribeRequest,
};
use crate::errors::{ExchangeError, Result};
use crate::expectations::{ExpectationId, ExpectationRegistry};
use crate::outcome::{Completer, Outcome, outcome};
use crate::transport::Connector;
use crate::websocket::WsConnector;
use bfxlink_core::{CorrelationIdGenerator, SequenceGenerator, Timestamp, log_latency, log_order, micros, millis};

use serde::Serialize;
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use tracing::{debug, info, warn};
use url::Url;

/// System channel carrying account data and order notifications
pub const ACCOUNT_CHANNEL: u64 = 0;

type ChannelHandler = Rc<RefCell<dyn FnMut(&ChannelFrame)>>;

/// Handle to a session; clones share the same connection
#[derive(Clone)]
pub struct BitfinexSession {
    inner: Rc<SessionInner>,
}

struct SessionInner {
    me: Weak<SessionInner>,
    config: SessionConfig,
    controller: Rc<ConnectionController>,
    expectations: Rc<ExpectationRegistry<Frame>>,
    authorized: Cell<bool>,
    subscriptions: RefCell<HashMap<u64, ChannelSubscription>>,
    account_handler: RefCell<Option<ChannelHandler>>,
    correlation_ids: CorrelationIdGenerator,
    ping_ids: SequenceGenerator,
    signer: Box<dyn PayloadSigner>,
}

impl BitfinexSession {
    pub fn new(config: SessionConfig, connector: impl Connector + 'static) -> Result<Self> {
        Self::with_signer(config, connector, HmacSha384Signer)
    }

    /// Session over the monoio WebSocket transport
    pub fn websocket(config: SessionConfig) -> Result<Self> {
        Self::new(config, WsConnector::new())
    }

    pub fn with_signer(
        config: SessionConfig,
        connector: impl Connector + 'static,
        signer: impl PayloadSigner + 'static,
    ) -> Result<Self> {
        let url = Url::parse(&config.url)?;
        if config.allowed_versions.is_empty() {
            return Err(ExchangeError::ConfigurationError(
                "at least one protocol version must be allowed".to_string(),
            ));
        }

        let expectations = Rc::new(ExpectationRegistry::new());
        let controller = ConnectionController::new(
            url,
            config.allowed_versions.clone(),
            Box::new(connector),
            expectations.clone(),
        );

        let inner = Rc::new_cyclic(|me| SessionInner {
            me: me.clone(),
            config,
            controller,
            expectations,
            authorized: Cell::new(false),
            subscriptions: RefCell::new(HashMap::new()),
            account_handler: RefCell::new(None),
            correlation_ids: CorrelationIdGenerator::new(),
            ping_ids: SequenceGenerator::new(),
            signer: Box::new(signer),
        });

        let weak = inner.me.clone();
        inner.controller.on_teardown(move || {
            if let Some(inner) = weak.upgrade() {
                inner.reset();
            }
        });

        info!("🚀 Bitfinex session created for {}", inner.config.url);
        Ok(Self { inner })
    }

    pub fn connect(&self) -> Result<()> {
        self.inner.controller.connect()
    }

    /// Close the connection, discarding queued requests.
    pub fn close(&self) {
        self.inner.controller.close();
    }

    /// Authenticate with explicit credentials.
    ///
    /// Fails immediately only if the payload cannot be signed; the server's
    /// verdict arrives through the outcome.
    pub fn authenticate(&self, api_key: &str, api_secret: &str) -> Result<Outcome<AuthEvent>> {
        let credentials = Credentials::new(api_key, api_secret);
        let request = AuthRequest::build(
            &credentials,
            &self.inner.config.auth_prefix,
            micros(),
            self.inner.signer.as_ref(),
        )?;
        let text = serde_json::to_string(&request)?;

        let (completer, outcome) = outcome();
        let weak = Rc::downgrade(&self.inner);
        let mut completer = Some(completer);
        let reply = self.inner.expectations.once(
            |frame| matches!(frame.event(), Some(Event::Auth(ack)) if ack.chan_id == ACCOUNT_CHANNEL),
            move |frame| {
                let (Some(inner), Some(Event::Auth(ack))) = (weak.upgrade(), frame.event()) else {
                    return;
                };
                if let Some(completer) = completer.take() {
                    inner.on_auth(ack, completer);
                }
            },
        );

        self.inner.controller.send_request(text, vec![reply]);
        Ok(outcome)
    }

    /// Authenticate with the credentials in the session config.
    pub fn authenticate_with_config(&self) -> Result<Outcome<AuthEvent>> {
        let credentials = self.inner.config.credentials().ok_or_else(|| {
            ExchangeError::MissingCredentials("session config has no api key/secret".to_string())
        })?;
        self.authenticate(&credentials.api_key, &credentials.api_secret)
    }

    /// Subscribe to a public channel.
    ///
    /// Once acknowledged, frames on the assigned channel id go to `on_data`;
    /// heartbeats are tracked separately and never reach it.
    pub fn subscribe<F>(&self, channel: &str, params: SubscribeParams, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        let (completer, outcome) = outcome();
        let text = match serde_json::to_string(&SubscribeRequest::new(channel, &params)) {
            Ok(text) => text,
            Err(e) => {
                completer.reject(e.into());
                return outcome;
            }
        };

        let weak = Rc::downgrade(&self.inner);
        let wanted_channel = channel.to_string();
        let mut pending = Some((completer, on_data));
        let reply = self.inner.expectations.once(
            {
                let channel = channel.to_string();
                let params = params.clone();
                move |frame| match frame.event() {
                    Some(Event::Subscribed(ack)) => params.is_acknowledged_by(&channel, ack),
                    Some(Event::Error(err)) => err.answers_subscription(&channel, params.subscription_key()),
                    _ => false,
                }
            },
            move |frame| {
                let Some((completer, on_data)) = pending.take() else {
                    return;
                };
                match frame.event() {
                    Some(Event::Subscribed(ack)) => {
                        if let Some(inner) = weak.upgrade() {
                            inner.install_channel_route(ack, on_data);
                        }
                        completer.resolve(ack.clone());
                    }
                    Some(Event::Error(err)) => {
                        warn!("⚠️  Subscribe to {} rejected: {}", wanted_channel, err.message());
                        completer.reject(ExchangeError::SubscriptionRejected {
                            channel: wanted_channel.clone(),
                            code: err.code,
                            message: err.message(),
                        });
                    }
                    _ => {}
                }
            },
        );

        debug!("Subscribing to {} {}", channel, params.subscription_key());
        self.inner.controller.send_request(text, vec![reply]);
        outcome
    }

    pub fn subscribe_ticker<F>(&self, pair: &str, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        self.subscribe("ticker", SubscribeParams::trading(pair), on_data)
    }

    pub fn subscribe_fticker<F>(&self, currency: &str, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        self.subscribe("ticker", SubscribeParams::funding(currency), on_data)
    }

    pub fn subscribe_trades<F>(&self, pair: &str, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        self.subscribe("trades", SubscribeParams::trading(pair), on_data)
    }

    pub fn subscribe_ftrades<F>(&self, currency: &str, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        self.subscribe("trades", SubscribeParams::funding(currency), on_data)
    }

    pub fn subscribe_books<F>(&self, pair: &str, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        self.subscribe("book", SubscribeParams::trading(pair), on_data)
    }

    pub fn subscribe_raw_books<F>(&self, pair: &str, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        self.subscribe("book", SubscribeParams::trading(pair).with_precision("R0"), on_data)
    }

    /// Candles for `pair`; `timeframe` defaults to `1m`.
    pub fn subscribe_candles<F>(&self, pair: &str, timeframe: Option<&str>, on_data: F) -> Outcome<SubscribedEvent>
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        let timeframe = timeframe.unwrap_or("1m");
        self.subscribe("candles", SubscribeParams::keyed(format!("trade:{timeframe}:t{pair}")), on_data)
    }

    /// Unsubscribe from `chan_id`; the channel's route is removed on ack.
    pub fn unsubscribe(&self, chan_id: u64) -> Outcome<UnsubscribedEvent> {
        let (completer, outcome) = outcome();
        let weak = Rc::downgrade(&self.inner);
        let mut completer = Some(completer);
        let reply = self.inner.expectations.once(
            move |frame| match frame.event() {
                Some(Event::Unsubscribed(ack)) => ack.chan_id == chan_id,
                Some(Event::Error(err)) => err.chan_id == Some(chan_id),
                _ => false,
            },
            move |frame| {
                let Some(completer) = completer.take() else {
                    return;
                };
                match frame.event() {
                    Some(Event::Unsubscribed(ack)) if ack.is_ok() => {
                        if let Some(inner) = weak.upgrade() {
                            inner.remove_channel(chan_id);
                        }
                        completer.resolve(ack.clone());
                    }
                    Some(Event::Unsubscribed(ack)) => completer.reject(ExchangeError::UnsubscribeRejected {
                        chan_id,
                        code: None,
                        message: ack.status.clone(),
                    }),
                    Some(Event::Error(err)) => completer.reject(ExchangeError::UnsubscribeRejected {
                        chan_id,
                        code: err.code,
                        message: err.message(),
                    }),
                    _ => {}
                }
            },
        );

        self.send_request(&json!({"event": "unsubscribe", "chanId": chan_id}), reply);
        outcome
    }

    /// Ping the server; resolves with the matching pong.
    pub fn ping(&self) -> Outcome<PongEvent> {
        let cid = self.inner.ping_ids.next_id();
        let (completer, outcome) = outcome();
        let mut completer = Some(completer);
        let reply = self.inner.expectations.once(
            move |frame| matches!(frame.event(), Some(Event::Pong(pong)) if pong.cid == cid),
            move |frame| {
                if let (Some(completer), Some(Event::Pong(pong))) = (completer.take(), frame.event()) {
                    info!("🏓 Pong for cid {} (server ts {:?})", pong.cid, pong.ts);
                    completer.resolve(pong.clone());
                }
            },
        );

        self.send_request(&json!({"event": "ping", "cid": cid}), reply);
        outcome
    }

    /// Submit one order on the account channel.
    ///
    /// Rejected locally, with nothing sent, unless authenticated. The outcome
    /// resolves with the order's notification when its status is `SUCCESS`
    /// and fails with [`ExchangeError::OrderRejected`] otherwise.
    pub fn place_order(&self, order: OrderRequest) -> Result<Outcome<NotificationBody>> {
        self.ensure_authorized("place_order")?;

        let cid = self.inner.correlation_ids.next_id();
        let payload = OrderPayload::merge(&order, &self.inner.config.order_defaults, cid);
        let text = serde_json::to_string(&(ACCOUNT_CHANNEL, "on", None::<()>, &payload))?;

        let (completer, outcome) = outcome();
        let mut completer = Some(completer);
        let symbol = payload.symbol.clone();
        let submitted = Timestamp::now();
        let reply = self.inner.expectations.once(
            move |frame| frame.notification().and_then(NotificationBody::correlation_id) == Some(cid),
            move |frame| {
                let (Some(completer), Some(body)) = (completer.take(), frame.notification()) else {
                    return;
                };
                log_order!(body.status, cid, symbol);
                log_latency!("order_ack", submitted.elapsed_micros());
                if let Some(server_time) = body.timestamp() {
                    debug!("Order {} notification stamped {}", cid, server_time);
                }
                if body.is_success() {
                    completer.resolve(body.clone());
                } else {
                    warn!("⚠️  Order {} rejected: {}", cid, body.text);
                    completer.reject(ExchangeError::OrderRejected(Box::new(body.clone())));
                }
            },
        );

        log_order!("SUBMITTED", cid, payload.symbol);
        self.inner.controller.send_request(text, vec![reply]);
        Ok(outcome)
    }

    /// Submit up to `max_batch_size` orders in one `ox_multi` frame.
    ///
    /// Responses are returned in submission order. The batch succeeds only
    /// if every order does; otherwise it fails with
    /// [`ExchangeError::BatchRejected`] carrying all responses.
    pub fn place_orders(&self, orders: Vec<OrderRequest>) -> Result<Outcome<Vec<NotificationBody>>> {
        self.ensure_authorized("place_orders")?;
        if orders.is_empty() {
            return Err(ExchangeError::EmptyBatch);
        }
        let max = self.inner.config.max_batch_size;
        if orders.len() > max {
            return Err(ExchangeError::BatchSizeExceeded {
                size: orders.len(),
                max,
            });
        }

        let base = self.inner.correlation_ids.reserve(orders.len() as u64);
        let payloads: Vec<OrderPayload> = orders
            .iter()
            .enumerate()
            .map(|(index, order)| OrderPayload::merge(order, &self.inner.config.order_defaults, base + index as u64))
            .collect();
        let ops: Vec<(&str, &OrderPayload)> = payloads.iter().map(|payload| ("on", payload)).collect();
        let text = serde_json::to_string(&(ACCOUNT_CHANNEL, "ox_multi", None::<()>, ops))?;

        let (completer, outcome) = outcome();
        let correlation = Rc::new(RefCell::new(PendingOrderCorrelation::new(base, payloads.len(), completer)));
        let mut replies = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.iter().enumerate() {
            let cid = payload.cid;
            let correlation = correlation.clone();
            let reply = self.inner.expectations.once(
                move |frame| frame.notification().and_then(NotificationBody::correlation_id) == Some(cid),
                move |frame| {
                    if let Some(body) = frame.notification() {
                        debug!("Batch {} order {} acknowledged: {}", base, index, body.status);
                        correlation.borrow_mut().record(index, body.clone());
                    }
                },
            );
            replies.push(reply);
        }

        log_order!(format!("BATCH x{}", payloads.len()), base, payloads[0].symbol);
        self.inner.controller.send_request(text, replies);
        Ok(outcome)
    }

    /// Handler for account-channel data once authenticated.
    ///
    /// Order notifications claimed by a pending order never reach it.
    pub fn on_account_event<F>(&self, handler: F)
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        *self.inner.account_handler.borrow_mut() = Some(Rc::new(RefCell::new(handler)));
    }

    /// Snapshot of the active subscriptions keyed by channel id
    pub fn subscriptions(&self) -> HashMap<u64, ChannelSubscription> {
        self.inner.subscriptions.borrow().clone()
    }

    pub fn is_authorized(&self) -> bool {
        self.inner.authorized.get()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.controller.state()
    }

    pub fn session_state(&self) -> SessionState {
        let controller = &self.inner.controller;
        SessionState {
            connected: controller.is_connected(),
            paused: !controller.is_active(),
            authorized: self.inner.authorized.get(),
            version_validated: controller.is_version_validated(),
        }
    }

    /// Requests waiting for the connection to become active
    pub fn pending_actions(&self) -> usize {
        self.inner.controller.pending_len()
    }

    pub fn controller(&self) -> &Rc<ConnectionController> {
        &self.inner.controller
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn ensure_authorized(&self, operation: &str) -> Result<()> {
        if self.inner.authorized.get() {
            return Ok(());
        }
        warn!("⚠️  {} rejected: session is not authenticated", operation);
        Err(ExchangeError::Unauthorized(format!("{operation} requires an authenticated session")))
    }

    fn send_request<T: Serialize>(&self, payload: &T, reply: ExpectationId) {
        match serde_json::to_string(payload) {
            Ok(text) => self.inner.controller.send_request(text, vec![reply]),
            Err(e) => {
                warn!("❌ Failed to encode request: {}", e);
                self.inner.expectations.cancel(reply);
            }
        }
    }
}

impl SessionInner {
    fn on_auth(&self, ack: &AuthEvent, completer: Completer<AuthEvent>) {
        if !ack.is_ok() {
            warn!("❌ Authentication failed: {:?} (code {:?})", ack.msg, ack.code);
            completer.reject(ExchangeError::AuthenticationFailed {
                code: ack.code,
                message: ack.msg.clone().unwrap_or_else(|| ack.status.clone()),
            });
            return;
        }

        info!("🔐 Authenticated (user {:?})", ack.user_id);
        self.authorized.set(true);
        self.install_account_route();
        completer.resolve(ack.clone());
    }

    fn install_account_route(&self) {
        let weak = self.weak_self();
        self.expectations.whenever(
            ACCOUNT_CHANNEL,
            |frame| frame.chan_id() == Some(ACCOUNT_CHANNEL),
            move |frame| {
                let Some(channel) = frame.channel() else {
                    return;
                };
                if channel.is_heartbeat() {
                    debug!("💓 Heartbeat on account channel");
                    return;
                }
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let handler = inner.account_handler.borrow().clone();
                match handler {
                    Some(handler) => match handler.try_borrow_mut() {
                        Ok(mut handler) => (&mut *handler)(channel),
                        Err(_) => warn!("account handler re-entered; frame dropped"),
                    },
                    None => debug!("Account frame without handler: {:?}", channel.payload),
                }
            },
        );
    }

    fn install_channel_route<F>(&self, ack: &SubscribedEvent, mut on_data: F)
    where
        F: FnMut(&ChannelFrame) + 'static,
    {
        let chan_id = ack.chan_id;
        self.subscriptions
            .borrow_mut()
            .insert(chan_id, ChannelSubscription::from(ack));
        info!("📡 Subscribed to {} on channel {}", ack.channel, chan_id);

        let weak = self.weak_self();
        self.expectations.whenever(
            chan_id,
            move |frame| frame.chan_id() == Some(chan_id),
            move |frame| {
                let Some(channel) = frame.channel() else {
                    return;
                };
                match channel.payload {
                    ChannelPayload::Heartbeat => {
                        if let Some(inner) = weak.upgrade() {
                            inner.record_heartbeat(chan_id);
                        }
                    }
                    _ => on_data(channel),
                }
            },
        );
    }

    fn record_heartbeat(&self, chan_id: u64) {
        if let Some(subscription) = self.subscriptions.borrow_mut().get_mut(&chan_id) {
            subscription.last_heartbeat = Some(millis());
        }
        debug!("💓 Heartbeat on channel {}", chan_id);
    }

    fn remove_channel(&self, chan_id: u64) {
        self.expectations.remove_route(chan_id);
        if let Some(subscription) = self.subscriptions.borrow_mut().remove(&chan_id) {
            info!("📴 Unsubscribed from {} {} (channel {})", subscription.channel, subscription.key, chan_id);
        }
    }

    fn reset(&self) {
        self.authorized.set(false);
        self.subscriptions.borrow_mut().clear();
    }

    fn weak_self(&self) -> Weak<SessionInner> {
        self.me.clone()
    }
}
