//! Bitfinex session and request types

use crate::bitfinex::frames::{NotificationBody, SubscribedEvent};
use crate::errors::ExchangeError;
use crate::outcome::Completer;
use rust_decimal::Decimal;
use serde::Serialize;

/// Connection lifecycle as seen by the outbound queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Transport requested, not yet open
    Connecting,
    /// Open but holding outbound traffic (maintenance)
    Paused,
    Active,
}

/// Flag view of the session, reset to the initial values on close/reconnect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub connected: bool,
    pub paused: bool,
    pub authorized: bool,
    pub version_validated: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            connected: false,
            paused: true,
            authorized: false,
            version_validated: false,
        }
    }
}

/// A live channel, from subscribe-ack to unsubscribe-ack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSubscription {
    pub chan_id: u64,
    pub channel: String,
    pub key: String,
    /// Local receive time (ms) of the last heartbeat
    pub last_heartbeat: Option<u64>,
}

impl From<&SubscribedEvent> for ChannelSubscription {
    fn from(ack: &SubscribedEvent) -> Self {
        Self {
            chan_id: ack.chan_id,
            channel: ack.channel.clone(),
            key: ack.subscription_key().unwrap_or_default().to_string(),
            last_heartbeat: None,
        }
    }
}

/// Parameters of a public channel subscription
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscribeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub len: Option<String>,
}

impl SubscribeParams {
    /// Trading pair, e.g. `BTCUSD` -> `tBTCUSD`
    pub fn trading(pair: &str) -> Self {
        Self {
            symbol: Some(format!("t{pair}")),
            ..Self::default()
        }
    }

    /// Funding currency, e.g. `USD` -> `fUSD`
    pub fn funding(currency: &str) -> Self {
        Self {
            symbol: Some(format!("f{currency}")),
            ..Self::default()
        }
    }

    /// Keyed channel such as candles (`trade:1m:tBTCUSD`)
    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_precision(mut self, prec: impl Into<String>) -> Self {
        self.prec = Some(prec.into());
        self
    }

    pub fn with_frequency(mut self, freq: impl Into<String>) -> Self {
        self.freq = Some(freq.into());
        self
    }

    pub fn with_length(mut self, len: impl Into<String>) -> Self {
        self.len = Some(len.into());
        self
    }

    /// Key the acknowledgement is matched on
    pub fn subscription_key(&self) -> &str {
        self.key
            .as_deref()
            .or(self.symbol.as_deref())
            .unwrap_or_default()
    }

    /// Whether `ack` acknowledges a subscribe to `channel` with these params.
    ///
    /// Books on the same symbol are told apart by precision; the server
    /// reports `P0` when none was requested.
    pub fn is_acknowledged_by(&self, channel: &str, ack: &SubscribedEvent) -> bool {
        if ack.channel != channel || ack.subscription_key() != Some(self.subscription_key()) {
            return false;
        }
        match (self.prec.as_deref(), ack.prec.as_deref()) {
            (Some(wanted), Some(got)) => wanted == got,
            (None, Some(got)) => got == "P0",
            _ => true,
        }
    }
}

#[derive(Serialize)]
pub(crate) struct SubscribeRequest<'a> {
    event: &'static str,
    channel: &'a str,
    #[serde(flatten)]
    params: &'a SubscribeParams,
}

impl<'a> SubscribeRequest<'a> {
    pub(crate) fn new(channel: &'a str, params: &'a SubscribeParams) -> Self {
        Self {
            event: "subscribe",
            channel,
            params,
        }
    }
}

/// Caller side of a new order; unset fields fall back to [`OrderDefaults`]
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    /// Positive buys, negative sells
    pub amount: Decimal,
    pub price: Option<Decimal>,
    pub order_type: Option<String>,
    pub hidden: Option<bool>,
    pub group_id: Option<u64>,
    pub post_only: Option<bool>,
    pub price_trailing: Option<Decimal>,
    pub price_aux_limit: Option<Decimal>,
}

impl OrderRequest {
    pub fn new(symbol: impl Into<String>, amount: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            amount,
            price: None,
            order_type: None,
            hidden: None,
            group_id: None,
            post_only: None,
            price_trailing: None,
            price_aux_limit: None,
        }
    }

    /// Limit order using the default order type
    pub fn limit(symbol: impl Into<String>, amount: Decimal, price: Decimal) -> Self {
        Self {
            price: Some(price),
            ..Self::new(symbol, amount)
        }
    }

    pub fn market(symbol: impl Into<String>, amount: Decimal) -> Self {
        Self::new(symbol, amount).with_type("EXCHANGE MARKET")
    }

    pub fn with_type(mut self, order_type: impl Into<String>) -> Self {
        self.order_type = Some(order_type.into());
        self
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = Some(hidden);
        self
    }

    pub fn with_group(mut self, group_id: u64) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_post_only(mut self, post_only: bool) -> Self {
        self.post_only = Some(post_only);
        self
    }
}

/// Values applied to order fields the caller leaves unset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderDefaults {
    pub order_type: String,
    pub hidden: bool,
}

impl Default for OrderDefaults {
    fn default() -> Self {
        Self {
            order_type: "EXCHANGE LIMIT".to_string(),
            hidden: false,
        }
    }
}

/// Wire form of a new order (`on` payload)
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u64>,
    pub cid: u64,
    #[serde(rename = "type")]
    pub order_type: String,
    pub symbol: String,
    pub amount: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_trailing: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_aux_limit: Option<Decimal>,
    pub hidden: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postonly: Option<u8>,
}

impl OrderPayload {
    /// Merge caller fields over `defaults`, field by field.
    pub fn merge(request: &OrderRequest, defaults: &OrderDefaults, cid: u64) -> Self {
        Self {
            gid: request.group_id,
            cid,
            order_type: request
                .order_type
                .clone()
                .unwrap_or_else(|| defaults.order_type.clone()),
            symbol: request.symbol.clone(),
            amount: request.amount,
            price: request.price,
            price_trailing: request.price_trailing,
            price_aux_limit: request.price_aux_limit,
            hidden: u8::from(request.hidden.unwrap_or(defaults.hidden)),
            postonly: request.post_only.map(u8::from),
        }
    }
}

/// Acknowledgements collected for one order batch
///
/// Responses are stored by submission index. The completer is consumed when
/// the last slot fills, so the batch settles exactly once.
#[derive(Debug)]
pub struct PendingOrderCorrelation {
    pub correlation_id: u64,
    pub order_count: usize,
    collected: Vec<Option<NotificationBody>>,
    completer: Option<Completer<Vec<NotificationBody>>>,
}

impl PendingOrderCorrelation {
    pub fn new(correlation_id: u64, order_count: usize, completer: Completer<Vec<NotificationBody>>) -> Self {
        Self {
            correlation_id,
            order_count,
            collected: vec![None; order_count],
            completer: Some(completer),
        }
    }

    /// Store the acknowledgement for order `index`; settles the batch when
    /// it was the last one outstanding.
    pub fn record(&mut self, index: usize, body: NotificationBody) {
        let Some(slot) = self.collected.get_mut(index) else {
            return;
        };
        if slot.is_some() || self.completer.is_none() {
            return;
        }
        *slot = Some(body);

        if self.collected.iter().any(Option::is_none) {
            return;
        }
        let Some(completer) = self.completer.take() else {
            return;
        };
        let responses: Vec<NotificationBody> = self.collected.iter().flatten().cloned().collect();
        if responses.iter().all(NotificationBody::is_success) {
            completer.resolve(responses);
        } else {
            completer.reject(ExchangeError::BatchRejected(responses));
        }
    }

    pub fn received(&self) -> usize {
        self.collected.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_resolved(&self) -> bool {
        self.completer.is_none()
    }
}
