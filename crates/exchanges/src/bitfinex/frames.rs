//! Inbound frame decoding
//!
//! Every text message is decoded once, at the transport boundary, into a
//! [`Frame`]. Keyed control messages become [`Event`]s, positional channel
//! messages become [`ChannelFrame`]s. Anything else (unknown events, shapes
//! this client does not model) is kept as [`Frame::Raw`] so predicates can
//! still inspect it and housekeeping can log it.

use crate::errors::Result;
use bfxlink_core::Timestamp;
use serde::Deserialize;
use serde_json::Value;

/// Heartbeat tag in slot 1 of a channel frame
pub const HEARTBEAT_TAG: &str = "hb";
/// Notification tag in slot 1 of a channel-0 frame
pub const NOTIFICATION_TAG: &str = "n";

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Event),
    Channel(ChannelFrame),
    Raw(Value),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    Info(InfoEvent),
    Auth(AuthEvent),
    Subscribed(SubscribedEvent),
    Unsubscribed(UnsubscribedEvent),
    Pong(PongEvent),
    Error(ErrorEvent),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InfoEvent {
    pub version: Option<u32>,
    pub code: Option<u32>,
    pub msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AuthEvent {
    pub status: String,
    #[serde(rename = "chanId", default)]
    pub chan_id: u64,
    #[serde(rename = "userId")]
    pub user_id: Option<u64>,
    #[serde(default)]
    pub caps: Value,
    pub code: Option<i64>,
    pub msg: Option<String>,
}

impl AuthEvent {
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// Subscribe acknowledgement
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscribedEvent {
    #[serde(rename = "chanId")]
    pub chan_id: u64,
    pub channel: String,
    pub symbol: Option<String>,
    pub pair: Option<String>,
    pub currency: Option<String>,
    pub key: Option<String>,
    pub prec: Option<String>,
    pub freq: Option<String>,
    #[serde(default)]
    pub len: Value,
}

impl SubscribedEvent {
    /// The key the subscription was requested under: `key` for keyed
    /// channels (candles), otherwise the symbol.
    pub fn subscription_key(&self) -> Option<&str> {
        self.key.as_deref().or(self.symbol.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UnsubscribedEvent {
    pub status: String,
    #[serde(rename = "chanId")]
    pub chan_id: u64,
}

impl UnsubscribedEvent {
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PongEvent {
    pub cid: u64,
    pub ts: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorEvent {
    pub code: Option<i64>,
    pub msg: Option<String>,
    pub channel: Option<String>,
    pub symbol: Option<String>,
    pub pair: Option<String>,
    pub key: Option<String>,
    #[serde(rename = "chanId")]
    pub chan_id: Option<u64>,
}

impl ErrorEvent {
    pub fn message(&self) -> String {
        self.msg.clone().unwrap_or_else(|| "unspecified error".to_string())
    }

    /// Whether this error answers a subscribe request for `channel`/`key`.
    ///
    /// The error must name the subscription (symbol, key or pair) and, when
    /// it carries a channel, that channel must match too.
    pub fn answers_subscription(&self, channel: &str, key: &str) -> bool {
        if self.channel.as_deref().is_some_and(|c| c != channel) {
            return false;
        }
        let bare_pair = key.get(1..).unwrap_or_default();
        self.symbol.as_deref() == Some(key)
            || self.key.as_deref() == Some(key)
            || self.pair.as_deref().is_some_and(|p| p == key || p == bare_pair)
    }
}

/// Info codes the connection controller acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfoCode {
    /// Server asks the client to reconnect
    Restart,
    /// Maintenance started; hold outbound traffic
    Pause,
    /// Maintenance finished
    Resume,
    Other(u32),
}

impl From<u32> for InfoCode {
    fn from(code: u32) -> Self {
        match code {
            20051 => InfoCode::Restart,
            20060 => InfoCode::Pause,
            20061 => InfoCode::Resume,
            other => InfoCode::Other(other),
        }
    }
}

/// Positional message on a numbered channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFrame {
    pub chan_id: u64,
    pub payload: ChannelPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelPayload {
    Heartbeat,
    /// Snapshot or update: slot 1 is itself a sequence
    Data(Value),
    Notification(NotificationBody),
    /// Tagged message such as `te`/`tu` trades or `os`/`on`/`ws` account updates
    Message { tag: String, body: Value },
}

impl ChannelFrame {
    pub fn is_heartbeat(&self) -> bool {
        matches!(self.payload, ChannelPayload::Heartbeat)
    }
}

/// `[MTS, TYPE, MESSAGE_ID, null, NOTIFY_INFO, CODE, STATUS, TEXT]`
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationBody {
    pub mts: Option<u64>,
    pub kind: String,
    pub message_id: Option<u64>,
    pub order: Option<OrderEcho>,
    pub code: Option<i64>,
    pub status: String,
    pub text: String,
    pub raw: Value,
}

impl NotificationBody {
    pub fn from_value(value: &Value) -> Option<Self> {
        let slots = value.as_array()?;
        let slot = |i: usize| slots.get(i).unwrap_or(&Value::Null);

        Some(Self {
            mts: slot(0).as_u64(),
            kind: slot(1).as_str().unwrap_or_default().to_string(),
            message_id: slot(2).as_u64(),
            order: OrderEcho::from_value(slot(4)),
            code: slot(5).as_i64(),
            status: slot(6).as_str().unwrap_or_default().to_string(),
            text: slot(7).as_str().unwrap_or_default().to_string(),
            raw: value.clone(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == "SUCCESS"
    }

    /// Server time of the notification
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.mts.map(Timestamp::from_millis)
    }

    /// Correlation id echoed back in the order description
    pub fn correlation_id(&self) -> Option<u64> {
        self.order.as_ref().and_then(|order| order.cid)
    }
}

/// Echo of a submitted order inside a notification
#[derive(Debug, Clone, PartialEq)]
pub struct OrderEcho {
    pub id: Option<u64>,
    pub gid: Option<u64>,
    pub cid: Option<u64>,
    pub symbol: Option<String>,
    pub mts_create: Option<u64>,
    pub mts_update: Option<u64>,
    pub amount: Option<f64>,
    pub amount_orig: Option<f64>,
    pub order_type: Option<String>,
    pub price: Option<f64>,
    pub hidden: bool,
    pub raw: Value,
}

impl OrderEcho {
    pub fn from_value(value: &Value) -> Option<Self> {
        let slots = value.as_array()?;
        if slots.first().is_some_and(Value::is_array) {
            // Multi-order notifications nest one array per order.
            return None;
        }
        let slot = |i: usize| slots.get(i).unwrap_or(&Value::Null);

        Some(Self {
            id: slot(0).as_u64(),
            gid: slot(1).as_u64(),
            cid: slot(2).as_u64(),
            symbol: slot(3).as_str().map(str::to_string),
            mts_create: slot(4).as_u64(),
            mts_update: slot(5).as_u64(),
            amount: slot(6).as_f64(),
            amount_orig: slot(7).as_f64(),
            order_type: slot(8).as_str().map(str::to_string),
            price: slot(16).as_f64(),
            hidden: slot(24).as_u64() == Some(1),
            raw: value.clone(),
        })
    }
}

impl Frame {
    /// Decode one text message. Only malformed JSON is an error.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::from_value(value))
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(_) => match Event::deserialize(&value) {
                Ok(event) => Frame::Event(event),
                Err(_) => Frame::Raw(value),
            },
            Value::Array(ref slots) => match decode_channel(slots) {
                Some(frame) => Frame::Channel(frame),
                None => Frame::Raw(value),
            },
            other => Frame::Raw(other),
        }
    }

    pub fn event(&self) -> Option<&Event> {
        match self {
            Frame::Event(event) => Some(event),
            _ => None,
        }
    }

    pub fn channel(&self) -> Option<&ChannelFrame> {
        match self {
            Frame::Channel(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn chan_id(&self) -> Option<u64> {
        self.channel().map(|frame| frame.chan_id)
    }

    pub fn is_heartbeat(&self) -> bool {
        self.channel().is_some_and(ChannelFrame::is_heartbeat)
    }

    pub fn notification(&self) -> Option<&NotificationBody> {
        match self.channel().map(|frame| &frame.payload) {
            Some(ChannelPayload::Notification(body)) => Some(body),
            _ => None,
        }
    }
}

fn decode_channel(slots: &[Value]) -> Option<ChannelFrame> {
    let chan_id = slots.first()?.as_u64()?;
    let payload = match slots.get(1)? {
        Value::String(tag) if tag == HEARTBEAT_TAG => ChannelPayload::Heartbeat,
        Value::String(tag) => {
            let body = slots.get(2).cloned().unwrap_or(Value::Null);
            match NotificationBody::from_value(&body) {
                Some(notification) if tag == NOTIFICATION_TAG => ChannelPayload::Notification(notification),
                _ => ChannelPayload::Message {
                    tag: tag.clone(),
                    body,
                },
            }
        }
        data @ Value::Array(_) => ChannelPayload::Data(data.clone()),
        _ => return None,
    };
    Some(ChannelFrame { chan_id, payload })
}
