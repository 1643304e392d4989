//! Loopback session fixture and server frame builders

use bfxlink_exchanges::prelude::*;
use rust_decimal::Decimal;
use serde_json::{json, Value};

/// A session wired to a loopback connector that plays the server
pub struct SessionHarness {
    pub session: BitfinexSession,
    pub server: LoopbackConnector,
}

impl SessionHarness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let server = LoopbackConnector::new();
        let session = BitfinexSession::new(config, server.clone()).expect("valid session config");
        Self { session, server }
    }

    /// Connected, version checked and active
    pub fn connected() -> Self {
        let harness = Self::new();
        harness.session.connect().expect("loopback connect");
        harness.server.accept();
        harness.deliver(info_frame(2));
        harness
    }

    /// Connected and authenticated; the auth frame is drained from the log
    pub fn authenticated() -> Self {
        let harness = Self::connected();
        let outcome = harness.session.authenticate("key", "secret").expect("signable credentials");
        harness.deliver(auth_ok(1));
        outcome
            .try_take()
            .expect("auth settled")
            .expect("auth accepted");
        harness.server.take_sent();
        harness
    }

    /// Open a new connection after a drop and complete its handshake
    pub fn reconnect(&self) {
        self.session.connect().expect("loopback reconnect");
        self.server.accept();
        self.deliver(info_frame(2));
    }

    pub fn deliver(&self, frame: Value) {
        self.server.deliver_json(&frame);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.server.sent_json()
    }

    pub fn take_sent(&self) -> Vec<Value> {
        self.server
            .take_sent()
            .iter()
            .map(|text| serde_json::from_str(text).unwrap_or(Value::Null))
            .collect()
    }

    /// Client order ids of every order frame written so far, in send order
    pub fn sent_order_cids(&self) -> Vec<u64> {
        self.sent().iter().flat_map(order_cids).collect()
    }
}

impl Default for SessionHarness {
    fn default() -> Self {
        Self::new()
    }
}

pub fn info_frame(version: u32) -> Value {
    json!({"event": "info", "version": version, "serverId": "loopback", "platform": {"status": 1}})
}

pub fn info_code(code: u32) -> Value {
    json!({"event": "info", "code": code, "msg": "maintenance"})
}

pub fn auth_ok(user_id: u64) -> Value {
    json!({"event": "auth", "status": "OK", "chanId": 0, "userId": user_id, "caps": {}})
}

pub fn subscribed(channel: &str, chan_id: u64, symbol: &str) -> Value {
    json!({"event": "subscribed", "channel": channel, "chanId": chan_id, "symbol": symbol})
}

/// Order notification on channel 0 echoing `cid`
pub fn order_notification(cid: u64, status: &str) -> Value {
    json!([
        0,
        "n",
        [
            1_700_000_000_000u64,
            "on-req",
            null,
            null,
            [cid * 10, null, cid, "tBTCUSD", 1_700_000_000_000u64, 1_700_000_000_000u64, 1.0, 1.0, "EXCHANGE LIMIT"],
            null,
            status,
            format!("order {cid}: {status}")
        ]
    ])
}

pub fn limit_order(amount: i64, price: i64) -> OrderRequest {
    OrderRequest::limit("tBTCUSD", Decimal::new(amount, 0), Decimal::new(price, 0))
}

/// `cid`s carried by an `on` or `ox_multi` frame
pub fn order_cids(frame: &Value) -> Vec<u64> {
    match frame[1].as_str() {
        Some("on") => frame[3]["cid"].as_u64().into_iter().collect(),
        Some("ox_multi") => frame[3]
            .as_array()
            .map(|ops| ops.iter().filter_map(|op| op[1]["cid"].as_u64()).collect())
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

/// Route tracing output through the test harness' captured writer.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("debug"))
        .try_init();
}
