//! Session flows against a scripted server
//!
//! Most suites drive [`SessionHarness`]; the mock suite swaps in a mockall
//! transport to pin down exactly what the controller writes and closes.

use crate::harness::*;
use bfxlink_exchanges::prelude::*;
use mockall::{mock, Sequence};
use proptest::prelude::*;
use rstest::*;
use serde_json::{json, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use url::Url;

// ============================================================================
// PARAMETERIZED TESTS
// ============================================================================

#[cfg(test)]
mod subscribe_helpers {
    use super::*;

    type Helper = fn(&BitfinexSession) -> Outcome<SubscribedEvent>;

    #[rstest]
    #[case::ticker(|s: &BitfinexSession| s.subscribe_ticker("BTCUSD", |_| {}),
        json!({"event": "subscribe", "channel": "ticker", "symbol": "tBTCUSD"}))]
    #[case::fticker(|s: &BitfinexSession| s.subscribe_fticker("USD", |_| {}),
        json!({"event": "subscribe", "channel": "ticker", "symbol": "fUSD"}))]
    #[case::trades(|s: &BitfinexSession| s.subscribe_trades("ETHUSD", |_| {}),
        json!({"event": "subscribe", "channel": "trades", "symbol": "tETHUSD"}))]
    #[case::ftrades(|s: &BitfinexSession| s.subscribe_ftrades("BTC", |_| {}),
        json!({"event": "subscribe", "channel": "trades", "symbol": "fBTC"}))]
    #[case::books(|s: &BitfinexSession| s.subscribe_books("BTCUSD", |_| {}),
        json!({"event": "subscribe", "channel": "book", "symbol": "tBTCUSD"}))]
    #[case::raw_books(|s: &BitfinexSession| s.subscribe_raw_books("BTCUSD", |_| {}),
        json!({"event": "subscribe", "channel": "book", "symbol": "tBTCUSD", "prec": "R0"}))]
    #[case::candles(|s: &BitfinexSession| s.subscribe_candles("BTCUSD", None, |_| {}),
        json!({"event": "subscribe", "channel": "candles", "key": "trade:1m:tBTCUSD"}))]
    #[case::candles_5m(|s: &BitfinexSession| s.subscribe_candles("BTCUSD", Some("5m"), |_| {}),
        json!({"event": "subscribe", "channel": "candles", "key": "trade:5m:tBTCUSD"}))]
    fn test_helper_request_frames(#[case] helper: Helper, #[case] expected: Value) {
        let harness = SessionHarness::connected();
        let _outcome = helper(&harness.session);
        assert_eq!(harness.sent(), vec![expected]);
    }

    #[test]
    fn test_raw_and_aggregated_books_told_apart() {
        let harness = SessionHarness::connected();
        let aggregated = harness.session.subscribe_books("BTCUSD", |_| {});
        let raw = harness.session.subscribe_raw_books("BTCUSD", |_| {});

        harness.deliver(json!({"event": "subscribed", "channel": "book", "chanId": 21, "symbol": "tBTCUSD", "prec": "R0"}));
        assert!(!aggregated.is_settled());
        assert_eq!(raw.try_take().unwrap().unwrap().chan_id, 21);

        harness.deliver(json!({"event": "subscribed", "channel": "book", "chanId": 20, "symbol": "tBTCUSD", "prec": "P0"}));
        assert_eq!(aggregated.try_take().unwrap().unwrap().chan_id, 20);
    }

    #[test]
    fn test_candles_matched_by_key() {
        let harness = SessionHarness::connected();
        let outcome = harness.session.subscribe_candles("BTCUSD", Some("1h"), |_| {});
        harness.deliver(json!({"event": "subscribed", "channel": "candles", "chanId": 77, "key": "trade:1h:tBTCUSD"}));

        assert_eq!(outcome.try_take().unwrap().unwrap().chan_id, 77);
        assert_eq!(harness.session.subscriptions()[&77].key, "trade:1h:tBTCUSD");
    }
}

#[cfg(test)]
mod info_codes {
    use super::*;

    #[rstest]
    #[case::pause(20060, ConnectionState::Paused)]
    #[case::unknown(20000, ConnectionState::Active)]
    fn test_info_code_state(#[case] code: u32, #[case] expected: ConnectionState) {
        let harness = SessionHarness::connected();
        harness.deliver(info_code(code));
        assert_eq!(harness.session.state(), expected);
    }

    #[test]
    fn test_pause_queues_and_resume_replays() {
        let harness = SessionHarness::connected();
        harness.deliver(info_code(20060));

        let first = harness.session.ping();
        let second = harness.session.ping();
        assert!(harness.sent().is_empty());
        assert_eq!(harness.session.pending_actions(), 2);

        harness.deliver(info_code(20061));
        assert_eq!(
            harness.sent(),
            vec![json!({"event": "ping", "cid": 1}), json!({"event": "ping", "cid": 2})]
        );
        assert_eq!(harness.session.pending_actions(), 0);

        harness.deliver(json!({"event": "pong", "cid": 1}));
        harness.deliver(json!({"event": "pong", "cid": 2}));
        assert!(first.try_take().unwrap().is_ok());
        assert!(second.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_restart_reconnects_and_replays_queue() {
        let harness = SessionHarness::authenticated();
        let _sub = harness.session.subscribe_ticker("BTCUSD", |_| {});
        harness.deliver(subscribed("ticker", 5, "tBTCUSD"));
        harness.take_sent();

        harness.deliver(info_code(20051));
        assert_eq!(harness.server.open_count(), 2);
        assert_eq!(harness.session.state(), ConnectionState::Connecting);
        assert!(!harness.session.is_authorized());
        assert!(harness.session.subscriptions().is_empty());

        let pong = harness.session.ping();
        assert!(harness.sent().is_empty());

        harness.server.accept();
        harness.deliver(info_frame(2));
        assert_eq!(harness.sent(), vec![json!({"event": "ping", "cid": 1})]);
        harness.deliver(json!({"event": "pong", "cid": 1}));
        assert!(pong.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_version_mismatch_closes_connection() {
        let harness = SessionHarness::new();
        harness.session.connect().unwrap();
        harness.server.accept();
        harness.deliver(info_frame(3));

        assert_eq!(harness.server.close_count(), 1);
        assert_eq!(harness.session.state(), ConnectionState::Disconnected);
        assert!(matches!(
            harness.session.controller().last_error(),
            Some(ExchangeError::ProtocolVersion { version: Some(3), .. })
        ));
    }
}

#[cfg(test)]
mod reconnect_flows {
    use super::*;

    fn assert_abandoned<T>(outcome: &Outcome<T>) {
        assert!(matches!(outcome.try_take(), Some(Err(ExchangeError::ConnectionClosed(_)))));
    }

    #[test]
    fn test_reauthenticate_after_transport_drop() {
        let harness = SessionHarness::connected();
        let stale = harness.session.authenticate("key", "secret").unwrap();
        harness.server.drop_connection();
        assert_abandoned(&stale);

        harness.reconnect();
        let fresh = harness.session.authenticate("key", "secret").unwrap();
        harness.deliver(auth_ok(42));

        assert_eq!(fresh.try_take().unwrap().unwrap().user_id, Some(42));
        assert!(harness.session.is_authorized());
    }

    #[test]
    fn test_resubscribe_after_transport_drop_feeds_new_handler() {
        let harness = SessionHarness::connected();
        let stale_hits = Rc::new(Cell::new(0));
        let fresh_hits = Rc::new(Cell::new(0));

        let counter = stale_hits.clone();
        let stale = harness.session.subscribe_ticker("BTCUSD", move |_| counter.set(counter.get() + 1));
        harness.server.drop_connection();
        assert_abandoned(&stale);

        harness.reconnect();
        let counter = fresh_hits.clone();
        let fresh = harness.session.subscribe_ticker("BTCUSD", move |_| counter.set(counter.get() + 1));
        harness.deliver(subscribed("ticker", 9, "tBTCUSD"));
        assert_eq!(fresh.try_take().unwrap().unwrap().chan_id, 9);

        harness.deliver(json!([9, [1.0]]));
        assert_eq!((stale_hits.get(), fresh_hits.get()), (0, 1));
        assert_eq!(harness.session.subscriptions().len(), 1);
    }

    #[test]
    fn test_orders_in_flight_fail_on_drop() {
        let harness = SessionHarness::authenticated();
        let single = harness.session.place_order(limit_order(1, 30_000)).unwrap();
        let batch = harness
            .session
            .place_orders(vec![limit_order(1, 30_000), limit_order(2, 30_000)])
            .unwrap();

        harness.server.drop_connection();
        assert_abandoned(&single);
        assert_abandoned(&batch);

        harness.reconnect();
        let reauth = harness.session.authenticate("key", "secret").unwrap();
        harness.deliver(auth_ok(1));
        assert!(reauth.try_take().unwrap().is_ok());

        harness.take_sent();
        let retry = harness.session.place_order(limit_order(1, 30_000)).unwrap();
        let cid = harness.sent_order_cids()[0];
        harness.deliver(order_notification(cid, "SUCCESS"));
        assert!(retry.try_take().unwrap().is_ok());
    }

    #[test]
    fn test_request_queued_during_outage_is_answered_after_reconnect() {
        let harness = SessionHarness::connected();
        harness.server.drop_connection();

        let pong = harness.session.ping();
        assert_eq!(harness.session.pending_actions(), 1);
        assert!(!pong.is_settled());

        harness.reconnect();
        assert_eq!(harness.sent(), vec![json!({"event": "ping", "cid": 1})]);
        harness.deliver(json!({"event": "pong", "cid": 1}));
        assert_eq!(pong.try_take().unwrap().unwrap().cid, 1);
    }
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

#[derive(Debug, Clone)]
enum Step {
    Send,
    Pause,
    Resume,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => Just(Step::Send),
        1 => Just(Step::Pause),
        1 => Just(Step::Resume),
    ]
}

#[cfg(test)]
mod property_tests {
    use super::*;

    proptest! {
        #[test]
        fn test_outbound_order_survives_pause_cycles(steps in proptest::collection::vec(step(), 1..60)) {
            let harness = SessionHarness::connected();
            let mut issued = 0u64;
            for step in &steps {
                match step {
                    Step::Send => {
                        issued += 1;
                        harness.session.ping();
                    }
                    Step::Pause => harness.deliver(info_code(20060)),
                    Step::Resume => harness.deliver(info_code(20061)),
                }
            }
            harness.deliver(info_code(20061));

            let cids: Vec<u64> = harness.sent().iter().filter_map(|frame| frame["cid"].as_u64()).collect();
            prop_assert_eq!(cids, (1..=issued).collect::<Vec<_>>());
            prop_assert_eq!(harness.session.pending_actions(), 0);
        }

        #[test]
        fn test_batch_responses_follow_submission_order(
            arrival in (1usize..=MAX_BATCH_ORDERS)
                .prop_flat_map(|n| Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
        ) {
            let harness = SessionHarness::authenticated();
            let orders: Vec<OrderRequest> = (0..arrival.len()).map(|i| limit_order(1 + i as i64, 30_000)).collect();
            let outcome = harness.session.place_orders(orders).unwrap();
            let cids = harness.sent_order_cids();
            prop_assert_eq!(cids.len(), arrival.len());

            for (delivered, &index) in arrival.iter().enumerate() {
                prop_assert!(!outcome.is_settled(), "settled after {} of {}", delivered, arrival.len());
                harness.deliver(order_notification(cids[index], "SUCCESS"));
            }

            let responses = outcome.try_take().unwrap().unwrap();
            let echoed: Vec<Option<u64>> = responses.iter().map(NotificationBody::correlation_id).collect();
            prop_assert_eq!(echoed, cids.into_iter().map(Some).collect::<Vec<_>>());
        }
    }
}

// ============================================================================
// FIXTURE TESTS
// ============================================================================

#[cfg(test)]
mod order_flows {
    use super::*;

    #[fixture]
    fn trading() -> SessionHarness {
        SessionHarness::authenticated()
    }

    #[rstest]
    fn test_single_order_frame(trading: SessionHarness) {
        let _outcome = trading
            .session
            .place_order(limit_order(2, 30_500).with_hidden(true).with_post_only(true))
            .unwrap();

        let sent = trading.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0][0], 0);
        assert_eq!(sent[0][1], "on");
        assert_eq!(sent[0][2], Value::Null);
        let payload = &sent[0][3];
        assert_eq!(payload["type"], "EXCHANGE LIMIT");
        assert_eq!(payload["amount"], "2");
        assert_eq!(payload["price"], "30500");
        assert_eq!(payload["hidden"], 1);
        assert_eq!(payload["postonly"], 1);
    }

    #[rstest]
    fn test_batch_with_one_failure_is_rejected(trading: SessionHarness) {
        let outcome = trading.session.place_orders(vec![limit_order(1, 1), limit_order(2, 2)]).unwrap();
        let cids = trading.sent_order_cids();
        assert_eq!(cids[1], cids[0] + 1);

        trading.deliver(order_notification(cids[0], "SUCCESS"));
        trading.deliver(order_notification(cids[1], "ERROR"));

        match outcome.try_take() {
            Some(Err(ExchangeError::BatchRejected(responses))) => {
                assert_eq!(responses.len(), 2);
                assert!(responses[0].is_success());
                assert!(!responses[1].is_success());
            }
            other => panic!("expected batch rejection, got {other:?}"),
        }
    }

    #[rstest]
    fn test_notifications_for_other_cids_reach_account_handler(trading: SessionHarness) {
        let seen = Rc::new(Cell::new(0));
        let counter = seen.clone();
        trading.session.on_account_event(move |_| counter.set(counter.get() + 1));

        let outcome = trading.session.place_order(limit_order(1, 1)).unwrap();
        let cid = trading.sent_order_cids()[0];
        trading.deliver(order_notification(cid + 1000, "SUCCESS"));
        assert!(!outcome.is_settled());
        assert_eq!(seen.get(), 1);

        trading.deliver(order_notification(cid, "SUCCESS"));
        assert!(outcome.try_take().unwrap().is_ok());
        assert_eq!(seen.get(), 1);
    }

    #[rstest]
    fn test_config_batch_limit_applies(#[values(1, 5)] limit: usize) {
        let mut config = SessionConfig::default();
        config.max_batch_size = limit;
        let harness = SessionHarness::with_config(config);
        harness.session.connect().unwrap();
        harness.server.accept();
        harness.deliver(info_frame(2));
        let _auth = harness.session.authenticate("key", "secret").unwrap();
        harness.deliver(auth_ok(1));

        assert!(harness.session.place_orders(vec![limit_order(1, 1); limit]).is_ok());
        assert!(matches!(
            harness.session.place_orders(vec![limit_order(1, 1); limit + 1]),
            Err(ExchangeError::BatchSizeExceeded { .. })
        ));
    }
}

// ============================================================================
// MOCK TRANSPORT TESTS
// ============================================================================

mock! {
    pub Wire {}

    impl Transport for Wire {
        fn send(&self, text: &str) -> bfxlink_exchanges::Result<()>;
        fn close(&self);
        fn is_open(&self) -> bool;
    }
}

/// Hands out one prepared mock and keeps the event sink for the test
struct MockConnector {
    wire: RefCell<Option<MockWire>>,
    events: Rc<RefCell<Option<TransportEvents>>>,
}

impl MockConnector {
    fn new(wire: MockWire) -> (Self, Rc<RefCell<Option<TransportEvents>>>) {
        let events = Rc::new(RefCell::new(None));
        let connector = Self {
            wire: RefCell::new(Some(wire)),
            events: events.clone(),
        };
        (connector, events)
    }
}

impl Connector for MockConnector {
    fn open(&self, _url: &Url, events: TransportEvents) -> bfxlink_exchanges::Result<Box<dyn Transport>> {
        *self.events.borrow_mut() = Some(events);
        match self.wire.borrow_mut().take() {
            Some(wire) => Ok(Box::new(wire)),
            None => Err(ExchangeError::NetworkError("mock connector already used".to_string())),
        }
    }
}

#[cfg(test)]
mod mock_transport_tests {
    use super::*;

    fn is_ping(text: &str, cid: u64) -> bool {
        serde_json::from_str::<Value>(text).is_ok_and(|frame| frame == json!({"event": "ping", "cid": cid}))
    }

    fn events_of(slot: &Rc<RefCell<Option<TransportEvents>>>) -> TransportEvents {
        slot.borrow().clone().expect("connector opened")
    }

    #[test]
    fn test_version_mismatch_closes_without_writing() {
        let mut wire = MockWire::new();
        wire.expect_is_open().return_const(true);
        wire.expect_send().never();
        wire.expect_close().times(1).return_const(());

        let (connector, events) = MockConnector::new(wire);
        let session = BitfinexSession::new(SessionConfig::default(), connector).unwrap();
        session.connect().unwrap();

        let events = events_of(&events);
        events.opened();
        events.message(&info_frame(1).to_string());

        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(!session.session_state().version_validated);
    }

    #[test]
    fn test_queued_frames_written_in_call_order() {
        let mut seq = Sequence::new();
        let mut wire = MockWire::new();
        wire.expect_is_open().return_const(true);
        wire.expect_send()
            .withf(|text: &str| is_ping(text, 1))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        wire.expect_send()
            .withf(|text: &str| text.contains(r#""channel":"trades""#))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        wire.expect_send()
            .withf(|text: &str| is_ping(text, 2))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        wire.expect_close().return_const(());

        let (connector, events) = MockConnector::new(wire);
        let session = BitfinexSession::new(SessionConfig::default(), connector).unwrap();
        session.connect().unwrap();

        let _first = session.ping();
        let _trades = session.subscribe_trades("BTCUSD", |_| {});
        let _second = session.ping();
        assert_eq!(session.pending_actions(), 3);

        events_of(&events).opened();
        assert_eq!(session.pending_actions(), 0);
    }

    #[test]
    fn test_failed_write_is_not_fatal() {
        let mut wire = MockWire::new();
        wire.expect_is_open().return_const(true);
        wire.expect_send()
            .times(2)
            .returning(|_| Err(ExchangeError::NetworkError("broken pipe".to_string())));
        wire.expect_close().return_const(());

        let (connector, events) = MockConnector::new(wire);
        let session = BitfinexSession::new(SessionConfig::default(), connector).unwrap();
        session.connect().unwrap();
        events_of(&events).opened();

        let first = session.ping();
        let _second = session.ping();
        assert!(!first.is_settled());
        assert_eq!(session.state(), ConnectionState::Active);
    }
}

// ============================================================================
// ASYNC TESTS
// ============================================================================

#[cfg(test)]
mod async_tests {
    use super::*;
    use std::time::Duration;

    #[monoio::test]
    async fn test_await_subscription_and_data() {
        let harness = SessionHarness::connected();
        let prices = Rc::new(RefCell::new(Vec::new()));
        let sink = prices.clone();
        let outcome = harness.session.subscribe_ticker("BTCUSD", move |frame| {
            if let ChannelPayload::Data(value) = &frame.payload {
                sink.borrow_mut().push(value[6].as_f64());
            }
        });

        let server = harness.server.clone();
        monoio::spawn(async move {
            server.deliver_json(&subscribed("ticker", 9, "tBTCUSD"));
            server.deliver_json(&json!([9, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 30_123.5, 8.0, 9.0, 10.0]]));
        });

        let ack = outcome.wait().await.unwrap();
        assert_eq!(ack.chan_id, 9);
        assert_eq!(*prices.borrow(), vec![Some(30_123.5)]);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_unanswered_ping_times_out() {
        let harness = SessionHarness::connected();
        let pong = harness.session.ping();
        let waited = monoio::time::timeout(Duration::from_millis(20), pong.wait()).await;
        assert!(waited.is_err());
    }

    #[monoio::test]
    async fn test_close_wakes_pending_waiters() {
        let harness = SessionHarness::authenticated();
        let order = harness.session.place_order(limit_order(1, 1)).unwrap();

        let session = harness.session.clone();
        monoio::spawn(async move {
            session.close();
        });

        assert!(matches!(order.wait().await, Err(ExchangeError::ConnectionClosed(_))));
    }
}
