mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use serde_json::json;
use tokio::time::{sleep, Instant};

use common::*;
use venue_sync::domain::{ApiMethod, Balance, Bbo, Position};
use venue_sync::envelope::ConnectionRole;
use venue_sync::ws::ConnectionState;
use venue_sync::EngineConfig;

fn market_config() -> EngineConfig {
    EngineConfig {
        subscribe_bbo: true,
        subscribe_trade: true,
        ..quiet_config()
    }
}

fn gaps(times: &[Instant]) -> Vec<Duration> {
    times.windows(2).map(|w| w[1] - w[0]).collect()
}

fn close_to(actual: Duration, expected: Duration) -> bool {
    let tolerance = Duration::from_millis(100);
    actual + tolerance >= expected && actual <= expected + tolerance
}

#[tokio::test(start_paused = true)]
async fn silent_connection_is_closed_and_reopened() {
    let h = harness(market_config());
    h.engine.start().await.unwrap();
    let mut first = h.ws.wait_socket(MARKET_URL).await;
    first.next_request().await;

    // no frames at all from the venue
    sleep(Duration::from_secs(25)).await;

    assert!(first.saw_close());
    let times = h.ws.connect_times(MARKET_URL);
    assert!(times.len() >= 2, "reconnected: {times:?}");
    let gap = times[1] - times[0];
    assert!(
        gap >= Duration::from_secs(20) && gap <= Duration::from_secs(23),
        "reconnect gap {gap:?}"
    );
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn refused_connects_back_off_exponentially() {
    let h = harness(market_config());
    h.ws.fail_always.store(true, Ordering::SeqCst);
    h.engine.start().await.unwrap();

    sleep(Duration::from_secs(16)).await;

    let observed = gaps(&h.ws.connect_times(MARKET_URL));
    let expected = [1, 2, 4, 8].map(Duration::from_secs);
    assert!(observed.len() >= expected.len(), "gaps {observed:?}");
    for (got, want) in observed.iter().zip(expected) {
        assert!(close_to(*got, want), "gap {got:?}, wanted {want:?}");
    }
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_is_forgotten_after_a_stable_connection() {
    let cfg = EngineConfig {
        websocket_application_heartbeat_timeout: None,
        ..market_config()
    };
    let h = harness(cfg);
    h.ws.fail_first.store(2, Ordering::SeqCst);
    h.engine.start().await.unwrap();

    let mut socket = h.ws.wait_socket(MARKET_URL).await;
    socket.ack_next().await;
    sleep(Duration::from_secs(70)).await;

    let dropped_at = Instant::now();
    drop(socket);
    let _next = h.ws.wait_socket(MARKET_URL).await;

    let times = h.ws.connect_times(MARKET_URL);
    assert_eq!(times.len(), 4);
    assert!(close_to(times[3] - dropped_at, Duration::from_secs(1)));
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn backoff_is_forgotten_when_the_venue_needs_no_login() {
    let cfg = EngineConfig {
        trade_api_method_preference: ApiMethod::Websocket,
        websocket_application_heartbeat_timeout: None,
        ..quiet_config()
    };
    let venue = TestVenue {
        no_login: true,
        ..Default::default()
    };
    let h = harness_with(cfg, Arc::new(venue));
    h.ws.fail_first.store(2, Ordering::SeqCst);
    h.engine.start().await.unwrap();

    let socket = h.ws.wait_socket(TRADE_URL).await;
    settle().await;
    assert_eq!(h.engine.connection_state(ConnectionRole::Trade), ConnectionState::LoggedIn);
    sleep(Duration::from_secs(70)).await;

    let dropped_at = Instant::now();
    drop(socket);
    let _next = h.ws.wait_socket(TRADE_URL).await;

    let times = h.ws.connect_times(TRADE_URL);
    assert_eq!(times.len(), 4);
    assert!(close_to(times[3] - dropped_at, Duration::from_secs(1)));
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn early_disconnect_keeps_growing_the_backoff() {
    let cfg = EngineConfig {
        websocket_application_heartbeat_timeout: None,
        ..market_config()
    };
    let h = harness(cfg);
    h.ws.fail_first.store(2, Ordering::SeqCst);
    h.engine.start().await.unwrap();

    let mut socket = h.ws.wait_socket(MARKET_URL).await;
    socket.ack_next().await;
    sleep(Duration::from_secs(10)).await;

    let dropped_at = Instant::now();
    drop(socket);
    let _next = h.ws.wait_socket(MARKET_URL).await;

    let times = h.ws.connect_times(MARKET_URL);
    assert_eq!(times.len(), 4);
    assert!(close_to(times[3] - dropped_at, Duration::from_secs(4)));
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn subscriptions_are_chunked_by_symbol_limit() {
    let cfg = EngineConfig {
        symbols: ["A", "B", "C", "D", "E"].map(String::from).to_vec(),
        websocket_market_data_channel_symbols_limit: 2,
        ..market_config()
    };
    let h = harness(cfg);
    h.engine.start().await.unwrap();
    let mut socket = h.ws.wait_socket(MARKET_URL).await;

    let mut chunks = Vec::new();
    for _ in 0..3 {
        let request = socket.ack_next().await;
        assert_eq!(request["op"], "subscribe");
        chunks.push(request["symbols"].clone());
    }
    assert_eq!(chunks, vec![json!(["A", "B"]), json!(["C", "D"]), json!(["E"])]);
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn market_data_pushes_land_in_the_store() {
    let h = harness(market_config());
    h.engine.start().await.unwrap();
    let mut socket = h.ws.wait_socket(MARKET_URL).await;
    socket.ack_next().await;

    let bbo = Bbo {
        symbol: "BTC".into(),
        exchange_update_time_point: Some(t(5)),
        best_bid_price: Some(dec!(99)),
        best_bid_size: Some(dec!(1)),
        best_ask_price: Some(dec!(101)),
        best_ask_size: Some(dec!(2)),
    };
    let stale = Bbo {
        exchange_update_time_point: Some(t(4)),
        best_bid_price: Some(dec!(50)),
        ..bbo.clone()
    };
    socket.push(json!({ "channel": "bbo", "data": [bbo] })).await;
    socket.push(json!({ "channel": "bbo", "data": [stale] })).await;
    socket
        .push(json!({ "channel": "trade", "data": [trade("BTC", 1), trade("BTC", 2)] }))
        .await;
    socket.push(json!({ "channel": "trade", "data": [trade("BTC", 2)] })).await;
    socket.push(json!({ "channel": "trade", "data": [trade("BTC", 3)] })).await;
    settle().await;

    h.engine.with_store(|s| {
        assert_eq!(s.bbo("BTC").and_then(|b| b.best_bid_price), Some(dec!(99)));
        assert_eq!(ids(s.trades("BTC")), vec![1, 2, 3]);
    });
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn account_logs_in_then_subscribes_and_applies_pushes() {
    let cfg = EngineConfig {
        subscribe_balance: true,
        subscribe_position: true,
        ..quiet_config()
    };
    let h = harness(cfg);
    h.engine.start().await.unwrap();
    let mut socket = h.ws.wait_socket(ACCOUNT_URL).await;

    assert_eq!(socket.ack_next().await["op"], "login");
    assert_eq!(socket.ack_next().await["op"], "subscribe-account");
    settle().await;
    assert_eq!(
        h.engine.connection_state(ConnectionRole::Account),
        ConnectionState::LoggedIn
    );

    let usdt = Balance {
        asset: "USDT".into(),
        exchange_update_time_point: Some(t(1)),
        quantity: dec!(100),
    };
    let btc = Balance {
        asset: "BTC".into(),
        exchange_update_time_point: Some(t(1)),
        quantity: dec!(1),
    };
    let btc_gone = Balance {
        exchange_update_time_point: Some(t(2)),
        quantity: dec!(0),
        ..btc.clone()
    };
    let short = Position {
        symbol: "BTC".into(),
        exchange_update_time_point: Some(t(1)),
        quantity: dec!(-2),
        entry_price: Some(dec!(100)),
    };
    socket.push(json!({ "channel": "balance", "data": [usdt, btc] })).await;
    socket.push(json!({ "channel": "balance", "data": [btc_gone] })).await;
    socket.push(json!({ "channel": "position", "data": [short] })).await;
    settle().await;

    h.engine.with_store(|s| {
        assert!(s.balance("BTC").is_none());
        assert_eq!(s.balance("USDT").map(|b| b.quantity), Some(dec!(100)));
        assert_eq!(s.position("BTC").map(|p| p.quantity), Some(dec!(-2)));
    });
    h.engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_closes_sockets_and_never_reconnects() {
    let h = harness(market_config());
    h.engine.start().await.unwrap();
    let mut socket = h.ws.wait_socket(MARKET_URL).await;
    socket.ack_next().await;

    h.engine.stop().await;
    assert!(socket.saw_close());
    assert_eq!(
        h.engine.connection_state(ConnectionRole::MarketData),
        ConnectionState::Disconnected
    );

    sleep(Duration::from_secs(120)).await;
    assert_eq!(h.ws.connect_times(MARKET_URL).len(), 1);
    assert!(h.engine.running_tasks().is_empty());
}
