#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::Span;

use venue_sync::adapter::VenueAdapter;
use venue_sync::config::EngineConfig;
use venue_sync::domain::{
    Balance, Bbo, Fill, InstrumentInformation, Ohlcv, Order, OrderStatus, Position, TimePoint, Trade,
};
use venue_sync::envelope::{
    ConnectionRole, Method, RequestBuilder, RestRequest, RestResponse, WebsocketMessage, WebsocketRequest,
    WebsocketRequestKind,
};
use venue_sync::error::{AdapterError, TransportError};
use venue_sync::transport::{Outbound, RawRestResponse, RestTransport, WebsocketConnector, WebsocketSession};
use venue_sync::Engine;

pub const BASE_URL: &str = "https://venue.test";
pub const MARKET_URL: &str = "wss://venue.test/market";
pub const ACCOUNT_URL: &str = "wss://venue.test/account";
pub const TRADE_URL: &str = "wss://venue.test/trade";

pub fn t(secs: i64) -> TimePoint {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

pub fn trade(symbol: &str, id: u64) -> Trade {
    Trade {
        symbol: symbol.into(),
        exchange_update_time_point: t(id as i64),
        trade_id: id,
        price: 100.into(),
        size: 1.into(),
        side: None,
    }
}

pub fn ids(trades: &[Trade]) -> Vec<u64> {
    trades.iter().map(|t| t.trade_id).collect()
}

// ---------------------------------------------------------------
// JSON test venue: entities travel as serde JSON under "data"
// ---------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TestVenue {
    pub no_positions: bool,
    pub no_login: bool,
}

fn get(path: &'static str, symbol: Option<&str>) -> RequestBuilder {
    let symbol = symbol.map(str::to_string);
    RequestBuilder::new(move |_now| {
        let r = RestRequest::new(Method::Get, BASE_URL, path);
        match &symbol {
            Some(s) => r.query("symbol", s),
            None => r,
        }
    })
}

fn order_request(method: Method, order: &Order) -> RequestBuilder {
    let order = order.clone();
    RequestBuilder::new(move |_now| {
        let mut r = RestRequest::new(method, BASE_URL, "/order")
            .query("symbol", &order.symbol)
            .query("client_order_id", &order.client_order_id);
        if method == Method::Post {
            r.payload = serde_json::to_string(&order).ok();
        }
        r
    })
}

fn data<T: DeserializeOwned>(payload: &Value) -> Result<T, AdapterError> {
    Ok(serde_json::from_value(payload.get("data").cloned().unwrap_or(Value::Null))?)
}

fn next_page(path: &'static str, payload: &Value, request: &RestRequest) -> Option<RequestBuilder> {
    let page = payload.get("next")?.as_str()?.to_string();
    let symbol = request.query_value("symbol").map(str::to_string);
    Some(RequestBuilder::new(move |_now| {
        let mut r = RestRequest::new(Method::Get, BASE_URL, path);
        if let Some(s) = &symbol {
            r = r.query("symbol", s);
        }
        r.query("page", &page)
    }))
}

fn is(r: &RestResponse, method: Method, path: &str) -> bool {
    r.request.method == method && r.request.path == path
}

fn channel(m: &WebsocketMessage) -> Option<String> {
    m.json_payload().ok()?.get("channel")?.as_str().map(str::to_string)
}

fn ws(id: &str, kind: WebsocketRequestKind, body: Value) -> WebsocketRequest {
    let mut body = body;
    body["id"] = json!(id);
    WebsocketRequest::new(id, kind, body.to_string())
}

impl VenueAdapter for TestVenue {
    fn name(&self) -> &str {
        "test"
    }

    fn rest_fetch_instrument_information_request(&self, _: &EngineConfig) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/instruments", None))
    }
    fn rest_fetch_bbo_request(&self, _: &EngineConfig, _: &[String]) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/bbo", None))
    }
    fn rest_fetch_historical_trade_request(&self, _: &EngineConfig, s: &str) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/trades", Some(s)))
    }
    fn rest_fetch_historical_ohlcv_request(&self, _: &EngineConfig, s: &str) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/ohlcvs", Some(s)))
    }
    fn rest_create_order_request(&self, _: &EngineConfig, o: &Order) -> Result<RequestBuilder, AdapterError> {
        Ok(order_request(Method::Post, o))
    }
    fn rest_cancel_order_request(&self, _: &EngineConfig, o: &Order) -> Result<RequestBuilder, AdapterError> {
        Ok(order_request(Method::Delete, o))
    }
    fn rest_fetch_order_request(&self, _: &EngineConfig, o: &Order) -> Result<RequestBuilder, AdapterError> {
        Ok(order_request(Method::Get, o))
    }
    fn rest_fetch_open_orders_request(&self, _: &EngineConfig, s: Option<&str>) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/open-orders", s))
    }
    fn rest_fetch_position_request(&self, _: &EngineConfig) -> Result<RequestBuilder, AdapterError> {
        if self.no_positions {
            return Err(AdapterError::Unsupported("positions"));
        }
        Ok(get("/positions", None))
    }
    fn rest_fetch_balance_request(&self, _: &EngineConfig) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/balances", None))
    }
    fn rest_fetch_historical_order_request(&self, _: &EngineConfig, s: &str) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/orders", Some(s)))
    }
    fn rest_fetch_historical_fill_request(&self, _: &EngineConfig, s: &str) -> Result<RequestBuilder, AdapterError> {
        Ok(get("/fills", Some(s)))
    }

    fn is_rest_response_for_instrument_information(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/instruments")
    }
    fn is_rest_response_for_bbo(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/bbo")
    }
    fn is_rest_response_for_historical_trade(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/trades")
    }
    fn is_rest_response_for_historical_ohlcv(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/ohlcvs")
    }
    fn is_rest_response_for_create_order(&self, r: &RestResponse) -> bool {
        is(r, Method::Post, "/order")
    }
    fn is_rest_response_for_cancel_order(&self, r: &RestResponse) -> bool {
        is(r, Method::Delete, "/order")
    }
    fn is_rest_response_for_fetch_order(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/order")
    }
    fn is_rest_response_for_fetch_open_orders(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/open-orders")
    }
    fn is_rest_response_for_position(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/positions")
    }
    fn is_rest_response_for_balance(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/balances")
    }
    fn is_rest_response_for_historical_order(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/orders")
    }
    fn is_rest_response_for_historical_fill(&self, r: &RestResponse) -> bool {
        is(r, Method::Get, "/fills")
    }

    fn convert_rest_response_for_instrument_information(
        &self,
        p: &Value,
        _: &RestRequest,
    ) -> Result<Vec<InstrumentInformation>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_bbo(&self, p: &Value, _: &RestRequest) -> Result<Vec<Bbo>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_historical_trade(&self, p: &Value, _: &RestRequest) -> Result<Vec<Trade>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_historical_ohlcv(&self, p: &Value, _: &RestRequest) -> Result<Vec<Ohlcv>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_create_order(&self, p: &Value, _: &RestRequest) -> Result<Order, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_cancel_order(&self, p: &Value, _: &RestRequest) -> Result<Order, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_fetch_order(&self, p: &Value, _: &RestRequest) -> Result<Order, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_fetch_open_orders(&self, p: &Value, _: &RestRequest) -> Result<Vec<Order>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_position(&self, p: &Value, _: &RestRequest) -> Result<Vec<Position>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_balance(&self, p: &Value, _: &RestRequest) -> Result<Vec<Balance>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_historical_order(&self, p: &Value, _: &RestRequest) -> Result<Vec<Order>, AdapterError> {
        data(p)
    }
    fn convert_rest_response_for_historical_fill(&self, p: &Value, _: &RestRequest) -> Result<Vec<Fill>, AdapterError> {
        data(p)
    }

    fn next_rest_request_for_historical_trade(
        &self,
        _: &EngineConfig,
        p: &Value,
        r: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        Ok(next_page("/trades", p, r))
    }
    fn next_rest_request_for_historical_ohlcv(
        &self,
        _: &EngineConfig,
        p: &Value,
        r: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        Ok(next_page("/ohlcvs", p, r))
    }
    fn next_rest_request_for_fetch_open_orders(
        &self,
        _: &EngineConfig,
        p: &Value,
        r: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        Ok(next_page("/open-orders", p, r))
    }
    fn next_rest_request_for_historical_order(
        &self,
        _: &EngineConfig,
        p: &Value,
        r: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        Ok(next_page("/orders", p, r))
    }
    fn next_rest_request_for_historical_fill(
        &self,
        _: &EngineConfig,
        p: &Value,
        r: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        Ok(next_page("/fills", p, r))
    }

    fn handle_rest_response_error(&self, r: &RestResponse) -> Vec<Order> {
        if !is(r, Method::Post, "/order") || !(400..500).contains(&r.status) {
            return Vec::new();
        }
        r.request
            .payload
            .as_deref()
            .and_then(|p| serde_json::from_str::<Order>(p).ok())
            .map(|o| vec![o.with_status(OrderStatus::Rejected)])
            .unwrap_or_default()
    }

    fn websocket_url(&self, _: &EngineConfig, role: ConnectionRole) -> Option<String> {
        Some(
            match role {
                ConnectionRole::MarketData => MARKET_URL,
                ConnectionRole::Account => ACCOUNT_URL,
                ConnectionRole::Trade => TRADE_URL,
            }
            .to_string(),
        )
    }

    fn websocket_market_data_subscribe_request(
        &self,
        _: &EngineConfig,
        symbols: &[String],
        id: String,
    ) -> Result<WebsocketRequest, AdapterError> {
        Ok(ws(&id, WebsocketRequestKind::Subscribe, json!({ "op": "subscribe", "symbols": symbols })))
    }

    fn websocket_login_request(
        &self,
        _: &EngineConfig,
        _: ConnectionRole,
        id: String,
        _: TimePoint,
    ) -> Result<Option<WebsocketRequest>, AdapterError> {
        if self.no_login {
            return Ok(None);
        }
        Ok(Some(ws(&id, WebsocketRequestKind::Login, json!({ "op": "login" }))))
    }

    fn websocket_account_subscribe_request(
        &self,
        _: &EngineConfig,
        id: String,
        _: TimePoint,
    ) -> Result<Option<WebsocketRequest>, AdapterError> {
        Ok(Some(ws(&id, WebsocketRequestKind::Subscribe, json!({ "op": "subscribe-account" }))))
    }

    fn websocket_create_order_request(
        &self,
        _: &EngineConfig,
        order: &Order,
        id: String,
        _: TimePoint,
    ) -> Result<WebsocketRequest, AdapterError> {
        Ok(ws(&id, WebsocketRequestKind::CreateOrder, json!({ "op": "create", "order": order })))
    }

    fn websocket_cancel_order_request(
        &self,
        _: &EngineConfig,
        order: &Order,
        id: String,
        _: TimePoint,
    ) -> Result<WebsocketRequest, AdapterError> {
        Ok(ws(&id, WebsocketRequestKind::CancelOrder, json!({ "op": "cancel", "order": order })))
    }

    fn extract_websocket_request_id(&self, m: &WebsocketMessage) -> Option<String> {
        m.json_payload().ok()?.get("id")?.as_str().map(str::to_string)
    }

    fn is_websocket_response_success(&self, m: &WebsocketMessage) -> bool {
        m.json_payload()
            .map(|v| v.get("ok").and_then(Value::as_bool).unwrap_or(true))
            .unwrap_or(false)
    }

    fn is_websocket_push_for_bbo(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("bbo")
    }
    fn is_websocket_push_for_trade(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("trade")
    }
    fn is_websocket_push_for_ohlcv(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("ohlcv")
    }
    fn is_websocket_push_for_order(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("order")
    }
    fn is_websocket_push_for_fill(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("fill")
    }
    fn is_websocket_push_for_position(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("position")
    }
    fn is_websocket_push_for_balance(&self, m: &WebsocketMessage) -> bool {
        channel(m).as_deref() == Some("balance")
    }

    fn convert_websocket_push_for_bbo(&self, p: &Value) -> Result<Vec<Bbo>, AdapterError> {
        data(p)
    }
    fn convert_websocket_push_for_trade(&self, p: &Value) -> Result<Vec<Trade>, AdapterError> {
        data(p)
    }
    fn convert_websocket_push_for_ohlcv(&self, p: &Value) -> Result<Vec<Ohlcv>, AdapterError> {
        data(p)
    }
    fn convert_websocket_push_for_order(&self, p: &Value) -> Result<Vec<Order>, AdapterError> {
        data(p)
    }
    fn convert_websocket_push_for_fill(&self, p: &Value) -> Result<Vec<Fill>, AdapterError> {
        data(p)
    }
    fn convert_websocket_push_for_position(&self, p: &Value) -> Result<Vec<Position>, AdapterError> {
        data(p)
    }
    fn convert_websocket_push_for_balance(&self, p: &Value) -> Result<Vec<Balance>, AdapterError> {
        data(p)
    }

    fn convert_websocket_response_for_create_order(
        &self,
        p: &Value,
        _: Option<&WebsocketRequest>,
    ) -> Result<Order, AdapterError> {
        Ok(serde_json::from_value(p.get("result").cloned().unwrap_or(Value::Null))?)
    }

    fn convert_websocket_response_for_cancel_order(
        &self,
        p: &Value,
        _: Option<&WebsocketRequest>,
    ) -> Result<Order, AdapterError> {
        Ok(serde_json::from_value(p.get("result").cloned().unwrap_or(Value::Null))?)
    }

    fn handle_websocket_response_error(&self, m: &WebsocketMessage) -> Vec<Order> {
        match &m.request {
            Some(WebsocketRequest {
                kind: WebsocketRequestKind::CreateOrder,
                order: Some(order),
                ..
            }) => vec![order.clone().with_status(OrderStatus::Rejected)],
            _ => Vec::new(),
        }
    }
}

/// Only `name`: every other hook keeps its default.
pub struct BareVenue;

impl VenueAdapter for BareVenue {
    fn name(&self) -> &str {
        "bare"
    }
}

// ---------------------------------------------------------------
// scripted REST transport
// ---------------------------------------------------------------

/// Responses are queued per `METHOD path?query`; the last one of a queue is
/// sticky. Unknown routes answer 404.
#[derive(Default)]
pub struct FakeRest {
    routes: Mutex<HashMap<String, VecDeque<RawRestResponse>>>,
    log: Mutex<Vec<RestRequest>>,
}

impl FakeRest {
    fn key(method: Method, path: &str, query: &str) -> String {
        if query.is_empty() {
            format!("{} {}", method.as_str(), path)
        } else {
            format!("{} {}?{}", method.as_str(), path, query)
        }
    }

    pub fn respond(&self, method: Method, path: &str, query: &str, status: u16, body: Value) {
        self.routes
            .lock()
            .entry(Self::key(method, path, query))
            .or_default()
            .push_back(RawRestResponse {
                status,
                headers: Vec::new(),
                body: body.to_string(),
            });
    }

    pub fn requests(&self) -> Vec<RestRequest> {
        self.log.lock().clone()
    }

    pub fn requests_to(&self, method: Method, path: &str) -> Vec<RestRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method && r.path == path)
            .collect()
    }
}

#[async_trait]
impl RestTransport for FakeRest {
    async fn execute(&self, request: &RestRequest, _timeout: Duration) -> Result<RawRestResponse, TransportError> {
        self.log.lock().push(request.clone());
        let key = Self::key(request.method, &request.path, &request.query_string());
        let mut routes = self.routes.lock();
        let scripted = match routes.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(scripted.unwrap_or(RawRestResponse {
            status: 404,
            headers: Vec::new(),
            body: "{}".into(),
        }))
    }
}

// ---------------------------------------------------------------
// in-memory WebSocket connector
// ---------------------------------------------------------------

/// Server side of one fake connection. Dropping it closes the socket.
pub struct FakeSocket {
    pub url: String,
    pub inbound: mpsc::Sender<String>,
    pub outbound: mpsc::Receiver<Outbound>,
}

impl FakeSocket {
    pub async fn push(&self, message: Value) {
        self.inbound.send(message.to_string()).await.unwrap();
    }

    /// Next text frame the client wrote, as JSON.
    pub async fn next_request(&mut self) -> Value {
        loop {
            match self.outbound.recv().await {
                Some(Outbound::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(Outbound::Close) => continue,
                None => panic!("client side closed"),
            }
        }
    }

    /// Reply `ok` to the next client request and return it.
    pub async fn ack_next(&mut self) -> Value {
        let request = self.next_request().await;
        self.push(json!({ "id": request["id"], "ok": true })).await;
        request
    }

    pub fn saw_close(&mut self) -> bool {
        while let Ok(cmd) = self.outbound.try_recv() {
            if cmd == Outbound::Close {
                return true;
            }
        }
        false
    }
}

#[derive(Default)]
pub struct FakeConnector {
    connects: Mutex<Vec<(String, Instant)>>,
    sockets: Mutex<Vec<FakeSocket>>,
    pub fail_always: AtomicBool,
    pub fail_first: AtomicUsize,
}

impl FakeConnector {
    pub fn connect_times(&self, url: &str) -> Vec<Instant> {
        self.connects
            .lock()
            .iter()
            .filter(|(u, _)| u == url)
            .map(|(_, at)| *at)
            .collect()
    }

    /// Take the oldest live server socket for `url`.
    pub fn take_socket(&self, url: &str) -> Option<FakeSocket> {
        let mut sockets = self.sockets.lock();
        let pos = sockets.iter().position(|s| s.url == url)?;
        Some(sockets.remove(pos))
    }

    pub async fn wait_socket(&self, url: &str) -> FakeSocket {
        loop {
            if let Some(s) = self.take_socket(url) {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl WebsocketConnector for FakeConnector {
    async fn connect(&self, url: &str, _protocol_heartbeat: Option<Duration>) -> Result<WebsocketSession, TransportError> {
        self.connects.lock().push((url.to_string(), Instant::now()));
        if self.fail_always.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("refused".into()));
        }
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect("refused".into()));
        }
        let (in_tx, in_rx) = mpsc::channel(1024);
        let (out_tx, out_rx) = mpsc::channel(1024);
        self.sockets.lock().push(FakeSocket {
            url: url.to_string(),
            inbound: in_tx,
            outbound: out_rx,
        });
        Ok(WebsocketSession {
            sender: out_tx,
            receiver: in_rx,
        })
    }
}

// ---------------------------------------------------------------
// engine wiring
// ---------------------------------------------------------------

/// One symbol, nothing subscribed, no periodic work.
pub fn quiet_config() -> EngineConfig {
    EngineConfig {
        symbols: vec!["BTC".into()],
        fetch_instrument_information_at_start: false,
        fetch_instrument_information_period: None,
        fetch_bbo_period: None,
        check_open_order_period: None,
        check_in_flight_order_period: None,
        fetch_position_period: None,
        fetch_balance_period: None,
        prune_historical_trade_interval: None,
        prune_historical_ohlcv_interval: None,
        prune_historical_order_interval: None,
        prune_historical_fill_interval: None,
        websocket_application_heartbeat_period: None,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub rest: Arc<FakeRest>,
    pub ws: Arc<FakeConnector>,
}

pub fn harness(cfg: EngineConfig) -> Harness {
    harness_with(cfg, Arc::new(TestVenue::default()))
}

pub fn harness_with(cfg: EngineConfig, venue: Arc<dyn VenueAdapter>) -> Harness {
    let rest = Arc::new(FakeRest::default());
    let ws = Arc::new(FakeConnector::default());
    let engine = Engine::new(cfg, venue, rest.clone(), ws.clone(), Span::none());
    Harness { engine, rest, ws }
}

/// Let spawned tasks run; paused time auto-advances through the sleep.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
