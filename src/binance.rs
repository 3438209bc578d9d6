// ===============================
// src/binance.rs
// ===============================
//
// Binance spot venue adapter. REST for snapshots, backfill and orders; the
// combined stream for market data; the WebSocket API for the account stream
// and for order entry.

use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde_json::{json, Map, Value};
use sha2::Sha256;
use tracing::{error, warn};

use crate::adapter::VenueAdapter;
use crate::config::EngineConfig;
use crate::domain::{
    Balance, Bbo, Fill, InstrumentInformation, Ohlcv, Order, OrderStatus, Side, TimePoint, Trade,
};
use crate::envelope::{
    ConnectionRole, Method, RequestBuilder, RestRequest, RestResponse, WebsocketMessage,
    WebsocketRequest, WebsocketRequestKind,
};
use crate::error::AdapterError;

type HmacSha256 = Hmac<Sha256>;
type Params = Vec<(String, String)>;

const EXCHANGE_INFO: &str = "/api/v3/exchangeInfo";
const BOOK_TICKER: &str = "/api/v3/ticker/bookTicker";
const AGG_TRADES: &str = "/api/v3/aggTrades";
const KLINES: &str = "/api/v3/klines";
const ORDER: &str = "/api/v3/order";
const OPEN_ORDERS: &str = "/api/v3/openOrders";
const ACCOUNT: &str = "/api/v3/account";
const ALL_ORDERS: &str = "/api/v3/allOrders";
const MY_TRADES: &str = "/api/v3/myTrades";

const PAGE_LIMIT: u64 = 1000;

pub fn sign_query(secret: &str, query: &str) -> Result<String, AdapterError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| AdapterError::Signing(e.to_string()))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone)]
pub struct BinanceConfig {
    pub api_key: String,
    pub api_secret: String,
    pub rest_base_url: String,
    pub market_data_ws_url: String,
    pub ws_api_url: String,
    pub recv_window_ms: u64,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_secret: String::new(),
            rest_base_url: "https://api.binance.com".into(),
            market_data_ws_url: "wss://stream.binance.com:9443/stream".into(),
            ws_api_url: "wss://ws-api.binance.com:443/ws-api/v3".into(),
            recv_window_ms: 5000,
        }
    }
}

impl BinanceConfig {
    pub fn testnet() -> Self {
        Self {
            rest_base_url: "https://testnet.binance.vision".into(),
            market_data_ws_url: "wss://stream.testnet.binance.vision/stream".into(),
            ws_api_url: "wss://ws-api.testnet.binance.vision/ws-api/v3".into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let testnet = env::var("BINANCE_TESTNET")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        let d = if testnet { Self::testnet() } else { Self::default() };
        Self {
            api_key: env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: env::var("BINANCE_API_SECRET").unwrap_or_default(),
            rest_base_url: env::var("BINANCE_REST_URL").unwrap_or(d.rest_base_url),
            market_data_ws_url: env::var("BINANCE_MARKET_DATA_WS_URL").unwrap_or(d.market_data_ws_url),
            ws_api_url: env::var("BINANCE_WS_API_URL").unwrap_or(d.ws_api_url),
            recv_window_ms: env::var("BINANCE_RECV_WINDOW_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(d.recv_window_ms),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct BinanceAdapter {
    cfg: Arc<BinanceConfig>,
}

impl BinanceAdapter {
    pub fn new(cfg: BinanceConfig) -> Self {
        Self { cfg: Arc::new(cfg) }
    }

    fn public(&self, path: &'static str, params: Params) -> RequestBuilder {
        let base = self.cfg.rest_base_url.clone();
        RequestBuilder::new(move |_now| with_params(RestRequest::new(Method::Get, base.as_str(), path), &params))
    }

    /// Timestamped and signed at build time, so every page carries a fresh signature.
    fn signed(&self, method: Method, path: &'static str, params: Params) -> Result<RequestBuilder, AdapterError> {
        if !self.cfg.has_credentials() {
            return Err(AdapterError::Unsupported("signed endpoints need BINANCE_API_KEY and BINANCE_API_SECRET"));
        }
        let cfg = self.cfg.clone();
        Ok(RequestBuilder::new(move |now| {
            let req = with_params(RestRequest::new(method, cfg.rest_base_url.as_str(), path), &params)
                .query("recvWindow", cfg.recv_window_ms)
                .query("timestamp", now.timestamp_millis())
                .header("X-MBX-APIKEY", cfg.api_key.as_str());
            match sign_query(&cfg.api_secret, &req.query_string()) {
                Ok(signature) => req.query("signature", signature),
                Err(e) => {
                    error!(path, error = %e, "request signing failed");
                    req
                }
            }
        }))
    }

    /// WebSocket API params: sorted, signed over the raw `k=v&...` string.
    fn ws_api_params(&self, params: Vec<(&str, String)>, now: TimePoint) -> Result<Map<String, Value>, AdapterError> {
        if !self.cfg.has_credentials() {
            return Err(AdapterError::Unsupported("websocket api needs BINANCE_API_KEY and BINANCE_API_SECRET"));
        }
        let mut params: Vec<(String, String)> = params.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
        params.push(("apiKey".into(), self.cfg.api_key.clone()));
        params.push(("timestamp".into(), now.timestamp_millis().to_string()));
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let signature = sign_query(&self.cfg.api_secret, &query)?;
        let mut map: Map<String, Value> = params.into_iter().map(|(k, v)| (k, Value::String(v))).collect();
        map.insert("signature".into(), Value::String(signature));
        Ok(map)
    }
}

fn param(key: &str, value: impl ToString) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn with_params(request: RestRequest, params: &Params) -> RestRequest {
    params
        .iter()
        .fold(request, |r, (k, v)| r.query(k.as_str(), v))
}

fn is_endpoint(response: &RestResponse, method: Method, path: &str) -> bool {
    response.request.method == method && response.request.path == path
}

fn request_symbol(request: &RestRequest) -> Result<String, AdapterError> {
    request
        .query_value("symbol")
        .map(str::to_string)
        .ok_or_else(|| AdapterError::Decode(format!("request to {} has no symbol", request.path)))
}

fn request_limit(request: &RestRequest) -> u64 {
    request
        .query_value("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(PAGE_LIMIT)
}

fn ws_id(id: &str) -> Value {
    id.parse::<u64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(id.to_string()))
}

/// Combined-stream and user-data events arrive wrapped; unwrap to the event body.
fn event_body(v: &Value) -> &Value {
    v.get("data").or_else(|| v.get("event")).unwrap_or(v)
}

fn event_type(message: &WebsocketMessage) -> Option<String> {
    let v = message.json_payload().ok()?;
    event_body(v).get("e")?.as_str().map(str::to_string)
}

pub fn kline_interval(d: Duration) -> Result<&'static str, AdapterError> {
    Ok(match d.as_secs() {
        1 => "1s",
        60 => "1m",
        180 => "3m",
        300 => "5m",
        900 => "15m",
        1800 => "30m",
        3600 => "1h",
        7200 => "2h",
        14400 => "4h",
        21600 => "6h",
        28800 => "8h",
        43200 => "12h",
        86400 => "1d",
        259200 => "3d",
        604800 => "1w",
        _ => return Err(AdapterError::Unsupported("ohlcv interval has no binance kline equivalent")),
    })
}

// ---- field decoding ----

fn field<'a>(v: &'a Value, key: &str) -> Result<&'a Value, AdapterError> {
    v.get(key)
        .ok_or_else(|| AdapterError::Decode(format!("missing field `{key}`")))
}

fn str_field<'a>(v: &'a Value, key: &str) -> Result<&'a str, AdapterError> {
    field(v, key)?
        .as_str()
        .ok_or_else(|| AdapterError::Decode(format!("field `{key}` is not a string")))
}

fn parse_dec(v: &Value) -> Option<Decimal> {
    match v {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn dec_field(v: &Value, key: &str) -> Result<Decimal, AdapterError> {
    parse_dec(field(v, key)?).ok_or_else(|| AdapterError::Decode(format!("field `{key}` is not a decimal")))
}

fn opt_dec(v: &Value, key: &str) -> Option<Decimal> {
    v.get(key).and_then(parse_dec)
}

fn u64_field(v: &Value, key: &str) -> Result<u64, AdapterError> {
    field(v, key)?
        .as_u64()
        .ok_or_else(|| AdapterError::Decode(format!("field `{key}` is not an unsigned integer")))
}

fn millis(ms: i64) -> Result<TimePoint, AdapterError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| AdapterError::Decode(format!("bad timestamp {ms}")))
}

fn time_field(v: &Value, key: &str) -> Result<TimePoint, AdapterError> {
    let ms = field(v, key)?
        .as_i64()
        .ok_or_else(|| AdapterError::Decode(format!("field `{key}` is not a timestamp")))?;
    millis(ms)
}

fn opt_time(v: &Value, key: &str) -> Option<TimePoint> {
    v.get(key).and_then(Value::as_i64).and_then(|ms| millis(ms).ok())
}

fn array(v: &Value) -> Result<&Vec<Value>, AdapterError> {
    v.as_array()
        .ok_or_else(|| AdapterError::Decode("expected an array".into()))
}

fn side(s: &str) -> Result<Side, AdapterError> {
    match s {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(AdapterError::Decode(format!("unknown side {other}"))),
    }
}

pub fn order_status(s: &str) -> Result<OrderStatus, AdapterError> {
    Ok(match s {
        "PENDING_NEW" => OrderStatus::CreateInFlight,
        "NEW" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "PENDING_CANCEL" => OrderStatus::CancelInFlight,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        other => return Err(AdapterError::Decode(format!("unknown order status {other}"))),
    })
}

/// Order result object shared by REST and the WebSocket API. `cid_key` is
/// `origClientOrderId` for cancel results.
fn order_from_result(v: &Value, cid_key: &str) -> Result<Order, AdapterError> {
    let status = order_status(str_field(v, "status")?)?;
    let mut order = Order::update(str_field(v, "symbol")?, str_field(v, cid_key)?, side(str_field(v, "side")?)?, status)
        .with_order_id(u64_field(v, "orderId")?.to_string());
    order.price = opt_dec(v, "price").filter(|p| !p.is_zero());
    order.quantity = opt_dec(v, "origQty");
    order.cumulative_filled_quantity = opt_dec(v, "executedQty");
    order.cumulative_filled_quote_quantity = opt_dec(v, "cummulativeQuoteQty").filter(|q| !q.is_sign_negative());
    order.exchange_create_time_point = opt_time(v, "time").or_else(|| opt_time(v, "transactTime"));
    order.exchange_update_time_point = opt_time(v, "updateTime").or_else(|| opt_time(v, "transactTime"));
    order.is_post_only = v.get("type").and_then(Value::as_str) == Some("LIMIT_MAKER");
    match v.get("timeInForce").and_then(Value::as_str) {
        Some("IOC") => order.is_ioc = true,
        Some("FOK") => order.is_fok = true,
        _ => {}
    }
    Ok(order)
}

fn order_from_execution_report(e: &Value) -> Result<Order, AdapterError> {
    let status = order_status(str_field(e, "X")?)?;
    // a cancel carries the canceled order's id in `C`
    let cid = match e.get("C").and_then(Value::as_str) {
        Some(orig) if !orig.is_empty() && status == OrderStatus::Canceled => orig,
        _ => str_field(e, "c")?,
    };
    let mut order = Order::update(str_field(e, "s")?, cid, side(str_field(e, "S")?)?, status)
        .with_order_id(u64_field(e, "i")?.to_string());
    order.price = opt_dec(e, "p").filter(|p| !p.is_zero());
    order.quantity = opt_dec(e, "q");
    order.cumulative_filled_quantity = opt_dec(e, "z");
    order.cumulative_filled_quote_quantity = opt_dec(e, "Z");
    order.exchange_create_time_point = opt_time(e, "O");
    order.exchange_update_time_point = opt_time(e, "T").or_else(|| opt_time(e, "E"));
    order.is_post_only = e.get("o").and_then(Value::as_str) == Some("LIMIT_MAKER");
    Ok(order)
}

/// Limit order (LIMIT_MAKER when post-only), market order when no price is set.
fn order_params(order: &Order) -> Result<Vec<(&'static str, String)>, AdapterError> {
    let quantity = order
        .quantity
        .ok_or_else(|| AdapterError::InvalidOrder(format!("{} has no quantity", order.client_order_id)))?;
    let mut params = vec![
        ("symbol", order.symbol.clone()),
        ("side", order.side.as_str().to_string()),
    ];
    match order.price {
        Some(price) if order.is_post_only => {
            params.push(("type", "LIMIT_MAKER".into()));
            params.push(("price", price.normalize().to_string()));
        }
        Some(price) => {
            let tif = if order.is_fok {
                "FOK"
            } else if order.is_ioc {
                "IOC"
            } else {
                "GTC"
            };
            params.push(("type", "LIMIT".into()));
            params.push(("timeInForce", tif.into()));
            params.push(("price", price.normalize().to_string()));
        }
        None => params.push(("type", "MARKET".into())),
    }
    params.push(("quantity", quantity.normalize().to_string()));
    params.push(("newClientOrderId", order.client_order_id.clone()));
    params.push(("newOrderRespType", "RESULT".into()));
    Ok(params)
}

fn to_params(params: Vec<(&str, String)>) -> Params {
    params.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Next backward page by id: `fromId` one page below the oldest id seen.
/// Stops on a short page, at id 0, or once the window start is crossed.
fn backward_by_id(
    page: &[Value],
    request: &RestRequest,
    id_key: &str,
    time_key: &str,
    window_start: Option<TimePoint>,
) -> Result<Option<(u64, u64)>, AdapterError> {
    let (Some(start), Some(first)) = (window_start, page.first()) else {
        return Ok(None);
    };
    let limit = request_limit(request);
    let first_id = u64_field(first, id_key)?;
    if (page.len() as u64) < limit || first_id == 0 || time_field(first, time_key)? <= start {
        return Ok(None);
    }
    let from_id = first_id.saturating_sub(limit);
    Ok(Some((from_id, first_id - from_id)))
}

impl VenueAdapter for BinanceAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    // ---------------------------------------------------------------
    // REST request builders
    // ---------------------------------------------------------------

    fn rest_fetch_instrument_information_request(&self, _cfg: &EngineConfig) -> Result<RequestBuilder, AdapterError> {
        Ok(self.public(EXCHANGE_INFO, Vec::new()))
    }

    fn rest_fetch_bbo_request(&self, _cfg: &EngineConfig, symbols: &[String]) -> Result<RequestBuilder, AdapterError> {
        let params = if symbols.is_empty() {
            Vec::new()
        } else {
            vec![param("symbols", serde_json::to_string(symbols)?)]
        };
        Ok(self.public(BOOK_TICKER, params))
    }

    fn rest_fetch_historical_trade_request(&self, _cfg: &EngineConfig, symbol: &str) -> Result<RequestBuilder, AdapterError> {
        Ok(self.public(AGG_TRADES, vec![param("symbol", symbol), param("limit", PAGE_LIMIT)]))
    }

    fn rest_fetch_historical_ohlcv_request(&self, cfg: &EngineConfig, symbol: &str) -> Result<RequestBuilder, AdapterError> {
        let mut params = vec![
            param("symbol", symbol),
            param("interval", kline_interval(cfg.ohlcv_interval)?),
            param("limit", PAGE_LIMIT),
        ];
        if let Some(end) = cfg.historical_ohlcv_window.end {
            params.push(param("endTime", end.timestamp_millis() - 1));
        }
        Ok(self.public(KLINES, params))
    }

    fn rest_create_order_request(&self, _cfg: &EngineConfig, order: &Order) -> Result<RequestBuilder, AdapterError> {
        self.signed(Method::Post, ORDER, to_params(order_params(order)?))
    }

    fn rest_cancel_order_request(&self, _cfg: &EngineConfig, order: &Order) -> Result<RequestBuilder, AdapterError> {
        self.signed(
            Method::Delete,
            ORDER,
            vec![param("symbol", &order.symbol), param("origClientOrderId", &order.client_order_id)],
        )
    }

    fn rest_fetch_order_request(&self, _cfg: &EngineConfig, order: &Order) -> Result<RequestBuilder, AdapterError> {
        self.signed(
            Method::Get,
            ORDER,
            vec![param("symbol", &order.symbol), param("origClientOrderId", &order.client_order_id)],
        )
    }

    fn rest_fetch_open_orders_request(&self, _cfg: &EngineConfig, symbol: Option<&str>) -> Result<RequestBuilder, AdapterError> {
        let params = symbol.map(|s| vec![param("symbol", s)]).unwrap_or_default();
        self.signed(Method::Get, OPEN_ORDERS, params)
    }

    fn rest_fetch_position_request(&self, _cfg: &EngineConfig) -> Result<RequestBuilder, AdapterError> {
        Err(AdapterError::Unsupported("positions on a spot venue"))
    }

    fn rest_fetch_balance_request(&self, _cfg: &EngineConfig) -> Result<RequestBuilder, AdapterError> {
        self.signed(Method::Get, ACCOUNT, vec![param("omitZeroBalances", "true")])
    }

    fn rest_fetch_historical_order_request(&self, cfg: &EngineConfig, symbol: &str) -> Result<RequestBuilder, AdapterError> {
        let mut params = vec![param("symbol", symbol), param("limit", PAGE_LIMIT)];
        if let Some(start) = cfg.historical_order_window.start {
            params.push(param("startTime", start.timestamp_millis()));
        }
        self.signed(Method::Get, ALL_ORDERS, params)
    }

    fn rest_fetch_historical_fill_request(&self, _cfg: &EngineConfig, symbol: &str) -> Result<RequestBuilder, AdapterError> {
        self.signed(Method::Get, MY_TRADES, vec![param("symbol", symbol), param("limit", PAGE_LIMIT)])
    }

    // ---------------------------------------------------------------
    // REST routing
    // ---------------------------------------------------------------

    fn is_rest_response_for_instrument_information(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, EXCHANGE_INFO)
    }
    fn is_rest_response_for_bbo(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, BOOK_TICKER)
    }
    fn is_rest_response_for_historical_trade(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, AGG_TRADES)
    }
    fn is_rest_response_for_historical_ohlcv(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, KLINES)
    }
    fn is_rest_response_for_create_order(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Post, ORDER)
    }
    fn is_rest_response_for_cancel_order(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Delete, ORDER)
    }
    fn is_rest_response_for_fetch_order(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, ORDER)
    }
    fn is_rest_response_for_fetch_open_orders(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, OPEN_ORDERS)
    }
    fn is_rest_response_for_balance(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, ACCOUNT)
    }
    fn is_rest_response_for_historical_order(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, ALL_ORDERS)
    }
    fn is_rest_response_for_historical_fill(&self, r: &RestResponse) -> bool {
        is_endpoint(r, Method::Get, MY_TRADES)
    }

    // ---------------------------------------------------------------
    // REST converters
    // ---------------------------------------------------------------

    fn convert_rest_response_for_instrument_information(
        &self,
        payload: &Value,
        _request: &RestRequest,
    ) -> Result<Vec<InstrumentInformation>, AdapterError> {
        let mut out = Vec::new();
        for s in array(field(payload, "symbols")?)? {
            let mut info = InstrumentInformation::new(str_field(s, "symbol")?, str_field(s, "status")? == "TRADING");
            info.base_asset = s.get("baseAsset").and_then(Value::as_str).map(str::to_string);
            info.quote_asset = s.get("quoteAsset").and_then(Value::as_str).map(str::to_string);
            for f in s.get("filters").and_then(Value::as_array).into_iter().flatten() {
                match f.get("filterType").and_then(Value::as_str) {
                    Some("PRICE_FILTER") => info.order_price_increment = opt_dec(f, "tickSize"),
                    Some("LOT_SIZE") => {
                        info.order_quantity_increment = opt_dec(f, "stepSize");
                        info.order_quantity_min = opt_dec(f, "minQty");
                    }
                    _ => {}
                }
            }
            out.push(info);
        }
        Ok(out)
    }

    fn convert_rest_response_for_bbo(&self, payload: &Value, _request: &RestRequest) -> Result<Vec<Bbo>, AdapterError> {
        let rows = match payload {
            Value::Array(rows) => rows.iter().collect::<Vec<_>>(),
            single => vec![single],
        };
        rows.into_iter()
            .map(|r| {
                Ok(Bbo {
                    symbol: str_field(r, "symbol")?.to_string(),
                    exchange_update_time_point: None,
                    best_bid_price: opt_dec(r, "bidPrice"),
                    best_bid_size: opt_dec(r, "bidQty"),
                    best_ask_price: opt_dec(r, "askPrice"),
                    best_ask_size: opt_dec(r, "askQty"),
                })
            })
            .collect()
    }

    fn convert_rest_response_for_historical_trade(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Result<Vec<Trade>, AdapterError> {
        let symbol = request_symbol(request)?;
        array(payload)?
            .iter()
            .map(|t| agg_trade(t, symbol.clone()))
            .collect()
    }

    fn convert_rest_response_for_historical_ohlcv(
        &self,
        payload: &Value,
        request: &RestRequest,
    ) -> Result<Vec<Ohlcv>, AdapterError> {
        let symbol = request_symbol(request)?;
        array(payload)?
            .iter()
            .map(|row| {
                let cols = array(row)?;
                let col = |i: usize| {
                    cols.get(i)
                        .and_then(parse_dec)
                        .ok_or_else(|| AdapterError::Decode(format!("kline column {i}")))
                };
                let open_ms = cols
                    .first()
                    .and_then(Value::as_i64)
                    .ok_or_else(|| AdapterError::Decode("kline open time".into()))?;
                Ok(Ohlcv {
                    symbol: symbol.clone(),
                    start_time_point: millis(open_ms)?,
                    open: col(1)?,
                    high: col(2)?,
                    low: col(3)?,
                    close: col(4)?,
                    volume: col(5)?,
                    quote_volume: col(7).ok(),
                })
            })
            .collect()
    }

    fn convert_rest_response_for_create_order(&self, payload: &Value, _request: &RestRequest) -> Result<Order, AdapterError> {
        order_from_result(payload, "clientOrderId")
    }

    fn convert_rest_response_for_cancel_order(&self, payload: &Value, _request: &RestRequest) -> Result<Order, AdapterError> {
        order_from_result(payload, "origClientOrderId")
    }

    fn convert_rest_response_for_fetch_order(&self, payload: &Value, _request: &RestRequest) -> Result<Order, AdapterError> {
        order_from_result(payload, "clientOrderId")
    }

    fn convert_rest_response_for_fetch_open_orders(
        &self,
        payload: &Value,
        _request: &RestRequest,
    ) -> Result<Vec<Order>, AdapterError> {
        array(payload)?
            .iter()
            .map(|o| order_from_result(o, "clientOrderId"))
            .collect()
    }

    fn convert_rest_response_for_balance(&self, payload: &Value, _request: &RestRequest) -> Result<Vec<Balance>, AdapterError> {
        let time = opt_time(payload, "updateTime");
        array(field(payload, "balances")?)?
            .iter()
            .map(|b| {
                Ok(Balance {
                    asset: str_field(b, "asset")?.to_string(),
                    exchange_update_time_point: time,
                    quantity: dec_field(b, "free")? + dec_field(b, "locked")?,
                })
            })
            .collect()
    }

    fn convert_rest_response_for_historical_order(
        &self,
        payload: &Value,
        _request: &RestRequest,
    ) -> Result<Vec<Order>, AdapterError> {
        array(payload)?
            .iter()
            .map(|o| order_from_result(o, "clientOrderId"))
            .collect()
    }

    fn convert_rest_response_for_historical_fill(
        &self,
        payload: &Value,
        _request: &RestRequest,
    ) -> Result<Vec<Fill>, AdapterError> {
        array(payload)?
            .iter()
            .map(|f| {
                let is_buyer = field(f, "isBuyer")?.as_bool().unwrap_or(false);
                Ok(Fill {
                    symbol: str_field(f, "symbol")?.to_string(),
                    exchange_update_time_point: time_field(f, "time")?,
                    trade_id: u64_field(f, "id")?,
                    order_id: f.get("orderId").and_then(Value::as_u64).map(|i| i.to_string()),
                    client_order_id: None,
                    price: dec_field(f, "price")?,
                    size: dec_field(f, "qty")?,
                    side: Some(if is_buyer { Side::Buy } else { Side::Sell }),
                    is_maker: f.get("isMaker").and_then(Value::as_bool),
                    fee_asset: f.get("commissionAsset").and_then(Value::as_str).map(str::to_string),
                    fee_quantity: opt_dec(f, "commission"),
                })
            })
            .collect()
    }

    // ---------------------------------------------------------------
    // REST pagination
    // ---------------------------------------------------------------

    fn next_rest_request_for_historical_trade(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        let next = backward_by_id(array(payload)?, request, "a", "T", cfg.historical_trade_window.start)?;
        let symbol = request_symbol(request)?;
        Ok(next.map(|(from_id, limit)| {
            self.public(
                AGG_TRADES,
                vec![param("symbol", symbol), param("fromId", from_id), param("limit", limit)],
            )
        }))
    }

    fn next_rest_request_for_historical_ohlcv(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        let page = array(payload)?;
        let (Some(start), Some(first)) = (cfg.historical_ohlcv_window.start, page.first()) else {
            return Ok(None);
        };
        let first_ms = first
            .get(0)
            .and_then(Value::as_i64)
            .ok_or_else(|| AdapterError::Decode("kline open time".into()))?;
        if (page.len() as u64) < request_limit(request) || millis(first_ms)? <= start {
            return Ok(None);
        }
        Ok(Some(self.public(
            KLINES,
            vec![
                param("symbol", request_symbol(request)?),
                param("interval", kline_interval(cfg.ohlcv_interval)?),
                param("limit", request_limit(request)),
                param("endTime", first_ms - 1),
            ],
        )))
    }

    fn next_rest_request_for_historical_order(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        let page = array(payload)?;
        let Some(last) = page.last() else {
            return Ok(None);
        };
        if (page.len() as u64) < request_limit(request) {
            return Ok(None);
        }
        if let (Some(end), Some(t)) = (cfg.historical_order_window.end, opt_time(last, "updateTime")) {
            if t >= end {
                return Ok(None);
            }
        }
        let next_id = u64_field(last, "orderId")? + 1;
        self.signed(
            Method::Get,
            ALL_ORDERS,
            vec![
                param("symbol", request_symbol(request)?),
                param("orderId", next_id),
                param("limit", request_limit(request)),
            ],
        )
        .map(Some)
    }

    fn next_rest_request_for_historical_fill(
        &self,
        cfg: &EngineConfig,
        payload: &Value,
        request: &RestRequest,
    ) -> Result<Option<RequestBuilder>, AdapterError> {
        let Some((from_id, limit)) =
            backward_by_id(array(payload)?, request, "id", "time", cfg.historical_fill_window.start)?
        else {
            return Ok(None);
        };
        self.signed(
            Method::Get,
            MY_TRADES,
            vec![
                param("symbol", request_symbol(request)?),
                param("fromId", from_id),
                param("limit", limit),
            ],
        )
        .map(Some)
    }

    /// A 4xx on create means the venue never accepted the order.
    fn handle_rest_response_error(&self, response: &RestResponse) -> Vec<Order> {
        warn!(
            venue = "binance",
            status = response.status,
            method = %response.request.method.as_str(),
            path = %response.request.path,
            body = %response.body,
            "rest response error"
        );
        let request = &response.request;
        if !is_endpoint(response, Method::Post, ORDER) || !(400..500).contains(&response.status) {
            return Vec::new();
        }
        let (Some(symbol), Some(cid), Some(s)) = (
            request.query_value("symbol"),
            request.query_value("newClientOrderId"),
            request.query_value("side").and_then(|s| side(s).ok()),
        ) else {
            return Vec::new();
        };
        vec![Order::update(symbol, cid, s, OrderStatus::Rejected).with_local_update_time_point(Utc::now())]
    }

    // ---------------------------------------------------------------
    // WebSocket endpoints & requests
    // ---------------------------------------------------------------

    fn websocket_url(&self, _cfg: &EngineConfig, role: ConnectionRole) -> Option<String> {
        match role {
            ConnectionRole::MarketData => Some(self.cfg.market_data_ws_url.clone()),
            ConnectionRole::Account if self.cfg.has_credentials() => Some(self.cfg.ws_api_url.clone()),
            ConnectionRole::Trade if self.cfg.has_credentials() => {
                Some(format!("{}?returnRateLimits=false", self.cfg.ws_api_url))
            }
            _ => None,
        }
    }

    fn websocket_market_data_subscribe_request(
        &self,
        cfg: &EngineConfig,
        symbols: &[String],
        id: String,
    ) -> Result<WebsocketRequest, AdapterError> {
        let kline = if cfg.subscribe_ohlcv {
            Some(format!("kline_{}", kline_interval(cfg.ohlcv_interval)?))
        } else {
            None
        };
        let mut streams = Vec::new();
        for s in symbols {
            let s = s.to_lowercase();
            if cfg.subscribe_bbo {
                streams.push(format!("{s}@bookTicker"));
            }
            if cfg.subscribe_trade {
                streams.push(format!("{s}@aggTrade"));
            }
            if let Some(k) = &kline {
                streams.push(format!("{s}@{k}"));
            }
        }
        let payload = if streams.is_empty() {
            String::new()
        } else {
            json!({ "method": "SUBSCRIBE", "params": streams, "id": ws_id(&id) }).to_string()
        };
        Ok(WebsocketRequest::new(id, WebsocketRequestKind::Subscribe, payload))
    }

    /// The account connection logs in by subscribing the user data stream.
    fn websocket_login_request(
        &self,
        _cfg: &EngineConfig,
        role: ConnectionRole,
        id: String,
        now: TimePoint,
    ) -> Result<Option<WebsocketRequest>, AdapterError> {
        if role != ConnectionRole::Account {
            return Ok(None);
        }
        let params = self.ws_api_params(Vec::new(), now)?;
        let payload = json!({
            "id": ws_id(&id),
            "method": "userDataStream.subscribe.signature",
            "params": params,
        });
        Ok(Some(WebsocketRequest::new(id, WebsocketRequestKind::Login, payload.to_string())))
    }

    fn websocket_ping_request(&self, role: ConnectionRole, id: String) -> Option<WebsocketRequest> {
        if role == ConnectionRole::MarketData {
            return None;
        }
        let payload = json!({ "id": ws_id(&id), "method": "ping" }).to_string();
        Some(WebsocketRequest::new(id, WebsocketRequestKind::Ping, payload))
    }

    fn websocket_create_order_request(
        &self,
        _cfg: &EngineConfig,
        order: &Order,
        id: String,
        now: TimePoint,
    ) -> Result<WebsocketRequest, AdapterError> {
        let params = self.ws_api_params(order_params(order)?, now)?;
        let payload = json!({ "id": ws_id(&id), "method": "order.place", "params": params });
        Ok(WebsocketRequest::new(id, WebsocketRequestKind::CreateOrder, payload.to_string()))
    }

    fn websocket_cancel_order_request(
        &self,
        _cfg: &EngineConfig,
        order: &Order,
        id: String,
        now: TimePoint,
    ) -> Result<WebsocketRequest, AdapterError> {
        let params = self.ws_api_params(
            vec![
                ("symbol", order.symbol.clone()),
                ("origClientOrderId", order.client_order_id.clone()),
            ],
            now,
        )?;
        let payload = json!({ "id": ws_id(&id), "method": "order.cancel", "params": params });
        Ok(WebsocketRequest::new(id, WebsocketRequestKind::CancelOrder, payload.to_string()))
    }

    // ---------------------------------------------------------------
    // WebSocket demultiplexing
    // ---------------------------------------------------------------

    fn extract_websocket_request_id(&self, message: &WebsocketMessage) -> Option<String> {
        match message.json_payload().ok()?.get("id")? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn is_websocket_response_success(&self, message: &WebsocketMessage) -> bool {
        let Ok(v) = message.json_payload() else {
            return false;
        };
        v.get("error").is_none()
            && v.get("status")
                .and_then(Value::as_u64)
                .map_or(true, |s| (200..300).contains(&s))
    }

    fn is_websocket_push_for_bbo(&self, message: &WebsocketMessage) -> bool {
        message
            .json_payload()
            .ok()
            .and_then(|v| v.get("stream"))
            .and_then(Value::as_str)
            .map_or(false, |s| s.ends_with("@bookTicker"))
    }
    fn is_websocket_push_for_trade(&self, message: &WebsocketMessage) -> bool {
        event_type(message).as_deref() == Some("aggTrade")
    }
    fn is_websocket_push_for_ohlcv(&self, message: &WebsocketMessage) -> bool {
        event_type(message).as_deref() == Some("kline")
    }
    fn is_websocket_push_for_order(&self, message: &WebsocketMessage) -> bool {
        event_type(message).as_deref() == Some("executionReport")
    }
    fn is_websocket_push_for_balance(&self, message: &WebsocketMessage) -> bool {
        event_type(message).as_deref() == Some("outboundAccountPosition")
    }

    fn convert_websocket_push_for_bbo(&self, payload: &Value) -> Result<Vec<Bbo>, AdapterError> {
        let d = event_body(payload);
        Ok(vec![Bbo {
            symbol: str_field(d, "s")?.to_string(),
            exchange_update_time_point: opt_time(d, "E"),
            best_bid_price: opt_dec(d, "b"),
            best_bid_size: opt_dec(d, "B"),
            best_ask_price: opt_dec(d, "a"),
            best_ask_size: opt_dec(d, "A"),
        }])
    }

    fn convert_websocket_push_for_trade(&self, payload: &Value) -> Result<Vec<Trade>, AdapterError> {
        let d = event_body(payload);
        Ok(vec![agg_trade(d, str_field(d, "s")?.to_string())?])
    }

    fn convert_websocket_push_for_ohlcv(&self, payload: &Value) -> Result<Vec<Ohlcv>, AdapterError> {
        let k = field(event_body(payload), "k")?;
        Ok(vec![Ohlcv {
            symbol: str_field(k, "s")?.to_string(),
            start_time_point: time_field(k, "t")?,
            open: dec_field(k, "o")?,
            high: dec_field(k, "h")?,
            low: dec_field(k, "l")?,
            close: dec_field(k, "c")?,
            volume: dec_field(k, "v")?,
            quote_volume: opt_dec(k, "q"),
        }])
    }

    fn convert_websocket_push_for_order(&self, payload: &Value) -> Result<Vec<Order>, AdapterError> {
        Ok(vec![order_from_execution_report(event_body(payload))?])
    }

    fn convert_websocket_push_for_balance(&self, payload: &Value) -> Result<Vec<Balance>, AdapterError> {
        let e = event_body(payload);
        let time = opt_time(e, "u").or_else(|| opt_time(e, "E"));
        array(field(e, "B")?)?
            .iter()
            .map(|b| {
                Ok(Balance {
                    asset: str_field(b, "a")?.to_string(),
                    exchange_update_time_point: time,
                    quantity: dec_field(b, "f")? + dec_field(b, "l")?,
                })
            })
            .collect()
    }

    fn convert_websocket_response_for_create_order(
        &self,
        payload: &Value,
        _request: Option<&WebsocketRequest>,
    ) -> Result<Order, AdapterError> {
        order_from_result(field(payload, "result")?, "clientOrderId")
    }

    fn convert_websocket_response_for_cancel_order(
        &self,
        payload: &Value,
        _request: Option<&WebsocketRequest>,
    ) -> Result<Order, AdapterError> {
        order_from_result(field(payload, "result")?, "origClientOrderId")
    }

    fn handle_websocket_response_error(&self, message: &WebsocketMessage) -> Vec<Order> {
        warn!(
            venue = "binance",
            role = %message.role.as_str(),
            request_id = ?message.request_id,
            payload = %message.payload,
            "websocket response error"
        );
        match &message.request {
            Some(WebsocketRequest {
                kind: WebsocketRequestKind::CreateOrder,
                order: Some(order),
                ..
            }) => vec![order
                .clone()
                .with_status(OrderStatus::Rejected)
                .with_local_update_time_point(Utc::now())],
            _ => Vec::new(),
        }
    }
}

/// aggTrade row: `m` set means the buyer was the maker, so the taker sold.
fn agg_trade(t: &Value, symbol: String) -> Result<Trade, AdapterError> {
    let buyer_is_maker = t.get("m").and_then(Value::as_bool);
    Ok(Trade {
        symbol,
        exchange_update_time_point: time_field(t, "T")?,
        trade_id: u64_field(t, "a")?,
        price: dec_field(t, "p")?,
        size: dec_field(t, "q")?,
        side: buyer_is_maker.map(|m| if m { Side::Sell } else { Side::Buy }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new(BinanceConfig {
            api_key: "key".into(),
            api_secret: "secret".into(),
            ..BinanceConfig::default()
        })
    }

    fn now() -> TimePoint {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    #[test]
    fn signs_like_the_documented_example() {
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(secret, query).unwrap(),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn signed_request_carries_key_and_trailing_signature() {
        let cfg = EngineConfig::default();
        let order = Order::limit("BTCUSDT", Side::Buy, dec!(30000.10), dec!(0.5)).with_client_order_id("c1");
        let req = adapter().rest_create_order_request(&cfg, &order).unwrap().build(now());
        assert_eq!(req.method, Method::Post);
        assert_eq!(req.query_value("type"), Some("LIMIT"));
        assert_eq!(req.query_value("timeInForce"), Some("GTC"));
        assert_eq!(req.query_value("price"), Some("30000.1"));
        assert_eq!(req.query_value("timestamp"), Some("1700000000000"));
        assert_eq!(req.headers, vec![("X-MBX-APIKEY".to_string(), "key".to_string())]);
        let (last_key, signature) = req.query_params.last().unwrap().clone();
        assert_eq!(last_key, "signature");
        let unsigned = RestRequest {
            query_params: req.query_params[..req.query_params.len() - 1].to_vec(),
            ..req.clone()
        };
        assert_eq!(signature, sign_query("secret", &unsigned.query_string()).unwrap());
    }

    #[test]
    fn post_only_becomes_limit_maker() {
        let order = Order::limit("BTCUSDT", Side::Sell, dec!(1), dec!(2))
            .with_client_order_id("c2")
            .with_flags(true, false, false, false);
        let params = order_params(&order).unwrap();
        assert!(params.contains(&("type", "LIMIT_MAKER".to_string())));
        assert!(!params.iter().any(|(k, _)| *k == "timeInForce"));
    }

    #[test]
    fn private_endpoints_without_credentials_are_unsupported() {
        let a = BinanceAdapter::new(BinanceConfig::default());
        let cfg = EngineConfig::default();
        assert!(matches!(a.rest_fetch_balance_request(&cfg), Err(AdapterError::Unsupported(_))));
        assert!(a.websocket_url(&cfg, ConnectionRole::Account).is_none());
        assert!(a.websocket_url(&cfg, ConnectionRole::MarketData).is_some());
    }

    #[test]
    fn agg_trades_take_symbol_from_request_and_taker_side() {
        let req = RestRequest::new(Method::Get, "https://x", AGG_TRADES).query("symbol", "BTCUSDT");
        let payload = json!([
            {"a": 7, "p": "100.5", "q": "0.1", "f": 1, "l": 1, "T": 1700000000000i64, "m": true},
            {"a": 8, "p": "100.6", "q": "0.2", "f": 2, "l": 2, "T": 1700000000001i64, "m": false}
        ]);
        let trades = adapter().convert_rest_response_for_historical_trade(&payload, &req).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].symbol, "BTCUSDT");
        assert_eq!(trades[0].side, Some(Side::Sell));
        assert_eq!(trades[1].side, Some(Side::Buy));
        assert_eq!(trades[1].price, dec!(100.6));
    }

    #[test]
    fn agg_trade_pages_walk_backwards_until_window_start() {
        let mut cfg = EngineConfig::default();
        cfg.historical_trade_window.start = Some(now() - chrono::Duration::hours(1));
        let req = RestRequest::new(Method::Get, "https://x", AGG_TRADES)
            .query("symbol", "BTCUSDT")
            .query("limit", 2);
        let full = json!([
            {"a": 10, "p": "1", "q": "1", "T": now().timestamp_millis()},
            {"a": 11, "p": "1", "q": "1", "T": now().timestamp_millis()}
        ]);
        let next = adapter()
            .next_rest_request_for_historical_trade(&cfg, &full, &req)
            .unwrap()
            .unwrap()
            .build(now());
        assert_eq!(next.query_value("fromId"), Some("8"));
        assert_eq!(next.query_value("limit"), Some("2"));

        let short = json!([{"a": 10, "p": "1", "q": "1", "T": now().timestamp_millis()}]);
        assert!(adapter()
            .next_rest_request_for_historical_trade(&cfg, &short, &req)
            .unwrap()
            .is_none());

        cfg.historical_trade_window.start = None;
        assert!(adapter()
            .next_rest_request_for_historical_trade(&cfg, &full, &req)
            .unwrap()
            .is_none());
    }

    #[test]
    fn klines_page_backwards_by_end_time() {
        let mut cfg = EngineConfig::default();
        cfg.historical_ohlcv_window.start = Some(millis(0).unwrap());
        let req = RestRequest::new(Method::Get, "https://x", KLINES)
            .query("symbol", "ETHUSDT")
            .query("limit", 1);
        let payload = json!([[120000, "1", "2", "0.5", "1.5", "10", 179999, "15"]]);
        let bars = adapter().convert_rest_response_for_historical_ohlcv(&payload, &req).unwrap();
        assert_eq!(bars[0].high, dec!(2));
        assert_eq!(bars[0].quote_volume, Some(dec!(15)));
        let next = adapter()
            .next_rest_request_for_historical_ohlcv(&cfg, &payload, &req)
            .unwrap()
            .unwrap()
            .build(now());
        assert_eq!(next.query_value("endTime"), Some("119999"));
        assert_eq!(next.query_value("interval"), Some("1m"));
    }

    #[test]
    fn canceled_execution_report_uses_original_client_id() {
        let payload = json!({
            "subscriptionId": 0,
            "event": {
                "e": "executionReport", "E": 1700000000100i64, "s": "BTCUSDT",
                "c": "cancel-req", "C": "c1", "S": "BUY", "o": "LIMIT",
                "q": "1.0", "p": "100.0", "X": "CANCELED", "i": 42,
                "z": "0.25", "Z": "25.0", "T": 1700000000090i64, "O": 1700000000000i64
            }
        });
        let msg = WebsocketMessage::new(ConnectionRole::Account, "wss://x", payload.to_string());
        let a = adapter();
        assert!(a.is_websocket_push_for_order(&msg));
        assert!(a.extract_websocket_request_id(&msg).is_none());
        let orders = a.convert_websocket_push_for_order(&payload).unwrap();
        assert_eq!(orders[0].client_order_id, "c1");
        assert_eq!(orders[0].status, OrderStatus::Canceled);
        assert_eq!(orders[0].order_id.as_deref(), Some("42"));
        assert_eq!(orders[0].cumulative_filled_quantity, Some(dec!(0.25)));
    }

    #[test]
    fn rejected_rest_create_reports_rejected_order() {
        let req = RestRequest::new(Method::Post, "https://x", ORDER)
            .query("symbol", "BTCUSDT")
            .query("side", "SELL")
            .query("newClientOrderId", "c9");
        let rsp = RestResponse::new(req, 400, Vec::new(), r#"{"code":-2010,"msg":"insufficient balance"}"#.into());
        let orders = adapter().handle_rest_response_error(&rsp);
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].client_order_id, "c9");
        assert_eq!(orders[0].status, OrderStatus::Rejected);
    }

    #[test]
    fn subscribe_lists_enabled_streams() {
        let cfg = EngineConfig {
            subscribe_bbo: true,
            subscribe_ohlcv: true,
            ..EngineConfig::default()
        };
        let req = adapter()
            .websocket_market_data_subscribe_request(&cfg, &["BTCUSDT".to_string()], "3".into())
            .unwrap();
        let v: Value = serde_json::from_str(&req.payload).unwrap();
        assert_eq!(v["id"], json!(3));
        assert_eq!(v["params"], json!(["btcusdt@bookTicker", "btcusdt@kline_1m"]));
    }

    #[test]
    fn ws_api_error_response_is_not_success() {
        let a = adapter();
        let ok = WebsocketMessage::new(ConnectionRole::Trade, "wss://x", r#"{"id":5,"status":200,"result":{}}"#);
        let bad = WebsocketMessage::new(
            ConnectionRole::Trade,
            "wss://x",
            r#"{"id":6,"status":400,"error":{"code":-1013,"msg":"Filter failure"}}"#,
        );
        assert!(a.is_websocket_response_success(&ok));
        assert!(!a.is_websocket_response_success(&bad));
        assert_eq!(a.extract_websocket_request_id(&bad).as_deref(), Some("6"));
    }
}
