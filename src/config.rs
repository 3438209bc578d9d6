// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : venue_sync — exchange state synchronization engine in Rust
Module  : config.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Keeps an in-memory mirror of a venue's market data and account
          state in sync via REST polling, paginated backfill and WebSocket
          streams, and tracks the lifecycle of locally submitted orders.
=============================================================================
*/
use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use dotenvy::dotenv;

use crate::backoff::BackoffPolicy;
use crate::domain::{ApiMethod, TimePoint};

/// Symbol list entry meaning "every tradable instrument".
pub const ALL_SYMBOLS: &str = "*";

/// Half-open `[start, end)` filter applied to historical pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoricalWindow {
    pub start: Option<TimePoint>,
    pub end: Option<TimePoint>,
}

impl HistoricalWindow {
    pub fn contains(&self, t: TimePoint) -> bool {
        self.start.map_or(true, |s| t >= s) && self.end.map_or(true, |e| t < e)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Venue symbols; `["*"]` resolves to all tradable instruments at start.
    pub symbols: Vec<String>,

    // ===== Streams =====
    pub subscribe_bbo: bool,
    pub subscribe_trade: bool,
    pub subscribe_ohlcv: bool,
    pub subscribe_order: bool,
    pub subscribe_fill: bool,
    pub subscribe_position: bool,
    pub subscribe_balance: bool,
    pub ohlcv_interval: Duration,

    // ===== Historical backfill & retention =====
    pub fetch_historical_trade_at_start: bool,
    pub historical_trade_window: HistoricalWindow,
    pub keep_historical_trade: Option<Duration>,
    pub prune_historical_trade_interval: Option<Duration>,

    pub fetch_historical_ohlcv_at_start: bool,
    pub historical_ohlcv_window: HistoricalWindow,
    pub keep_historical_ohlcv: Option<Duration>,
    pub prune_historical_ohlcv_interval: Option<Duration>,

    pub fetch_historical_order_at_start: bool,
    pub historical_order_window: HistoricalWindow,
    pub keep_historical_order: Option<Duration>,
    pub prune_historical_order_interval: Option<Duration>,

    pub fetch_historical_fill_at_start: bool,
    pub historical_fill_window: HistoricalWindow,
    pub keep_historical_fill: Option<Duration>,
    pub prune_historical_fill_interval: Option<Duration>,

    // ===== REST polling =====
    pub fetch_instrument_information_at_start: bool,
    pub fetch_instrument_information_period: Option<Duration>,
    pub fetch_bbo_period: Option<Duration>,
    pub check_open_order_period: Option<Duration>,
    pub check_open_order_threshold: Duration,
    pub check_in_flight_order_period: Option<Duration>,
    pub check_in_flight_order_threshold: Duration,
    pub fetch_position_period: Option<Duration>,
    pub fetch_balance_period: Option<Duration>,
    pub rest_market_data_request_delay: Duration,
    pub rest_account_request_delay: Duration,
    pub rest_timeout: Duration,

    // ===== WebSocket =====
    pub websocket_protocol_heartbeat_period: Option<Duration>,
    pub websocket_application_heartbeat_period: Option<Duration>,
    pub websocket_application_heartbeat_timeout: Option<Duration>,
    pub websocket_liveness_check_period: Duration,
    pub websocket_auto_reconnect: bool,
    pub reconnect_backoff: BackoffPolicy,
    pub websocket_market_data_channel_symbols_limit: usize,
    pub websocket_market_data_subscribe_delay: Duration,

    pub trade_api_method_preference: ApiMethod,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let keep = Some(Duration::from_secs(300));
        let prune = Some(Duration::from_secs(60));
        Self {
            symbols: Vec::new(),
            subscribe_bbo: false,
            subscribe_trade: false,
            subscribe_ohlcv: false,
            subscribe_order: false,
            subscribe_fill: false,
            subscribe_position: false,
            subscribe_balance: false,
            ohlcv_interval: Duration::from_secs(60),

            fetch_historical_trade_at_start: false,
            historical_trade_window: HistoricalWindow::default(),
            keep_historical_trade: keep,
            prune_historical_trade_interval: prune,
            fetch_historical_ohlcv_at_start: false,
            historical_ohlcv_window: HistoricalWindow::default(),
            keep_historical_ohlcv: keep,
            prune_historical_ohlcv_interval: prune,
            fetch_historical_order_at_start: false,
            historical_order_window: HistoricalWindow::default(),
            keep_historical_order: keep,
            prune_historical_order_interval: prune,
            fetch_historical_fill_at_start: false,
            historical_fill_window: HistoricalWindow::default(),
            keep_historical_fill: keep,
            prune_historical_fill_interval: prune,

            fetch_instrument_information_at_start: true,
            fetch_instrument_information_period: Some(Duration::from_secs(300)),
            fetch_bbo_period: Some(Duration::from_secs(300)),
            check_open_order_period: Some(Duration::from_secs(60)),
            check_open_order_threshold: Duration::from_secs(60),
            check_in_flight_order_period: Some(Duration::from_secs(10)),
            check_in_flight_order_threshold: Duration::from_secs(10),
            fetch_position_period: Some(Duration::from_secs(60)),
            fetch_balance_period: Some(Duration::from_secs(60)),
            rest_market_data_request_delay: Duration::from_millis(50),
            rest_account_request_delay: Duration::from_millis(50),
            rest_timeout: Duration::from_secs(10),

            websocket_protocol_heartbeat_period: Some(Duration::from_secs(10)),
            websocket_application_heartbeat_period: Some(Duration::from_secs(10)),
            websocket_application_heartbeat_timeout: Some(Duration::from_secs(20)),
            websocket_liveness_check_period: Duration::from_secs(1),
            websocket_auto_reconnect: true,
            reconnect_backoff: BackoffPolicy::default(),
            websocket_market_data_channel_symbols_limit: 50,
            websocket_market_data_subscribe_delay: Duration::from_millis(50),

            trade_api_method_preference: ApiMethod::Rest,
        }
    }
}

impl EngineConfig {
    /// Reads `SYNC_*` variables (after loading `.env`), falling back to defaults.
    pub fn from_env() -> Self {
        let _ = dotenv();
        let d = Self::default();

        // SYMBOLS=BTCUSDT,ETHUSDT  atau  SYMBOLS=*
        let symbols = env::var("SYMBOLS")
            .ok()
            .map(|s| parse_symbols(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| vec!["BTCUSDT".to_string()]);

        let trade_api_method_preference = match env::var("SYNC_TRADE_API_METHOD")
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str()
        {
            "websocket" | "ws" => ApiMethod::Websocket,
            "rest" => ApiMethod::Rest,
            _ => d.trade_api_method_preference,
        };

        Self {
            symbols,
            subscribe_bbo: env_bool("SYNC_SUBSCRIBE_BBO", true),
            subscribe_trade: env_bool("SYNC_SUBSCRIBE_TRADE", true),
            subscribe_ohlcv: env_bool("SYNC_SUBSCRIBE_OHLCV", false),
            subscribe_order: env_bool("SYNC_SUBSCRIBE_ORDER", false),
            subscribe_fill: env_bool("SYNC_SUBSCRIBE_FILL", false),
            subscribe_position: env_bool("SYNC_SUBSCRIBE_POSITION", false),
            subscribe_balance: env_bool("SYNC_SUBSCRIBE_BALANCE", false),
            ohlcv_interval: env_secs("SYNC_OHLCV_INTERVAL_SECONDS", d.ohlcv_interval),

            fetch_historical_trade_at_start: env_bool("SYNC_FETCH_HISTORICAL_TRADE", false),
            historical_trade_window: env_window("SYNC_HISTORICAL_TRADE"),
            keep_historical_trade: env_opt_secs("SYNC_KEEP_HISTORICAL_TRADE_SECONDS", d.keep_historical_trade),
            prune_historical_trade_interval: env_opt_secs(
                "SYNC_PRUNE_HISTORICAL_TRADE_INTERVAL_SECONDS",
                d.prune_historical_trade_interval,
            ),
            fetch_historical_ohlcv_at_start: env_bool("SYNC_FETCH_HISTORICAL_OHLCV", false),
            historical_ohlcv_window: env_window("SYNC_HISTORICAL_OHLCV"),
            keep_historical_ohlcv: env_opt_secs("SYNC_KEEP_HISTORICAL_OHLCV_SECONDS", d.keep_historical_ohlcv),
            prune_historical_ohlcv_interval: env_opt_secs(
                "SYNC_PRUNE_HISTORICAL_OHLCV_INTERVAL_SECONDS",
                d.prune_historical_ohlcv_interval,
            ),
            fetch_historical_order_at_start: env_bool("SYNC_FETCH_HISTORICAL_ORDER", false),
            historical_order_window: env_window("SYNC_HISTORICAL_ORDER"),
            keep_historical_order: env_opt_secs("SYNC_KEEP_HISTORICAL_ORDER_SECONDS", d.keep_historical_order),
            prune_historical_order_interval: env_opt_secs(
                "SYNC_PRUNE_HISTORICAL_ORDER_INTERVAL_SECONDS",
                d.prune_historical_order_interval,
            ),
            fetch_historical_fill_at_start: env_bool("SYNC_FETCH_HISTORICAL_FILL", false),
            historical_fill_window: env_window("SYNC_HISTORICAL_FILL"),
            keep_historical_fill: env_opt_secs("SYNC_KEEP_HISTORICAL_FILL_SECONDS", d.keep_historical_fill),
            prune_historical_fill_interval: env_opt_secs(
                "SYNC_PRUNE_HISTORICAL_FILL_INTERVAL_SECONDS",
                d.prune_historical_fill_interval,
            ),

            fetch_instrument_information_at_start: env_bool(
                "SYNC_FETCH_INSTRUMENT_INFORMATION_AT_START",
                d.fetch_instrument_information_at_start,
            ),
            fetch_instrument_information_period: env_opt_secs(
                "SYNC_FETCH_INSTRUMENT_INFORMATION_PERIOD_SECONDS",
                d.fetch_instrument_information_period,
            ),
            fetch_bbo_period: env_opt_secs("SYNC_FETCH_BBO_PERIOD_SECONDS", d.fetch_bbo_period),
            check_open_order_period: env_opt_secs(
                "SYNC_CHECK_OPEN_ORDER_PERIOD_SECONDS",
                d.check_open_order_period,
            ),
            check_open_order_threshold: env_secs(
                "SYNC_CHECK_OPEN_ORDER_THRESHOLD_SECONDS",
                d.check_open_order_threshold,
            ),
            check_in_flight_order_period: env_opt_secs(
                "SYNC_CHECK_IN_FLIGHT_ORDER_PERIOD_SECONDS",
                d.check_in_flight_order_period,
            ),
            check_in_flight_order_threshold: env_secs(
                "SYNC_CHECK_IN_FLIGHT_ORDER_THRESHOLD_SECONDS",
                d.check_in_flight_order_threshold,
            ),
            fetch_position_period: env_opt_secs("SYNC_FETCH_POSITION_PERIOD_SECONDS", d.fetch_position_period),
            fetch_balance_period: env_opt_secs("SYNC_FETCH_BALANCE_PERIOD_SECONDS", d.fetch_balance_period),
            rest_market_data_request_delay: env_millis(
                "SYNC_REST_MARKET_DATA_REQUEST_DELAY_MS",
                d.rest_market_data_request_delay,
            ),
            rest_account_request_delay: env_millis(
                "SYNC_REST_ACCOUNT_REQUEST_DELAY_MS",
                d.rest_account_request_delay,
            ),
            rest_timeout: env_secs("SYNC_REST_TIMEOUT_SECONDS", d.rest_timeout),

            websocket_protocol_heartbeat_period: env_opt_secs(
                "SYNC_WS_PROTOCOL_HEARTBEAT_PERIOD_SECONDS",
                d.websocket_protocol_heartbeat_period,
            ),
            websocket_application_heartbeat_period: env_opt_secs(
                "SYNC_WS_APPLICATION_HEARTBEAT_PERIOD_SECONDS",
                d.websocket_application_heartbeat_period,
            ),
            websocket_application_heartbeat_timeout: env_opt_secs(
                "SYNC_WS_APPLICATION_HEARTBEAT_TIMEOUT_SECONDS",
                d.websocket_application_heartbeat_timeout,
            ),
            websocket_liveness_check_period: d.websocket_liveness_check_period,
            websocket_auto_reconnect: env_bool("SYNC_WS_AUTO_RECONNECT", d.websocket_auto_reconnect),
            reconnect_backoff: BackoffPolicy {
                initial: env_secs("SYNC_WS_BACKOFF_INITIAL_SECONDS", d.reconnect_backoff.initial),
                multiplier: parse_env("SYNC_WS_BACKOFF_MULTIPLIER", d.reconnect_backoff.multiplier),
                max: env_secs("SYNC_WS_BACKOFF_MAX_SECONDS", d.reconnect_backoff.max),
                reset_after: env_secs("SYNC_WS_BACKOFF_RESET_SECONDS", d.reconnect_backoff.reset_after),
            },
            websocket_market_data_channel_symbols_limit: parse_env(
                "SYNC_WS_CHANNEL_SYMBOLS_LIMIT",
                d.websocket_market_data_channel_symbols_limit,
            ),
            websocket_market_data_subscribe_delay: env_millis(
                "SYNC_WS_SUBSCRIBE_DELAY_MS",
                d.websocket_market_data_subscribe_delay,
            ),

            trade_api_method_preference,
        }
    }

    pub fn wants_all_symbols(&self) -> bool {
        self.symbols.iter().any(|s| s == ALL_SYMBOLS)
    }

    pub fn subscribes_market_data(&self) -> bool {
        self.subscribe_bbo || self.subscribe_trade || self.subscribe_ohlcv
    }

    pub fn subscribes_account(&self) -> bool {
        self.subscribe_order || self.subscribe_fill || self.subscribe_position || self.subscribe_balance
    }
}

pub fn parse_symbols(s: &str) -> Vec<String> {
    s.split(',')
        .map(|x| x.trim())
        .filter(|x| !x.is_empty())
        .map(|x| x.to_ascii_uppercase())
        .collect()
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.trim().parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key).unwrap_or_default().trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok())
        .and_then(|x| Duration::try_from_secs_f64(x).ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// `none`/`off`/`0` disables the feature.
fn env_opt_secs(key: &str, default: Option<Duration>) -> Option<Duration> {
    match env::var(key) {
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "none" | "off" | "0" | "" => None,
            s => s
                .parse::<f64>()
                .ok()
                .and_then(|x| Duration::try_from_secs_f64(x).ok())
                .or(default),
        },
        Err(_) => default,
    }
}

/// `<PREFIX>_START` / `<PREFIX>_END` as unix seconds.
fn env_window(prefix: &str) -> HistoricalWindow {
    let at = |key: String| {
        env::var(key)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok())
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    };
    HistoricalWindow {
        start: at(format!("{prefix}_START")),
        end: at(format!("{prefix}_END")),
    }
}
