// ===============================
// src/main.rs
// ===============================
/*
 # run against the testnet for five minutes
 BINANCE_TESTNET=1 SYNC_SUBSCRIBE_OHLCV=1 cargo run -- --symbols BTCUSDT,ETHUSDT --run-seconds 300

 # what the engine is holding
 curl -s localhost:9898/metrics | grep '^store_entries'
 curl -s localhost:9898/metrics | grep '^ws_connection_state'
*/
/*
=============================================================================
Project : venue_sync — exchange state synchronization engine in Rust
Module  : main.rs
Version : 0.1.0
License : MIT (see LICENSE)

Summary : Keeps an in-memory mirror of a venue's market data and account
          state in sync via REST polling, paginated backfill and WebSocket
          streams, and tracks the lifecycle of locally submitted orders.
=============================================================================
*/
use std::sync::Arc;

use clap::Parser;
use tokio::{
    select,
    time::{interval, sleep, Duration},
};
use tracing::{error, info, info_span};
use tracing_subscriber::EnvFilter;

use venue_sync::binance::{BinanceAdapter, BinanceConfig};
use venue_sync::config::{parse_symbols, EngineConfig};
use venue_sync::metrics;
use venue_sync::transport::{ReqwestTransport, TungsteniteConnector};
use venue_sync::{ConnectionRole, Engine};

#[derive(Parser, Debug)]
#[command(name = "venue_sync", version, about = "Mirror a venue's market and account state")]
struct Args {
    /// Comma separated symbols, `*` for every tradable one (overrides SYMBOLS)
    #[arg(long)]
    symbols: Option<String>,
    /// Stop after this many seconds; run until Ctrl-C when omitted
    #[arg(long)]
    run_seconds: Option<u64>,
    #[arg(long, default_value_t = 9898)]
    metrics_port: u16,
    /// Seconds between state summaries
    #[arg(long, default_value_t = 10)]
    summary_seconds: u64,
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Config ----
    let args = Args::parse();
    let mut cfg = EngineConfig::from_env();
    if let Some(s) = &args.symbols {
        cfg.symbols = parse_symbols(s);
    }
    let venue = BinanceConfig::from_env();
    info!(
        symbols = ?cfg.symbols,
        rest = %venue.rest_base_url,
        market_data_ws = %venue.market_data_ws_url,
        ws_api = %venue.ws_api_url,
        credentials = venue.has_credentials(),
        trade_api = %cfg.trade_api_method_preference.as_str(),
        "startup config"
    );

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Engine ----
    let engine = Engine::new(
        cfg,
        Arc::new(BinanceAdapter::new(venue)),
        Arc::new(ReqwestTransport::default()),
        Arc::new(TungsteniteConnector),
        info_span!("engine", venue = "binance"),
    );
    if let Err(e) = engine.start().await {
        error!(error = %e, "engine failed to start");
        return;
    }

    // ---- Summary loop ----
    let deadline = async {
        match args.run_seconds {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);
    let mut summary = interval(Duration::from_secs(args.summary_seconds.max(1)));

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("ctrl-c received");
                break;
            }
            _ = &mut deadline => {
                info!("run time elapsed");
                break;
            }
            _ = summary.tick() => log_summary(&engine),
        }
    }

    engine.stop().await;
}

fn log_summary(engine: &Engine) {
    let sizes = engine.with_store(|s| s.sizes());
    metrics::record_store_sizes(&sizes);
    let open_orders = engine.with_store(|s| s.orders().filter(|o| o.is_open()).count());
    info!(
        symbols = engine.symbols().len(),
        bbos = sizes.bbos,
        trades = sizes.trades,
        ohlcvs = sizes.ohlcvs,
        orders = sizes.orders,
        open_orders,
        fills = sizes.fills,
        balances = sizes.balances,
        market_data_ws = %engine.connection_state(ConnectionRole::MarketData).as_str(),
        account_ws = %engine.connection_state(ConnectionRole::Account).as_str(),
        trade_ws = %engine.connection_state(ConnectionRole::Trade).as_str(),
        "state summary"
    );
}
