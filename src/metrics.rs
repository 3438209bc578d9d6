// ===============================
// src/metrics.rs
// ===============================
use std::convert::Infallible;
use std::net::SocketAddr;

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{error, info};

use crate::state::StoreSizes;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- REST --------
pub static REST_RESPONSES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("rest_responses_total", "REST responses by routed kind and outcome"),
        &["kind", "outcome"],
    )
    .unwrap()
});

// -------- WebSocket health --------
pub static WS_CONNECTION_STATE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "ws_connection_state",
            "0 disconnected, 1 connecting, 2 connected, 3 logged in",
        ),
        &["role"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "Reconnect attempts per connection role"),
        &["role"],
    )
    .unwrap()
});

pub static WS_MESSAGES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_messages_total", "Inbound WebSocket messages per connection role"),
        &["role"],
    )
    .unwrap()
});

// -------- Orders --------
pub static ORDERS_SUBMITTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("orders_submitted_total", "Order creates/cancels submitted"),
        &["action", "api_method"],
    )
    .unwrap()
});

// -------- State store --------
pub static STORE_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("store_entries", "Entries held in the state store"),
        &["kind"],
    )
    .unwrap()
});

pub static CONFIG_SYMBOL: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_symbol", "configured symbols (label: symbol)"),
        &["symbol"],
    )
    .unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry; a second call is a no-op
    let _ = REGISTRY.register(Box::new(REST_RESPONSES.clone()));
    let _ = REGISTRY.register(Box::new(WS_CONNECTION_STATE.clone()));
    let _ = REGISTRY.register(Box::new(WS_RECONNECTS.clone()));
    let _ = REGISTRY.register(Box::new(WS_MESSAGES.clone()));
    let _ = REGISTRY.register(Box::new(ORDERS_SUBMITTED.clone()));
    let _ = REGISTRY.register(Box::new(STORE_ENTRIES.clone()));
    let _ = REGISTRY.register(Box::new(CONFIG_SYMBOL.clone()));
}

pub fn record_store_sizes(sizes: &StoreSizes) {
    for (kind, n) in [
        ("instrument_information", sizes.instruments),
        ("bbo", sizes.bbos),
        ("trade", sizes.trades),
        ("ohlcv", sizes.ohlcvs),
        ("order", sizes.orders),
        ("fill", sizes.fills),
        ("position", sizes.positions),
        ("balance", sizes.balances),
    ] {
        STORE_ENTRIES.with_label_values(&[kind]).set(n as i64);
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match req.uri().path() {
        "/" | "/metrics" => Response::builder()
            .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::from("not found\n")),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serve `/metrics` until the process exits.
pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });
    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make),
        Err(e) => {
            error!(%addr, error = %e, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on /metrics");
    if let Err(e) = server.await {
        error!(error = %e, "metrics server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_registered_metrics() {
        init();
        // registering again is harmless
        init();
        WS_RECONNECTS.with_label_values(&["market-data"]).inc();
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("ws_reconnects_total"));
    }
}
