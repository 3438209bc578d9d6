// ===============================
// src/rest.rs
// ===============================
//
// REST driver: send, follow pagination continuations, route each successful
// page to exactly one reconciliation handler. No retries here; periodic
// callers re-issue on their own schedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, trace};

use crate::adapter::VenueAdapter;
use crate::config::{EngineConfig, HistoricalWindow};
use crate::domain::{Order, Sequenced};
use crate::envelope::{Continuation, RequestBuilder, RestResponse};
use crate::error::EngineError;
use crate::ids::IdGenerator;
use crate::metrics;
use crate::state::SharedStore;
use crate::transport::RestTransport;

pub struct RestDriver {
    adapter: Arc<dyn VenueAdapter>,
    transport: Arc<dyn RestTransport>,
    store: SharedStore,
    config: Arc<EngineConfig>,
    ids: Arc<IdGenerator>,
}

impl RestDriver {
    pub fn new(
        adapter: Arc<dyn VenueAdapter>,
        transport: Arc<dyn RestTransport>,
        store: SharedStore,
        config: Arc<EngineConfig>,
        ids: Arc<IdGenerator>,
    ) -> Self {
        Self {
            adapter,
            transport,
            store,
            config,
            ids,
        }
    }

    /// Send `builder`'s request (after `initial_delay`) and keep following
    /// continuations until a page has none. Returns that terminal page.
    pub async fn send(
        &self,
        builder: RequestBuilder,
        initial_delay: Duration,
        timeout: Duration,
    ) -> Result<RestResponse, EngineError> {
        let mut builder = builder;
        let mut delay = initial_delay;
        loop {
            if !delay.is_zero() {
                sleep(delay).await;
            }

            let mut request = builder.build(Utc::now());
            request.id = self.ids.next_rest_request_id();
            debug!(
                id = request.id,
                method = %request.method.as_str(),
                path = %request.path,
                "rest request"
            );

            let raw = match self.transport.execute(&request, timeout).await {
                Ok(raw) => raw,
                Err(e) => {
                    error!(id = request.id, path = %request.path, error = %e, "rest transport failed");
                    metrics::REST_RESPONSES
                        .with_label_values(&["transport", "error"])
                        .inc();
                    return Err(e.into());
                }
            };
            let response = RestResponse::new(request, raw.status, raw.headers, raw.body);
            trace!(id = response.request.id, status = response.status, body = %response.body, "rest response");

            if !self.adapter.is_rest_response_success(&response) {
                metrics::REST_RESPONSES
                    .with_label_values(&["unknown", "rejected"])
                    .inc();
                let orders = self.adapter.handle_rest_response_error(&response);
                self.reconcile_orders(orders);
                return Err(EngineError::RestStatus(response.status));
            }

            let next = self.route(&response)?;
            match next {
                Some(c) => {
                    builder = c.builder;
                    delay = c.delay;
                }
                None => return Ok(response),
            }
        }
    }

    /// Fixed priority: the first matching predicate wins.
    fn route(&self, response: &RestResponse) -> Result<Option<Continuation>, EngineError> {
        let a = &*self.adapter;
        let cfg = &*self.config;
        let request = &response.request;

        let (kind, next) = if a.is_rest_response_for_instrument_information(response) {
            let list = a.convert_rest_response_for_instrument_information(response.json_payload()?, request)?;
            debug!(count = list.len(), "instrument information snapshot");
            self.store.lock().replace_instrument_information(list);
            ("instrument_information", None)
        } else if a.is_rest_response_for_bbo(response) {
            let bbos = a.convert_rest_response_for_bbo(response.json_payload()?, request)?;
            let mut store = self.store.lock();
            for bbo in bbos {
                store.update_bbo(bbo);
            }
            ("bbo", None)
        } else if a.is_rest_response_for_historical_trade(response) {
            let payload = response.json_payload()?;
            let trades = within(a.convert_rest_response_for_historical_trade(payload, request)?, &cfg.historical_trade_window);
            let added = self.store.lock().backfill_trades(trades);
            debug!(added, "historical trades");
            let next = a.next_rest_request_for_historical_trade(cfg, payload, request)?;
            ("historical_trade", continuation(next, cfg.rest_market_data_request_delay))
        } else if a.is_rest_response_for_historical_ohlcv(response) {
            let payload = response.json_payload()?;
            let ohlcvs = within(a.convert_rest_response_for_historical_ohlcv(payload, request)?, &cfg.historical_ohlcv_window);
            let added = self.store.lock().backfill_ohlcvs(ohlcvs);
            debug!(added, "historical ohlcvs");
            let next = a.next_rest_request_for_historical_ohlcv(cfg, payload, request)?;
            ("historical_ohlcv", continuation(next, cfg.rest_market_data_request_delay))
        } else if a.is_rest_response_for_create_order(response) {
            let order = a.convert_rest_response_for_create_order(response.json_payload()?, request)?;
            self.reconcile_orders(vec![order]);
            ("create_order", None)
        } else if a.is_rest_response_for_cancel_order(response) {
            let order = a.convert_rest_response_for_cancel_order(response.json_payload()?, request)?;
            self.reconcile_orders(vec![order]);
            ("cancel_order", None)
        } else if a.is_rest_response_for_fetch_order(response) {
            let order = a.convert_rest_response_for_fetch_order(response.json_payload()?, request)?;
            self.reconcile_orders(vec![order]);
            ("fetch_order", None)
        } else if a.is_rest_response_for_fetch_open_orders(response) {
            let payload = response.json_payload()?;
            let orders = a.convert_rest_response_for_fetch_open_orders(payload, request)?;
            self.reconcile_orders(orders);
            let next = a.next_rest_request_for_fetch_open_orders(cfg, payload, request)?;
            ("fetch_open_orders", continuation(next, cfg.rest_account_request_delay))
        } else if a.is_rest_response_for_position(response) {
            let positions = a.convert_rest_response_for_position(response.json_payload()?, request)?;
            self.store.lock().replace_positions(positions);
            ("position", None)
        } else if a.is_rest_response_for_balance(response) {
            let balances = a.convert_rest_response_for_balance(response.json_payload()?, request)?;
            self.store.lock().replace_balances(balances);
            ("balance", None)
        } else if a.is_rest_response_for_historical_order(response) {
            let payload = response.json_payload()?;
            let orders = a.convert_rest_response_for_historical_order(payload, request)?;
            let window = cfg.historical_order_window;
            let orders: Vec<Order> = orders
                .into_iter()
                .filter(|o| o.exchange_update_time_point.map_or(true, |t| window.contains(t)))
                .collect();
            self.reconcile_orders(orders);
            let next = a.next_rest_request_for_historical_order(cfg, payload, request)?;
            ("historical_order", continuation(next, cfg.rest_account_request_delay))
        } else if a.is_rest_response_for_historical_fill(response) {
            let payload = response.json_payload()?;
            let fills = within(a.convert_rest_response_for_historical_fill(payload, request)?, &cfg.historical_fill_window);
            let added = self.store.lock().backfill_fills(fills);
            debug!(added, "historical fills");
            let next = a.next_rest_request_for_historical_fill(cfg, payload, request)?;
            ("historical_fill", continuation(next, cfg.rest_account_request_delay))
        } else {
            debug!(path = %request.path, "unrouted rest response");
            ("unrouted", None)
        };

        metrics::REST_RESPONSES.with_label_values(&[kind, "ok"]).inc();
        Ok(next)
    }

    fn reconcile_orders(&self, orders: Vec<Order>) {
        if orders.is_empty() {
            return;
        }
        let mut store = self.store.lock();
        for order in orders {
            let merged = store.upsert_order(order);
            debug!(
                symbol = %merged.symbol,
                client_order_id = %merged.client_order_id,
                status = %merged.status.as_str(),
                "order reconciled"
            );
        }
    }
}

fn within<T: Sequenced>(records: Vec<T>, window: &HistoricalWindow) -> Vec<T> {
    records
        .into_iter()
        .filter(|r| window.contains(r.time_point()))
        .collect()
}

fn continuation(next: Option<RequestBuilder>, delay: Duration) -> Option<Continuation> {
    next.map(|builder| Continuation { builder, delay })
}
