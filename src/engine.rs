// ===============================
// src/engine.rs
// ===============================
//
// Orchestrator: owns the store, the drivers and every background task, and is
// the only component with a lifecycle. `stop()` is the single cancellation
// boundary.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Span};

use crate::adapter::VenueAdapter;
use crate::backoff::ReconnectBackoff;
use crate::config::{EngineConfig, ALL_SYMBOLS};
use crate::domain::{ApiMethod, Order, OrderStatus};
use crate::envelope::{ConnectionRole, RequestBuilder};
use crate::error::{AdapterError, EngineError};
use crate::ids::IdGenerator;
use crate::metrics;
use crate::rest::RestDriver;
use crate::state::{SharedStore, StateStore};
use crate::tasks::TaskGroup;
use crate::transport::{RestTransport, WebsocketConnector};
use crate::ws::{ConnectionState, DriverContext, WebsocketDriver};

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<EngineConfig>,
    adapter: Arc<dyn VenueAdapter>,
    connector: Arc<dyn WebsocketConnector>,
    rest: RestDriver,
    store: SharedStore,
    ids: Arc<IdGenerator>,
    backoff: Arc<ReconnectBackoff>,
    tasks: Arc<TaskGroup>,
    token: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    symbols: RwLock<Vec<String>>,
    websockets: Mutex<HashMap<ConnectionRole, Arc<WebsocketDriver>>>,
}

/// Periodic REST features that passed request validation at start.
#[derive(Debug, Default, Clone, Copy)]
struct Enabled {
    bbo: bool,
    position: bool,
    balance: bool,
    open_orders: bool,
}

impl Engine {
    /// `span` is the logging context every engine task runs under; pass
    /// `Span::none()` for none.
    pub fn new(
        config: EngineConfig,
        adapter: Arc<dyn VenueAdapter>,
        rest_transport: Arc<dyn RestTransport>,
        connector: Arc<dyn WebsocketConnector>,
        span: Span,
    ) -> Self {
        let config = Arc::new(config);
        let store = StateStore::shared();
        let ids = Arc::new(IdGenerator::new());
        let token = CancellationToken::new();
        let rest = RestDriver::new(
            adapter.clone(),
            rest_transport,
            store.clone(),
            config.clone(),
            ids.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                backoff: Arc::new(ReconnectBackoff::new(config.reconnect_backoff.clone())),
                tasks: Arc::new(TaskGroup::new(token.clone(), span)),
                symbols: RwLock::new(config.symbols.clone()),
                config,
                adapter,
                connector,
                rest,
                store,
                ids,
                token,
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                websockets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Read access to the mirrored state. Keep `f` short: it runs under the store lock.
    pub fn with_store<R>(&self, f: impl FnOnce(&StateStore) -> R) -> R {
        f(&self.inner.store.lock())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.inner.symbols.read().clone()
    }

    pub fn connection_state(&self, role: ConnectionRole) -> ConnectionState {
        self.websocket(role)
            .map_or(ConnectionState::Disconnected, |d| d.state())
    }

    pub fn subscribe_connection_state(&self, role: ConnectionRole) -> Option<watch::Receiver<ConnectionState>> {
        self.websocket(role).map(|d| d.subscribe_state())
    }

    pub fn running_tasks(&self) -> Vec<String> {
        self.inner.tasks.running()
    }

    fn websocket(&self, role: ConnectionRole) -> Option<Arc<WebsocketDriver>> {
        self.inner.websockets.lock().get(&role).cloned()
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(EngineError::NotRunning);
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // lifecycle
    // ---------------------------------------------------------------

    /// Fetch instruments, resolve symbols, validate every enabled request
    /// builder, then spawn the periodic, historical and WebSocket tasks.
    pub async fn start(&self) -> Result<(), EngineError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let cfg = self.inner.config.clone();
        info!(venue = %self.inner.adapter.name(), symbols = ?cfg.symbols, "engine starting");

        if cfg.fetch_instrument_information_at_start || cfg.wants_all_symbols() {
            let fetched = match self.inner.adapter.rest_fetch_instrument_information_request(&cfg) {
                Ok(builder) => self.inner.rest.send(builder, Duration::ZERO, cfg.rest_timeout).await.map(|_| ()),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = fetched {
                if e.is_contract_violation() {
                    self.inner.started.store(false, Ordering::SeqCst);
                    return Err(e);
                }
                warn!(error = %e, "instrument information fetch at start failed");
            }
        }
        self.resolve_symbols();

        let enabled = match self.validate(&cfg) {
            Ok(enabled) => enabled,
            Err(e) => {
                self.inner.started.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        self.spawn_periodic_tasks(&cfg, enabled);
        self.spawn_historical_fetches(&cfg);
        self.spawn_websockets(&cfg);

        for s in self.symbols() {
            metrics::CONFIG_SYMBOL.with_label_values(&[&s]).set(1);
        }
        info!(symbols = ?self.symbols(), tasks = ?self.running_tasks(), "engine started");
        Ok(())
    }

    /// Suppress reconnects, close sockets, cancel and await every task.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine stopping");
        self.inner.token.cancel();
        let drivers: Vec<Arc<WebsocketDriver>> = self.inner.websockets.lock().values().cloned().collect();
        for d in &drivers {
            d.close().await;
        }
        self.inner.tasks.shutdown().await;
        info!("engine stopped");
    }

    fn resolve_symbols(&self) {
        let cfg = &self.inner.config;
        if !cfg.wants_all_symbols() {
            return;
        }
        let mut resolved = self.inner.store.lock().tradable_symbols();
        for s in cfg.symbols.iter().filter(|s| s.as_str() != ALL_SYMBOLS) {
            if !resolved.contains(s) {
                resolved.push(s.clone());
            }
        }
        info!(count = resolved.len(), "resolved wildcard symbols");
        *self.inner.symbols.write() = resolved;
    }

    /// Build every enabled request once. Unimplemented hooks fail the start;
    /// unsupported features are switched off with a warning.
    fn validate(&self, cfg: &EngineConfig) -> Result<Enabled, EngineError> {
        let a = &*self.inner.adapter;
        let symbols = self.symbols();
        let probe = symbols.first().cloned().unwrap_or_default();

        let mut enabled = Enabled::default();
        if cfg.subscribe_bbo && cfg.fetch_bbo_period.is_some() {
            enabled.bbo = optional(a.rest_fetch_bbo_request(cfg, &symbols), "bbo")?;
        }
        if cfg.subscribe_position && cfg.fetch_position_period.is_some() {
            enabled.position = optional(a.rest_fetch_position_request(cfg), "position")?;
        }
        if cfg.subscribe_balance && cfg.fetch_balance_period.is_some() {
            enabled.balance = optional(a.rest_fetch_balance_request(cfg), "balance")?;
        }
        if cfg.subscribe_order {
            enabled.open_orders = optional(a.rest_fetch_open_orders_request(cfg, None), "open orders")?;
        }
        if cfg.fetch_historical_trade_at_start {
            a.rest_fetch_historical_trade_request(cfg, &probe)?;
        }
        if cfg.fetch_historical_ohlcv_at_start {
            a.rest_fetch_historical_ohlcv_request(cfg, &probe)?;
        }
        if cfg.fetch_historical_order_at_start {
            a.rest_fetch_historical_order_request(cfg, &probe)?;
        }
        if cfg.fetch_historical_fill_at_start {
            a.rest_fetch_historical_fill_request(cfg, &probe)?;
        }
        if cfg.subscribes_market_data() && a.websocket_url(cfg, ConnectionRole::MarketData).is_some() && !symbols.is_empty() {
            let chunk = &symbols[..symbols.len().min(cfg.websocket_market_data_channel_symbols_limit.max(1))];
            a.websocket_market_data_subscribe_request(cfg, chunk, String::new())?;
        }
        if cfg.subscribes_account() && a.websocket_url(cfg, ConnectionRole::Account).is_some() {
            a.websocket_login_request(cfg, ConnectionRole::Account, String::new(), Utc::now())?;
            a.websocket_account_subscribe_request(cfg, String::new(), Utc::now())?;
        }
        Ok(enabled)
    }

    // ---------------------------------------------------------------
    // task spawning
    // ---------------------------------------------------------------

    /// Run `job` every `period` until stop. Contract violations end the loop;
    /// any other error is logged and retried next tick.
    fn spawn_periodic<F, Fut>(&self, name: &str, period: Option<Duration>, skip_first: bool, job: F)
    where
        F: Fn(Engine) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let Some(period) = period.filter(|p| !p.is_zero()) else {
            return;
        };
        let engine = self.clone();
        let token = self.inner.token.clone();
        let task_name = format!("periodic:{name}");
        let label = task_name.clone();
        self.inner.tasks.spawn(task_name, async move {
            let first = if skip_first { Instant::now() + period } else { Instant::now() };
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match job(engine.clone()).await {
                    Ok(()) => {}
                    Err(e) if e.is_contract_violation() => {
                        error!(task = %label, error = %e, "adapter contract violated; task stopped");
                        break;
                    }
                    Err(e) => warn!(task = %label, error = %e, "periodic task failed"),
                }
            }
        });
    }

    fn spawn_periodic_tasks(&self, cfg: &EngineConfig, enabled: Enabled) {
        // already fetched once at start
        self.spawn_periodic(
            "fetch-instrument-information",
            cfg.fetch_instrument_information_period,
            true,
            |e| async move { e.fetch_instrument_information().await },
        );
        if enabled.bbo {
            self.spawn_periodic("fetch-bbo", cfg.fetch_bbo_period, false, |e| async move {
                e.fetch_bbo().await
            });
        }
        if enabled.position {
            self.spawn_periodic("fetch-position", cfg.fetch_position_period, false, |e| async move {
                e.fetch_position().await
            });
        }
        if enabled.balance {
            self.spawn_periodic("fetch-balance", cfg.fetch_balance_period, false, |e| async move {
                e.fetch_balance().await
            });
        }
        if cfg.subscribe_order {
            if enabled.open_orders {
                let engine = self.clone();
                self.inner.tasks.spawn("fetch-open-orders", async move {
                    if let Err(e) = engine.fetch_open_orders(None).await {
                        warn!(error = %e, "open orders fetch at start failed");
                    }
                });
            }
            self.spawn_periodic("check-open-order", cfg.check_open_order_period, true, |e| async move {
                e.check_open_order().await
            });
            self.spawn_periodic(
                "check-in-flight-order",
                cfg.check_in_flight_order_period,
                true,
                |e| async move { e.check_in_flight_order().await },
            );
        }

        if let (true, Some(keep)) = (cfg.subscribe_trade || cfg.fetch_historical_trade_at_start, cfg.keep_historical_trade) {
            self.spawn_periodic("prune-trade", cfg.prune_historical_trade_interval, true, move |e| async move {
                let removed = e.inner.store.lock().prune_trades(keep);
                debug!(removed, "pruned trades");
                Ok(())
            });
        }
        if let (true, Some(keep)) = (cfg.subscribe_ohlcv || cfg.fetch_historical_ohlcv_at_start, cfg.keep_historical_ohlcv) {
            self.spawn_periodic("prune-ohlcv", cfg.prune_historical_ohlcv_interval, true, move |e| async move {
                let removed = e.inner.store.lock().prune_ohlcvs(keep);
                debug!(removed, "pruned ohlcvs");
                Ok(())
            });
        }
        if let Some(keep) = cfg.keep_historical_order {
            self.spawn_periodic("prune-order", cfg.prune_historical_order_interval, true, move |e| async move {
                let removed = e.inner.store.lock().prune_orders(keep);
                debug!(removed, "pruned orders");
                Ok(())
            });
        }
        if let (true, Some(keep)) = (cfg.subscribe_fill || cfg.fetch_historical_fill_at_start, cfg.keep_historical_fill) {
            self.spawn_periodic("prune-fill", cfg.prune_historical_fill_interval, true, move |e| async move {
                let removed = e.inner.store.lock().prune_fills(keep);
                debug!(removed, "pruned fills");
                Ok(())
            });
        }
    }

    fn spawn_historical_fetches(&self, cfg: &EngineConfig) {
        let market = cfg.fetch_historical_trade_at_start || cfg.fetch_historical_ohlcv_at_start;
        let account = cfg.fetch_historical_order_at_start || cfg.fetch_historical_fill_at_start;
        if market {
            let engine = self.clone();
            self.inner.tasks.spawn("historical:market-data", async move {
                for symbol in engine.symbols() {
                    if engine.inner.config.fetch_historical_trade_at_start {
                        engine.historical_fetch("trade", &symbol, |a, c, s| a.rest_fetch_historical_trade_request(c, s)).await;
                    }
                    if engine.inner.config.fetch_historical_ohlcv_at_start {
                        engine.historical_fetch("ohlcv", &symbol, |a, c, s| a.rest_fetch_historical_ohlcv_request(c, s)).await;
                    }
                }
            });
        }
        if account {
            let engine = self.clone();
            self.inner.tasks.spawn("historical:account", async move {
                for symbol in engine.symbols() {
                    if engine.inner.config.fetch_historical_order_at_start {
                        engine.historical_fetch("order", &symbol, |a, c, s| a.rest_fetch_historical_order_request(c, s)).await;
                    }
                    if engine.inner.config.fetch_historical_fill_at_start {
                        engine.historical_fetch("fill", &symbol, |a, c, s| a.rest_fetch_historical_fill_request(c, s)).await;
                    }
                }
            });
        }
    }

    async fn historical_fetch<B>(&self, kind: &str, symbol: &str, build: B)
    where
        B: Fn(&dyn VenueAdapter, &EngineConfig, &str) -> Result<RequestBuilder, AdapterError>,
    {
        let cfg = &self.inner.config;
        let builder = match build(&*self.inner.adapter, cfg, symbol) {
            Ok(b) => b,
            Err(e) => {
                error!(kind, %symbol, error = %e, "historical request build failed");
                return;
            }
        };
        match self.inner.rest.send(builder, Duration::ZERO, cfg.rest_timeout).await {
            Ok(_) => info!(kind, %symbol, "historical fetch done"),
            Err(e) => warn!(kind, %symbol, error = %e, "historical fetch failed"),
        }
    }

    fn spawn_websockets(&self, cfg: &EngineConfig) {
        let symbols = self.symbols();
        let wanted = [
            (ConnectionRole::MarketData, cfg.subscribes_market_data() && !symbols.is_empty()),
            (ConnectionRole::Account, cfg.subscribes_account()),
            (ConnectionRole::Trade, cfg.trade_api_method_preference == ApiMethod::Websocket),
        ];
        let ctx = DriverContext {
            adapter: self.inner.adapter.clone(),
            connector: self.inner.connector.clone(),
            store: self.inner.store.clone(),
            config: self.inner.config.clone(),
            ids: self.inner.ids.clone(),
            backoff: self.inner.backoff.clone(),
            tasks: self.inner.tasks.clone(),
            token: self.inner.token.clone(),
        };
        for (role, want) in wanted {
            if !want {
                continue;
            }
            let Some(url) = self.inner.adapter.websocket_url(cfg, role) else {
                debug!(role = %role.as_str(), "venue has no websocket for role");
                continue;
            };
            let driver = Arc::new(WebsocketDriver::new(role, url, symbols.clone(), ctx.clone()));
            self.inner.websockets.lock().insert(role, driver.clone());
            self.inner.tasks.spawn(format!("ws:{}", role.as_str()), driver.run());
        }
    }

    // ---------------------------------------------------------------
    // REST jobs
    // ---------------------------------------------------------------

    async fn send_rest(&self, builder: RequestBuilder, delay: Duration) -> Result<(), EngineError> {
        self.inner
            .rest
            .send(builder, delay, self.inner.config.rest_timeout)
            .await
            .map(|_| ())
    }

    pub async fn fetch_instrument_information(&self) -> Result<(), EngineError> {
        let builder = self.inner.adapter.rest_fetch_instrument_information_request(&self.inner.config)?;
        self.send_rest(builder, Duration::ZERO).await
    }

    pub async fn fetch_bbo(&self) -> Result<(), EngineError> {
        let builder = self.inner.adapter.rest_fetch_bbo_request(&self.inner.config, &self.symbols())?;
        self.send_rest(builder, Duration::ZERO).await
    }

    pub async fn fetch_position(&self) -> Result<(), EngineError> {
        let builder = self.inner.adapter.rest_fetch_position_request(&self.inner.config)?;
        self.send_rest(builder, Duration::ZERO).await
    }

    pub async fn fetch_balance(&self) -> Result<(), EngineError> {
        let builder = self.inner.adapter.rest_fetch_balance_request(&self.inner.config)?;
        self.send_rest(builder, Duration::ZERO).await
    }

    pub async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<(), EngineError> {
        let builder = self.inner.adapter.rest_fetch_open_orders_request(&self.inner.config, symbol)?;
        self.send_rest(builder, Duration::ZERO).await
    }

    // ---------------------------------------------------------------
    // orders
    // ---------------------------------------------------------------

    fn trade_over_websocket(&self, method: Option<ApiMethod>) -> Option<Arc<WebsocketDriver>> {
        let preferred = method.unwrap_or(self.inner.config.trade_api_method_preference);
        if preferred != ApiMethod::Websocket {
            return None;
        }
        self.websocket(ConnectionRole::Trade)
            .filter(|d| d.state() == ConnectionState::LoggedIn)
    }

    /// Submit a new order. It is stored as CREATE_IN_FLIGHT before anything is
    /// sent and reconciled again when the venue answers. An empty client order
    /// id is generated. A frame the trade socket refuses is resent over REST.
    pub async fn create_order(&self, order: Order, method: Option<ApiMethod>) -> Result<Order, EngineError> {
        self.ensure_running()?;
        let now = Utc::now();
        let order = if order.client_order_id.is_empty() {
            order.with_client_order_id(self.inner.ids.next_client_order_id(now))
        } else {
            order
        };
        let cfg = &self.inner.config;

        if let Some(driver) = self.trade_over_websocket(method) {
            let order = order
                .clone()
                .with_status(OrderStatus::CreateInFlight)
                .with_api_method(ApiMethod::Websocket)
                .with_local_update_time_point(now);
            let id = self.inner.ids.next_websocket_request_id();
            let request = self
                .inner
                .adapter
                .websocket_create_order_request(cfg, &order, id, now)?
                .with_order(order.clone());
            let stored = self.inner.store.lock().upsert_order(order);
            metrics::ORDERS_SUBMITTED.with_label_values(&["create", "websocket"]).inc();
            info!(symbol = %stored.symbol, client_order_id = %stored.client_order_id, "create order via websocket");
            match driver.send(request).await {
                Ok(()) => return Ok(stored),
                Err(err) => {
                    warn!(symbol = %stored.symbol, client_order_id = %stored.client_order_id, error = %err, "websocket create failed, resending over rest");
                    self.inner
                        .store
                        .lock()
                        .set_order_api_method(&stored.symbol, &stored.client_order_id, ApiMethod::Rest);
                }
            }
        }

        let order = order
            .with_status(OrderStatus::CreateInFlight)
            .with_api_method(ApiMethod::Rest)
            .with_local_update_time_point(now);
        let builder = self.inner.adapter.rest_create_order_request(cfg, &order)?;
        let stored = self.inner.store.lock().upsert_order(order);
        metrics::ORDERS_SUBMITTED.with_label_values(&["create", "rest"]).inc();
        info!(symbol = %stored.symbol, client_order_id = %stored.client_order_id, "create order via rest");
        self.spawn_order_request(format!("create-order:{}", stored.client_order_id), builder);
        Ok(stored)
    }

    /// Request cancellation of a known order. Closed orders are returned as-is.
    pub async fn cancel_order(
        &self,
        symbol: &str,
        client_order_id: &str,
        method: Option<ApiMethod>,
    ) -> Result<Order, EngineError> {
        self.ensure_running()?;
        let stored = self
            .with_store(|s| s.order(symbol, client_order_id).cloned())
            .ok_or_else(|| EngineError::UnknownOrder {
                symbol: symbol.to_string(),
                client_order_id: client_order_id.to_string(),
            })?;
        if stored.is_closed() {
            debug!(%symbol, %client_order_id, status = %stored.status.as_str(), "cancel skipped, order closed");
            return Ok(stored);
        }
        let now = Utc::now();
        let cfg = &self.inner.config;
        let cancel = stored
            .with_status(OrderStatus::CancelInFlight)
            .with_local_update_time_point(now);

        if let Some(driver) = self.trade_over_websocket(method) {
            let id = self.inner.ids.next_websocket_request_id();
            let request = self
                .inner
                .adapter
                .websocket_cancel_order_request(cfg, &cancel, id, now)?
                .with_order(cancel.clone());
            let merged = self.inner.store.lock().upsert_order(cancel.clone());
            metrics::ORDERS_SUBMITTED.with_label_values(&["cancel", "websocket"]).inc();
            match driver.send(request).await {
                Ok(()) => return Ok(merged),
                Err(err) => {
                    warn!(%symbol, %client_order_id, error = %err, "websocket cancel failed, resending over rest");
                }
            }
        }

        let builder = self.inner.adapter.rest_cancel_order_request(cfg, &cancel)?;
        let merged = self.inner.store.lock().upsert_order(cancel);
        metrics::ORDERS_SUBMITTED.with_label_values(&["cancel", "rest"]).inc();
        self.spawn_order_request(format!("cancel-order:{client_order_id}"), builder);
        Ok(merged)
    }

    /// Cancel every open order that is not already in flight, optionally for one symbol.
    pub async fn cancel_orders(&self, symbol: Option<&str>, method: Option<ApiMethod>) -> Result<Vec<Order>, EngineError> {
        self.ensure_running()?;
        let targets: Vec<(String, String)> = self.with_store(|s| {
            s.orders()
                .filter(|o| o.is_open() && !o.is_in_flight())
                .filter(|o| symbol.map_or(true, |sym| o.symbol == sym))
                .map(|o| (o.symbol.clone(), o.client_order_id.clone()))
                .collect()
        });
        let mut out = Vec::with_capacity(targets.len());
        for (sym, cid) in targets {
            out.push(self.cancel_order(&sym, &cid, method).await?);
        }
        Ok(out)
    }

    /// REST fetch of one known order, reconciled into the store.
    pub async fn fetch_order(&self, symbol: &str, client_order_id: &str) -> Result<Order, EngineError> {
        self.fetch_order_after(symbol, client_order_id, Duration::ZERO).await
    }

    async fn fetch_order_after(&self, symbol: &str, client_order_id: &str, delay: Duration) -> Result<Order, EngineError> {
        let unknown = || EngineError::UnknownOrder {
            symbol: symbol.to_string(),
            client_order_id: client_order_id.to_string(),
        };
        let order = self
            .with_store(|s| s.order(symbol, client_order_id).cloned())
            .ok_or_else(unknown)?;
        let builder = self.inner.adapter.rest_fetch_order_request(&self.inner.config, &order)?;
        self.send_rest(builder, delay).await?;
        self.with_store(|s| s.order(symbol, client_order_id).cloned())
            .ok_or_else(unknown)
    }

    /// Re-fetch open orders with no activity for longer than the open-order threshold.
    pub async fn check_open_order(&self) -> Result<(), EngineError> {
        let threshold = self.inner.config.check_open_order_threshold;
        self.refetch_stale(|o| o.is_open(), threshold).await
    }

    /// Re-fetch in-flight orders whose create/cancel ack is overdue.
    pub async fn check_in_flight_order(&self) -> Result<(), EngineError> {
        let threshold = self.inner.config.check_in_flight_order_threshold;
        self.refetch_stale(|o| o.is_in_flight(), threshold).await
    }

    async fn refetch_stale(&self, select: impl Fn(&Order) -> bool, threshold: Duration) -> Result<(), EngineError> {
        let now = Utc::now();
        let threshold = chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let stale: Vec<(String, String)> = self.with_store(|s| {
            s.orders()
                .filter(|o| select(o))
                .filter(|o| o.last_activity().map_or(true, |t| now - t > threshold))
                .map(|o| (o.symbol.clone(), o.client_order_id.clone()))
                .collect()
        });
        let delay = self.inner.config.rest_account_request_delay;
        for (i, (symbol, cid)) in stale.into_iter().enumerate() {
            let pace = if i == 0 { Duration::ZERO } else { delay };
            match self.fetch_order_after(&symbol, &cid, pace).await {
                Ok(order) => debug!(%symbol, client_order_id = %cid, status = %order.status.as_str(), "stale order refreshed"),
                Err(e) if e.is_contract_violation() => return Err(e),
                Err(e) => warn!(%symbol, client_order_id = %cid, error = %e, "stale order refresh failed"),
            }
        }
        Ok(())
    }

    fn spawn_order_request(&self, name: String, builder: RequestBuilder) {
        let engine = self.clone();
        let label = name.clone();
        self.inner.tasks.spawn(name, async move {
            if let Err(e) = engine.send_rest(builder, Duration::ZERO).await {
                warn!(task = %label, error = %e, "order request failed");
            }
        });
    }
}

/// `Ok(false)` for features the venue does not support.
fn optional<T>(built: Result<T, AdapterError>, feature: &str) -> Result<bool, EngineError> {
    match built {
        Ok(_) => Ok(true),
        Err(AdapterError::Unsupported(what)) => {
            warn!(feature, what, "feature not supported by venue, disabled");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
