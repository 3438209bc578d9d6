// ===============================
// src/ws.rs
// ===============================
//
// One logical WebSocket connection per role:
//
//   DISCONNECTED -> CONNECTING -> CONNECTED -> (login ack) LOGGED_IN
//   any --socket closed / silent too long--> DISCONNECTED -> backoff -> CONNECTING
//   any --stop--> DISCONNECTED (terminal)
//
// The outstanding-request table is private to the driver and cleared on every
// disconnect.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::adapter::VenueAdapter;
use crate::backoff::ReconnectBackoff;
use crate::config::EngineConfig;
use crate::envelope::{ConnectionRole, WebsocketMessage, WebsocketRequest};
use crate::error::{EngineError, TransportError};
use crate::ids::IdGenerator;
use crate::metrics;
use crate::state::SharedStore;
use crate::tasks::TaskGroup;
use crate::transport::{tick, Outbound, WebsocketConnector, WebsocketSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    LoggedIn,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::LoggedIn => "logged_in",
        }
    }

    fn gauge(&self) -> i64 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::LoggedIn => 3,
        }
    }
}

/// Everything a driver shares with the engine.
#[derive(Clone)]
pub struct DriverContext {
    pub adapter: Arc<dyn VenueAdapter>,
    pub connector: Arc<dyn WebsocketConnector>,
    pub store: SharedStore,
    pub config: Arc<EngineConfig>,
    pub ids: Arc<IdGenerator>,
    pub backoff: Arc<ReconnectBackoff>,
    pub tasks: Arc<TaskGroup>,
    pub token: CancellationToken,
}

pub struct WebsocketDriver {
    role: ConnectionRole,
    url: String,
    symbols: Vec<String>,
    ctx: DriverContext,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    outstanding: Mutex<HashMap<String, WebsocketRequest>>,
    last_receive: Mutex<Instant>,
}

enum SessionEnd {
    Closed,
    Silent,
    Stopped,
}

impl WebsocketDriver {
    pub fn new(role: ConnectionRole, url: String, symbols: Vec<String>, ctx: DriverContext) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            role,
            url,
            symbols,
            ctx,
            state,
            outbound: Mutex::new(None),
            outstanding: Mutex::new(HashMap::new()),
            last_receive: Mutex::new(Instant::now()),
        }
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.lock().len()
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(role = %self.role.as_str(), from = %prev.as_str(), to = %next.as_str(), "connection state");
        }
        metrics::WS_CONNECTION_STATE
            .with_label_values(&[self.role.as_str()])
            .set(next.gauge());
    }

    fn backoff_reset_task(&self) -> String {
        format!("backoff-reset:{}", self.url)
    }

    /// Connect/reconnect loop; returns on stop, when auto-reconnect is off, or
    /// on an adapter contract violation.
    pub async fn run(self: Arc<Self>) {
        let token = self.ctx.token.clone();
        let cfg = self.ctx.config.clone();
        loop {
            if token.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Connecting);
            info!(role = %self.role.as_str(), url = %self.url, "connecting");

            let connected = tokio::select! {
                _ = token.cancelled() => break,
                r = self.ctx.connector.connect(&self.url, cfg.websocket_protocol_heartbeat_period) => r,
            };

            let mut fatal = false;
            match connected {
                Ok(session) => match self.run_session(session).await {
                    Ok(SessionEnd::Stopped) => {
                        self.on_disconnect();
                        break;
                    }
                    Ok(SessionEnd::Closed) => info!(role = %self.role.as_str(), "disconnected"),
                    Ok(SessionEnd::Silent) => {
                        warn!(role = %self.role.as_str(), "no message within heartbeat timeout, socket force-closed")
                    }
                    Err(e) if e.is_contract_violation() => {
                        error!(role = %self.role.as_str(), error = %e, "adapter contract violated; connection abandoned");
                        fatal = true;
                    }
                    Err(e) => warn!(role = %self.role.as_str(), error = %e, "session ended with error"),
                },
                Err(e) => error!(role = %self.role.as_str(), url = %self.url, error = %e, "connect failed"),
            }
            self.on_disconnect();

            if fatal || token.is_cancelled() || !cfg.websocket_auto_reconnect {
                break;
            }

            let delay = self.ctx.backoff.next_delay(&self.url);
            metrics::WS_RECONNECTS
                .with_label_values(&[self.role.as_str()])
                .inc();
            warn!(role = %self.role.as_str(), ?delay, "reconnecting after backoff");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(&self, session: WebsocketSession) -> Result<SessionEnd, EngineError> {
        let WebsocketSession { sender, mut receiver } = session;
        let cfg = self.ctx.config.clone();
        *self.outbound.lock() = Some(sender);
        *self.last_receive.lock() = Instant::now();
        self.set_state(ConnectionState::Connected);
        info!(role = %self.role.as_str(), url = %self.url, "connected");

        let mut heartbeat = cfg
            .websocket_application_heartbeat_period
            .filter(|p| !p.is_zero())
            .map(|p| {
                let mut i = interval_at(Instant::now() + p, p);
                i.set_missed_tick_behavior(MissedTickBehavior::Delay);
                i
            });
        let timeout = cfg.websocket_application_heartbeat_timeout.filter(|t| !t.is_zero());
        let mut liveness = timeout.map(|_| {
            let period = cfg.websocket_liveness_check_period.max(Duration::from_millis(1));
            let mut i = interval(period);
            i.set_missed_tick_behavior(MissedTickBehavior::Delay);
            i
        });

        let token = self.ctx.token.clone();
        if let Err(e) = self.after_connect().await {
            self.close_socket().await;
            return Err(e);
        }

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.close_socket().await;
                    return Ok(SessionEnd::Stopped);
                }
                frame = receiver.recv() => match frame {
                    Some(text) => {
                        *self.last_receive.lock() = Instant::now();
                        metrics::WS_MESSAGES.with_label_values(&[self.role.as_str()]).inc();
                        self.handle_message(text).await?;
                    }
                    None => return Ok(SessionEnd::Closed),
                },
                _ = tick(&mut heartbeat) => {
                    let id = self.ctx.ids.next_websocket_request_id();
                    if let Some(ping) = self.ctx.adapter.websocket_ping_request(self.role, id) {
                        if let Err(e) = self.send(ping).await {
                            warn!(role = %self.role.as_str(), error = %e, "heartbeat send failed");
                        }
                    }
                }
                _ = tick(&mut liveness) => {
                    let silent_for = self.last_receive.lock().elapsed();
                    if timeout.map_or(false, |t| silent_for > t) {
                        self.close_socket().await;
                        return Ok(SessionEnd::Silent);
                    }
                }
            }
        }
    }

    /// Register in the outstanding table and write. Empty payloads are skipped.
    pub async fn send(&self, request: WebsocketRequest) -> Result<(), EngineError> {
        if request.payload.is_empty() {
            return Ok(());
        }
        let sender = self
            .outbound
            .lock()
            .clone()
            .ok_or(EngineError::Transport(TransportError::Closed))?;
        trace!(role = %self.role.as_str(), id = %request.id, payload = %request.payload, "ws send");
        let payload = request.payload.clone();
        let id = request.id.clone();
        self.outstanding.lock().insert(id.clone(), request);
        if sender.send(Outbound::Text(payload)).await.is_err() {
            self.outstanding.lock().remove(&id);
            return Err(EngineError::Transport(TransportError::Closed));
        }
        Ok(())
    }

    async fn close_socket(&self) {
        let sender = self.outbound.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(Outbound::Close).await;
        }
    }

    /// Close the socket and mark the connection down. Used on stop, after the
    /// shared token is cancelled, so nothing reconnects.
    pub async fn close(&self) {
        self.close_socket().await;
        self.on_disconnect();
    }

    fn on_disconnect(&self) {
        self.ctx.tasks.cancel(&self.backoff_reset_task());
        self.outstanding.lock().clear();
        *self.outbound.lock() = None;
        self.set_state(ConnectionState::Disconnected);
    }

    async fn after_connect(&self) -> Result<(), EngineError> {
        let cfg = self.ctx.config.clone();
        let adapter = self.ctx.adapter.clone();
        match self.role {
            ConnectionRole::MarketData => {
                let limit = cfg.websocket_market_data_channel_symbols_limit.max(1);
                for (i, chunk) in self.symbols.chunks(limit).enumerate() {
                    if i > 0 && !cfg.websocket_market_data_subscribe_delay.is_zero() {
                        sleep(cfg.websocket_market_data_subscribe_delay).await;
                    }
                    let id = self.ctx.ids.next_websocket_request_id();
                    let request = adapter.websocket_market_data_subscribe_request(&cfg, chunk, id)?;
                    self.send(request).await?;
                }
                Ok(())
            }
            ConnectionRole::Account | ConnectionRole::Trade => {
                let id = self.ctx.ids.next_websocket_request_id();
                match adapter.websocket_login_request(&cfg, self.role, id, Utc::now())? {
                    Some(request) => self.send(request).await,
                    None => {
                        self.on_ack();
                        self.on_logged_in().await
                    }
                }
            }
        }
    }

    async fn on_logged_in(&self) -> Result<(), EngineError> {
        self.set_state(ConnectionState::LoggedIn);
        info!(role = %self.role.as_str(), "logged in");
        if self.role == ConnectionRole::Account {
            let id = self.ctx.ids.next_websocket_request_id();
            let cfg = self.ctx.config.clone();
            if let Some(request) = self
                .ctx
                .adapter
                .websocket_account_subscribe_request(&cfg, id, Utc::now())?
            {
                self.send(request).await?;
            }
        }
        Ok(())
    }

    /// Successful subscribe/login: forget the backoff once the connection has
    /// stayed up for `reset_after`.
    fn on_ack(&self) {
        let backoff = self.ctx.backoff.clone();
        let key = self.url.clone();
        let after = backoff.policy().reset_after;
        self.ctx.tasks.spawn(self.backoff_reset_task(), async move {
            sleep(after).await;
            backoff.reset(&key);
            debug!(url = %key, "reconnect backoff reset");
        });
    }

    /// Contract violations propagate (the session ends); anything else is logged.
    async fn handle_message(&self, text: String) -> Result<(), EngineError> {
        let mut message = WebsocketMessage::new(self.role, self.url.clone(), text);
        message.request_id = self.ctx.adapter.extract_websocket_request_id(&message);
        if let Some(id) = &message.request_id {
            message.request = self.outstanding.lock().remove(id);
        }

        let routed = match message.request_id {
            None => self.route_push(&message),
            Some(_) => self.route_response(&message).await,
        };
        match routed {
            Err(e) if e.is_contract_violation() => Err(e),
            Err(e) => {
                warn!(role = %self.role.as_str(), error = %e, payload = %message.payload, "ws message dropped");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn route_push(&self, m: &WebsocketMessage) -> Result<(), EngineError> {
        let a = &*self.ctx.adapter;
        if a.is_websocket_push_for_bbo(m) {
            let bbos = a.convert_websocket_push_for_bbo(m.json_payload()?)?;
            let mut store = self.ctx.store.lock();
            for bbo in bbos {
                store.update_bbo(bbo);
            }
        } else if a.is_websocket_push_for_trade(m) {
            let trades = a.convert_websocket_push_for_trade(m.json_payload()?)?;
            self.ctx.store.lock().append_trades(trades);
        } else if a.is_websocket_push_for_ohlcv(m) {
            let ohlcvs = a.convert_websocket_push_for_ohlcv(m.json_payload()?)?;
            self.ctx.store.lock().append_ohlcvs(ohlcvs);
        } else if a.is_websocket_push_for_order(m) {
            let orders = a.convert_websocket_push_for_order(m.json_payload()?)?;
            let mut store = self.ctx.store.lock();
            for order in orders {
                store.upsert_order(order);
            }
        } else if a.is_websocket_push_for_fill(m) {
            let fills = a.convert_websocket_push_for_fill(m.json_payload()?)?;
            self.ctx.store.lock().append_fills(fills);
        } else if a.is_websocket_push_for_position(m) {
            let positions = a.convert_websocket_push_for_position(m.json_payload()?)?;
            let mut store = self.ctx.store.lock();
            for p in positions {
                store.update_position(p);
            }
        } else if a.is_websocket_push_for_balance(m) {
            let balances = a.convert_websocket_push_for_balance(m.json_payload()?)?;
            let mut store = self.ctx.store.lock();
            for b in balances {
                store.update_balance(b);
            }
        } else {
            trace!(role = %self.role.as_str(), payload = %m.payload, "unrouted push");
        }
        Ok(())
    }

    async fn route_response(&self, m: &WebsocketMessage) -> Result<(), EngineError> {
        let a = &*self.ctx.adapter;
        if !a.is_websocket_response_success(m) {
            let orders = a.handle_websocket_response_error(m);
            let mut store = self.ctx.store.lock();
            for order in orders {
                store.upsert_order(order);
            }
            return Ok(());
        }

        if a.is_websocket_response_for_create_order(m) {
            let order = a.convert_websocket_response_for_create_order(m.json_payload()?, m.request.as_ref())?;
            self.ctx.store.lock().upsert_order(order);
        } else if a.is_websocket_response_for_cancel_order(m) {
            let order = a.convert_websocket_response_for_cancel_order(m.json_payload()?, m.request.as_ref())?;
            self.ctx.store.lock().upsert_order(order);
        } else if a.is_websocket_response_for_subscribe(m) {
            debug!(role = %self.role.as_str(), id = ?m.request_id, "subscribed");
            self.on_ack();
        } else if a.is_websocket_response_for_login(m) {
            self.on_ack();
            self.on_logged_in().await?;
        } else {
            trace!(role = %self.role.as_str(), id = ?m.request_id, "unrouted response");
        }
        Ok(())
    }
}
