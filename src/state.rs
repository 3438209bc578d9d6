// ===============================
// src/state.rs
// ===============================
//
// In-memory mirror of venue state. Every mutation goes through a method that
// applies the `reconcile` rules, so readers never see an unsorted series or a
// regressed order.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

use crate::domain::{
    ApiMethod, Balance, Bbo, Fill, InstrumentInformation, Ohlcv, Order, Position, TimePoint, Trade,
};
use crate::reconcile;

pub type SharedStore = Arc<Mutex<StateStore>>;

#[derive(Debug, Default, Clone)]
pub struct StateStore {
    instrument_information: HashMap<String, InstrumentInformation>,
    bbos: HashMap<String, Bbo>,
    trades: HashMap<String, Vec<Trade>>,
    ohlcvs: HashMap<String, Vec<Ohlcv>>,
    orders: HashMap<String, HashMap<String, Order>>,
    fills: HashMap<String, Vec<Fill>>,
    positions: HashMap<String, Position>,
    balances: HashMap<String, Balance>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedStore {
        Arc::new(Mutex::new(Self::new()))
    }

    // ---- readers ----

    pub fn instrument_information(&self) -> &HashMap<String, InstrumentInformation> {
        &self.instrument_information
    }

    pub fn instrument(&self, symbol: &str) -> Option<&InstrumentInformation> {
        self.instrument_information.get(symbol)
    }

    pub fn tradable_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .instrument_information
            .values()
            .filter(|i| i.is_tradable)
            .map(|i| i.symbol.clone())
            .collect();
        out.sort();
        out
    }

    pub fn bbo(&self, symbol: &str) -> Option<&Bbo> {
        self.bbos.get(symbol)
    }

    pub fn trades(&self, symbol: &str) -> &[Trade] {
        self.trades.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ohlcvs(&self, symbol: &str) -> &[Ohlcv] {
        self.ohlcvs.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn fills(&self, symbol: &str) -> &[Fill] {
        self.fills.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn order(&self, symbol: &str, client_order_id: &str) -> Option<&Order> {
        self.orders.get(symbol).and_then(|m| m.get(client_order_id))
    }

    pub fn orders_for(&self, symbol: &str) -> impl Iterator<Item = &Order> {
        self.orders.get(symbol).into_iter().flat_map(|m| m.values())
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().flat_map(|m| m.values())
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn balance(&self, asset: &str) -> Option<&Balance> {
        self.balances.get(asset)
    }

    pub fn balances(&self) -> &HashMap<String, Balance> {
        &self.balances
    }

    // ---- writers ----

    /// Full snapshot: replaces whatever was there.
    pub fn replace_instrument_information(&mut self, list: Vec<InstrumentInformation>) {
        self.instrument_information = list
            .into_iter()
            .map(|i| (i.symbol.clone(), i))
            .collect();
    }

    pub fn update_bbo(&mut self, bbo: Bbo) -> bool {
        match self.bbos.get(&bbo.symbol) {
            Some(stored) if !reconcile::should_replace_bbo(stored, &bbo) => false,
            _ => {
                self.bbos.insert(bbo.symbol.clone(), bbo);
                true
            }
        }
    }

    pub fn backfill_trades(&mut self, batch: Vec<Trade>) -> usize {
        reconcile::backfill_series(&mut self.trades, batch)
    }

    pub fn append_trades(&mut self, batch: Vec<Trade>) -> usize {
        reconcile::append_series(&mut self.trades, batch)
    }

    pub fn backfill_ohlcvs(&mut self, batch: Vec<Ohlcv>) -> usize {
        reconcile::backfill_series(&mut self.ohlcvs, batch)
    }

    pub fn append_ohlcvs(&mut self, batch: Vec<Ohlcv>) -> usize {
        reconcile::append_series(&mut self.ohlcvs, batch)
    }

    pub fn backfill_fills(&mut self, batch: Vec<Fill>) -> usize {
        reconcile::backfill_series(&mut self.fills, batch)
    }

    pub fn append_fills(&mut self, batch: Vec<Fill>) -> usize {
        reconcile::append_series(&mut self.fills, batch)
    }

    /// Insert verbatim when unknown, otherwise merge. Returns the stored result.
    pub fn upsert_order(&mut self, incoming: Order) -> Order {
        let by_id = self.orders.entry(incoming.symbol.clone()).or_default();
        let merged = match by_id.get(&incoming.client_order_id) {
            Some(stored) => reconcile::merge_order(stored, &incoming),
            None => incoming,
        };
        by_id.insert(merged.client_order_id.clone(), merged.clone());
        merged
    }

    /// Re-route a stored order. Merges never change the api method, so a
    /// resubmission over the other transport goes through here.
    pub fn set_order_api_method(&mut self, symbol: &str, client_order_id: &str, method: ApiMethod) -> Option<Order> {
        let order = self.orders.get_mut(symbol)?.get_mut(client_order_id)?;
        order.api_method = Some(method);
        Some(order.clone())
    }

    /// REST snapshot: zero entries dropped, absent symbols removed.
    pub fn replace_positions(&mut self, snapshot: Vec<Position>) {
        let mut next = HashMap::new();
        for p in snapshot.into_iter().filter(|p| !p.quantity.is_zero()) {
            let keep = match self.positions.get(&p.symbol) {
                Some(stored) => newer_or_equal(stored.exchange_update_time_point, p.exchange_update_time_point),
                None => true,
            };
            let p = if keep {
                p
            } else {
                self.positions.get(&p.symbol).cloned().unwrap_or(p)
            };
            next.insert(p.symbol.clone(), p);
        }
        self.positions = next;
    }

    /// Push update: latest wins, zero removes.
    pub fn update_position(&mut self, position: Position) {
        if let Some(stored) = self.positions.get(&position.symbol) {
            if !newer_or_equal(stored.exchange_update_time_point, position.exchange_update_time_point) {
                return;
            }
        }
        if position.quantity.is_zero() {
            self.positions.remove(&position.symbol);
        } else {
            self.positions.insert(position.symbol.clone(), position);
        }
    }

    pub fn replace_balances(&mut self, snapshot: Vec<Balance>) {
        let mut next = HashMap::new();
        for b in snapshot.into_iter().filter(|b| !b.quantity.is_zero()) {
            let keep = match self.balances.get(&b.asset) {
                Some(stored) => newer_or_equal(stored.exchange_update_time_point, b.exchange_update_time_point),
                None => true,
            };
            let b = if keep {
                b
            } else {
                self.balances.get(&b.asset).cloned().unwrap_or(b)
            };
            next.insert(b.asset.clone(), b);
        }
        self.balances = next;
    }

    pub fn update_balance(&mut self, balance: Balance) {
        if let Some(stored) = self.balances.get(&balance.asset) {
            if !newer_or_equal(stored.exchange_update_time_point, balance.exchange_update_time_point) {
                return;
            }
        }
        if balance.quantity.is_zero() {
            self.balances.remove(&balance.asset);
        } else {
            self.balances.insert(balance.asset.clone(), balance);
        }
    }

    // ---- pruning ----

    pub fn prune_trades(&mut self, window: Duration) -> usize {
        self.trades
            .values_mut()
            .map(|v| reconcile::prune_series(v, window))
            .sum()
    }

    pub fn prune_ohlcvs(&mut self, window: Duration) -> usize {
        self.ohlcvs
            .values_mut()
            .map(|v| reconcile::prune_series(v, window))
            .sum()
    }

    pub fn prune_fills(&mut self, window: Duration) -> usize {
        self.fills
            .values_mut()
            .map(|v| reconcile::prune_series(v, window))
            .sum()
    }

    /// Drops closed orders last updated before (newest update for the symbol - window).
    /// Open and in-flight orders are never pruned.
    pub fn prune_orders(&mut self, window: Duration) -> usize {
        let mut removed = 0;
        for by_id in self.orders.values_mut() {
            let Some(cutoff) = by_id
                .values()
                .filter_map(|o| o.exchange_update_time_point)
                .max()
                .and_then(|latest| reconcile::retention_cutoff(latest, window))
            else {
                continue;
            };
            let before = by_id.len();
            by_id.retain(|_, o| {
                !(o.is_closed() && o.exchange_update_time_point.map_or(false, |t| t < cutoff))
            });
            removed += before - by_id.len();
        }
        self.orders.retain(|_, by_id| !by_id.is_empty());
        removed
    }

    /// Entry counts per map, for metrics and summaries.
    pub fn sizes(&self) -> StoreSizes {
        StoreSizes {
            instruments: self.instrument_information.len(),
            bbos: self.bbos.len(),
            trades: self.trades.values().map(Vec::len).sum(),
            ohlcvs: self.ohlcvs.values().map(Vec::len).sum(),
            orders: self.orders.values().map(|m| m.len()).sum(),
            fills: self.fills.values().map(Vec::len).sum(),
            positions: self.positions.len(),
            balances: self.balances.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSizes {
    pub instruments: usize,
    pub bbos: usize,
    pub trades: usize,
    pub ohlcvs: usize,
    pub orders: usize,
    pub fills: usize,
    pub positions: usize,
    pub balances: usize,
}

fn newer_or_equal(stored: Option<TimePoint>, incoming: Option<TimePoint>) -> bool {
    match (stored, incoming) {
        (Some(s), Some(i)) => i >= s,
        _ => true,
    }
}
