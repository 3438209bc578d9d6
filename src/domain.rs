// ===============================
// src/domain.rs
// ===============================
//
// Value entities mirrored from the venue. Records are never mutated in place
// once stored: updates go through the `with_*` constructors and the merge
// rules in `reconcile`.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

pub type TimePoint = DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Which API carried a create/cancel for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApiMethod {
    Rest,
    Websocket,
}

impl ApiMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMethod::Rest => "rest",
            ApiMethod::Websocket => "websocket",
        }
    }
}

/// Order lifecycle status. Ordering follows `rank()`, not declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    CreateInFlight,
    Open,
    PartiallyFilled,
    CancelInFlight,
    Canceled,
    Filled,
    Rejected,
}

impl OrderStatus {
    pub const fn rank(self) -> u8 {
        match self {
            OrderStatus::CreateInFlight => 0,
            OrderStatus::Open => 1,
            OrderStatus::PartiallyFilled => 2,
            OrderStatus::CancelInFlight => 3,
            OrderStatus::Canceled => 4,
            OrderStatus::Filled => 5,
            OrderStatus::Rejected => 6,
        }
    }

    pub fn is_in_flight(self) -> bool {
        matches!(self, OrderStatus::CreateInFlight | OrderStatus::CancelInFlight)
    }

    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Open | OrderStatus::PartiallyFilled)
    }

    pub fn is_closed(self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled | OrderStatus::Filled | OrderStatus::Rejected
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::CreateInFlight => "create_in_flight",
            OrderStatus::Open => "open",
            OrderStatus::PartiallyFilled => "partially_filled",
            OrderStatus::CancelInFlight => "cancel_in_flight",
            OrderStatus::Canceled => "canceled",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected => "rejected",
        }
    }
}

impl PartialOrd for OrderStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentInformation {
    pub symbol: String,
    pub base_asset: Option<String>,
    pub quote_asset: Option<String>,
    pub order_price_increment: Option<Decimal>,
    pub order_quantity_increment: Option<Decimal>,
    pub order_quantity_min: Option<Decimal>,
    pub is_tradable: bool,
}

impl InstrumentInformation {
    pub fn new(symbol: impl Into<String>, is_tradable: bool) -> Self {
        Self {
            symbol: symbol.into(),
            base_asset: None,
            quote_asset: None,
            order_price_increment: None,
            order_quantity_increment: None,
            order_quantity_min: None,
            is_tradable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bbo {
    pub symbol: String,
    pub exchange_update_time_point: Option<TimePoint>,
    pub best_bid_price: Option<Decimal>,
    pub best_bid_size: Option<Decimal>,
    pub best_ask_price: Option<Decimal>,
    pub best_ask_size: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub exchange_update_time_point: TimePoint,
    pub trade_id: u64,
    pub price: Decimal,
    pub size: Decimal,
    /// Aggressor side, when the venue reports it.
    pub side: Option<Side>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ohlcv {
    pub symbol: String,
    pub start_time_point: TimePoint,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub symbol: String,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub side: Side,
    pub price: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub is_post_only: bool,
    pub is_fok: bool,
    pub is_ioc: bool,
    pub is_reduce_only: bool,
    pub cumulative_filled_quantity: Option<Decimal>,
    pub cumulative_filled_quote_quantity: Option<Decimal>,
    pub exchange_create_time_point: Option<TimePoint>,
    pub exchange_update_time_point: Option<TimePoint>,
    /// Last local mutation (create/cancel submitted by this process).
    pub local_update_time_point: Option<TimePoint>,
    pub status: OrderStatus,
    pub api_method: Option<ApiMethod>,
}

impl Order {
    /// A fresh limit order; the client order id is assigned on submit when left empty.
    pub fn limit(symbol: impl Into<String>, side: Side, price: Decimal, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            client_order_id: String::new(),
            order_id: None,
            side,
            price: Some(price),
            quantity: Some(quantity),
            is_post_only: false,
            is_fok: false,
            is_ioc: false,
            is_reduce_only: false,
            cumulative_filled_quantity: None,
            cumulative_filled_quote_quantity: None,
            exchange_create_time_point: None,
            exchange_update_time_point: None,
            local_update_time_point: None,
            status: OrderStatus::CreateInFlight,
            api_method: None,
        }
    }

    /// A venue-side view of an order identified by its client order id.
    pub fn update(
        symbol: impl Into<String>,
        client_order_id: impl Into<String>,
        side: Side,
        status: OrderStatus,
    ) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            price: None,
            quantity: None,
            status,
            ..Self::limit(symbol, side, Decimal::ZERO, Decimal::ZERO)
        }
    }

    pub fn with_client_order_id(self, client_order_id: impl Into<String>) -> Self {
        Self {
            client_order_id: client_order_id.into(),
            ..self
        }
    }

    pub fn with_order_id(self, order_id: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            ..self
        }
    }

    pub fn with_status(self, status: OrderStatus) -> Self {
        Self { status, ..self }
    }

    pub fn with_api_method(self, api_method: ApiMethod) -> Self {
        Self {
            api_method: Some(api_method),
            ..self
        }
    }

    pub fn with_cumulative_filled_quantity(self, quantity: Decimal) -> Self {
        Self {
            cumulative_filled_quantity: Some(quantity),
            ..self
        }
    }

    pub fn with_exchange_update_time_point(self, time_point: TimePoint) -> Self {
        Self {
            exchange_update_time_point: Some(time_point),
            ..self
        }
    }

    pub fn with_local_update_time_point(self, time_point: TimePoint) -> Self {
        Self {
            local_update_time_point: Some(time_point),
            ..self
        }
    }

    pub fn with_flags(self, post_only: bool, fok: bool, ioc: bool, reduce_only: bool) -> Self {
        Self {
            is_post_only: post_only,
            is_fok: fok,
            is_ioc: ioc,
            is_reduce_only: reduce_only,
            ..self
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.status.is_in_flight()
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status.is_closed()
    }

    /// Latest known activity, venue time preferred.
    pub fn last_activity(&self) -> Option<TimePoint> {
        match (self.exchange_update_time_point, self.local_update_time_point) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub exchange_update_time_point: TimePoint,
    pub trade_id: u64,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub price: Decimal,
    pub size: Decimal,
    pub side: Option<Side>,
    pub is_maker: Option<bool>,
    pub fee_asset: Option<String>,
    pub fee_quantity: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub exchange_update_time_point: Option<TimePoint>,
    /// Signed: negative is short.
    pub quantity: Decimal,
    pub entry_price: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub exchange_update_time_point: Option<TimePoint>,
    pub quantity: Decimal,
}

/// Records kept as an ordered per-symbol series.
pub trait Sequenced {
    type Key: Ord + Copy + std::fmt::Debug;

    /// A stored tail record with an equal key may be replaced by a newer revision.
    const REVISABLE_TAIL: bool = false;

    fn symbol(&self) -> &str;
    fn sequence_key(&self) -> Self::Key;
    fn time_point(&self) -> TimePoint;
}

impl Sequenced for Trade {
    type Key = (TimePoint, u64);

    fn symbol(&self) -> &str {
        &self.symbol
    }
    fn sequence_key(&self) -> Self::Key {
        (self.exchange_update_time_point, self.trade_id)
    }
    fn time_point(&self) -> TimePoint {
        self.exchange_update_time_point
    }
}

impl Sequenced for Fill {
    type Key = (TimePoint, u64);

    fn symbol(&self) -> &str {
        &self.symbol
    }
    fn sequence_key(&self) -> Self::Key {
        (self.exchange_update_time_point, self.trade_id)
    }
    fn time_point(&self) -> TimePoint {
        self.exchange_update_time_point
    }
}

impl Sequenced for Ohlcv {
    type Key = TimePoint;
    const REVISABLE_TAIL: bool = true;

    fn symbol(&self) -> &str {
        &self.symbol
    }
    fn sequence_key(&self) -> Self::Key {
        self.start_time_point
    }
    fn time_point(&self) -> TimePoint {
        self.start_time_point
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn status_order_follows_rank() {
        let mut statuses = vec![
            OrderStatus::Rejected,
            OrderStatus::Open,
            OrderStatus::Filled,
            OrderStatus::CreateInFlight,
            OrderStatus::Canceled,
            OrderStatus::CancelInFlight,
            OrderStatus::PartiallyFilled,
        ];
        statuses.sort();
        assert_eq!(
            statuses,
            vec![
                OrderStatus::CreateInFlight,
                OrderStatus::Open,
                OrderStatus::PartiallyFilled,
                OrderStatus::CancelInFlight,
                OrderStatus::Canceled,
                OrderStatus::Filled,
                OrderStatus::Rejected,
            ]
        );
        assert!(OrderStatus::CancelInFlight > OrderStatus::PartiallyFilled);
    }

    #[test]
    fn status_predicates_partition() {
        for s in [
            OrderStatus::CreateInFlight,
            OrderStatus::Open,
            OrderStatus::PartiallyFilled,
            OrderStatus::CancelInFlight,
            OrderStatus::Canceled,
            OrderStatus::Filled,
            OrderStatus::Rejected,
        ] {
            let hits = [s.is_in_flight(), s.is_open(), s.is_closed()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(hits, 1, "{s:?}");
        }
    }

    #[test]
    fn with_status_leaves_other_fields() {
        let o = Order::limit("BTCUSDT", Side::Buy, dec!(100), dec!(2)).with_client_order_id("c1");
        let o2 = o.clone().with_status(OrderStatus::Open);
        assert_eq!(o2.status, OrderStatus::Open);
        assert_eq!(o2.client_order_id, "c1");
        assert_eq!(o2.price, o.price);
        assert_eq!(o.status, OrderStatus::CreateInFlight);
    }
}
