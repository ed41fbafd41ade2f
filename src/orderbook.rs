//! Per-symbol resting-order storage and price/time priority.
//!
//! Grounded on the teacher's `engine.rs`/`orderbook.rs` `BTreeMap`-keyed
//! order book. That book crosses two live sides against each other; this
//! simulator only has one side of live orders (the session's own), matched
//! against incoming market data, so there is no `match_buy`/`match_sell`
//! crossing step here — `MatchingEngine` (C6) drives fills by querying this
//! book for orders eligible against an incoming trade or quote. The
//! teacher's "invert the key for descending iteration" trick is reproduced
//! with `Reverse<Price>` instead of `u64::MAX - price`, since prices here
//! are `Decimal`-backed and don't have a natural bitwise inverse.

use crate::core_types::{Nanos, OrderId, Seq, Side, Symbol};
use crate::money::Price;
use rustc_hash::FxHashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    Stop,
    StopLimit,
    TrailingStop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    Day,
    Gtc,
    Ioc,
    Fok,
    Opg,
    Cls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientBuyingPower,
    ForbiddenShort,
    PositionCap,
    SingleOrderCap,
    RandomRejection,
    InvalidQuantity,
    InvalidSymbol,
    UnsupportedTif,
    /// A `Fok` order whose remaining quantity could not be fully covered by
    /// the first trade it became eligible to match against.
    FokUnfilled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub client_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub tif: TimeInForce,
    pub qty: u64,
    pub filled_qty: u64,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    /// `TrailingStop` reference, exactly one of which is set (spec §3).
    pub trail_price: Option<Price>,
    pub trail_percent: Option<Decimal>,
    /// Set once the stop/trailing-stop has printed through and converted to
    /// a live market/limit order.
    pub activated: bool,
    pub status: OrderStatus,
    pub reject_reason: Option<RejectReason>,
    pub created_ns: Nanos,
    pub updated_ns: Nanos,
    /// Visible to matching only once `now >= admission_ns` (spec §4.4).
    pub admission_ns: Nanos,
    pub avg_fill_price: Option<Price>,
    pub seq: Seq,
}

impl Order {
    pub fn remaining_qty(&self) -> u64 {
        self.qty - self.filled_qty
    }

    pub fn is_filled(&self) -> bool {
        self.filled_qty >= self.qty
    }

    pub fn is_resting(&self) -> bool {
        matches!(self.status, OrderStatus::Accepted | OrderStatus::PartiallyFilled)
    }
}

type BidKey = (Reverse<Price>, Nanos, Seq);
type AskKey = (Price, Nanos, Seq);

/// Resting orders for a single symbol. Buy-side limit/stop-limit orders
/// (waiting for the market to trade or quote down into them) are indexed by
/// descending price then ascending admission time then seq; sell-side the
/// mirror image — the same price/time priority spec §4.4's tie-break rule
/// requires.
#[derive(Default)]
pub struct OrderBook {
    orders: FxHashMap<OrderId, Order>,
    bids: BTreeMap<BidKey, OrderId>,
    asks: BTreeMap<AskKey, OrderId>,
    /// Stop/StopLimit/TrailingStop orders not yet activated, kept out of
    /// `bids`/`asks` until a trade prints through the stop.
    pending_stops: FxHashMap<OrderId, ()>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn key_of(order: &Order) -> Option<(bool, BidKey)> {
        let limit = order.limit_price?;
        Some((
            order.side == Side::Buy,
            (Reverse(limit), order.admission_ns, order.seq),
        ))
    }

    /// Inserts an order into the resting book (stops go to `pending_stops`
    /// until activated; market/limit go straight onto the priced side).
    pub fn insert(&mut self, order: Order) {
        let id = order.id;
        if matches!(order.kind, OrderKind::Stop | OrderKind::StopLimit | OrderKind::TrailingStop)
            && !order.activated
        {
            self.pending_stops.insert(id, ());
            self.orders.insert(id, order);
            return;
        }
        match (order.side, order.limit_price) {
            (Side::Buy, Some(limit)) => {
                self.bids.insert((Reverse(limit), order.admission_ns, order.seq), id);
            }
            (Side::Sell, Some(limit)) => {
                self.asks.insert((limit, order.admission_ns, order.seq), id);
            }
            (_, None) => {
                // Market orders fill immediately at admission and are never
                // rested; callers should not insert a fully-filled Market.
            }
        }
        self.orders.insert(id, order);
    }

    pub fn get(&self, id: OrderId) -> Option<&Order> {
        self.orders.get(&id)
    }

    pub fn get_mut(&mut self, id: OrderId) -> Option<&mut Order> {
        self.orders.get_mut(&id)
    }

    /// Removes an order from every index (used on fill-to-zero, cancel,
    /// expiry, or reject).
    pub fn remove(&mut self, id: OrderId) -> Option<Order> {
        let order = self.orders.remove(&id)?;
        self.pending_stops.remove(&id);
        if let Some((is_buy, key)) = Self::key_of(&order) {
            if is_buy {
                self.bids.remove(&key);
            } else {
                self.asks.remove(&key);
            }
        }
        Some(order)
    }

    /// Buy-side resting limit orders eligible against a sell-crossing price
    /// (a print or NBBO ask at or below their limit), in price/time
    /// priority.
    pub fn eligible_buys(&self, trade_price: Price) -> Vec<OrderId> {
        self.bids
            .iter()
            .take_while(|((Reverse(limit), _, _), _)| *limit >= trade_price)
            .map(|(_, id)| *id)
            .collect()
    }

    /// Sell-side resting limit orders eligible against a buy-crossing price.
    pub fn eligible_sells(&self, trade_price: Price) -> Vec<OrderId> {
        self.asks
            .iter()
            .take_while(|((limit, _, _), _)| *limit <= trade_price)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn pending_stop_ids(&self) -> Vec<OrderId> {
        self.pending_stops.keys().copied().collect()
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.bids.len(), self.asks.len())
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values()
    }

    /// Re-indexes an order already in `self.orders` after its price moved
    /// (trailing-stop update) or it activated (stop -> live). Callers must
    /// mutate the order via `get_mut`, then call this to fix the index.
    pub fn reindex(&mut self, id: OrderId) {
        if let Some(order) = self.orders.get(&id).cloned() {
            self.pending_stops.remove(&id);
            self.bids.retain(|_, v| *v != id);
            self.asks.retain(|_, v| *v != id);
            if order.is_resting() {
                self.insert(order);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn order(id: OrderId, side: Side, limit: i64, admission_ns: Nanos, seq: Seq) -> Order {
        Order {
            id,
            client_id: None,
            symbol: Symbol::new("AAPL"),
            side,
            kind: OrderKind::Limit,
            tif: TimeInForce::Day,
            qty: 10,
            filled_qty: 0,
            limit_price: Some(Price::new(Decimal::from(limit))),
            stop_price: None,
            trail_price: None,
            trail_percent: None,
            activated: true,
            status: OrderStatus::Accepted,
            reject_reason: None,
            created_ns: 0,
            updated_ns: 0,
            admission_ns,
            avg_fill_price: None,
            seq,
        }
    }

    #[test]
    fn buy_side_priority_is_price_then_time() {
        let mut book = OrderBook::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        book.insert(order(a, Side::Buy, 100, 10, 1));
        book.insert(order(b, Side::Buy, 101, 20, 2));
        let eligible = book.eligible_buys(Price::new(Decimal::from(100)));
        assert_eq!(eligible, vec![b, a]);
    }

    #[test]
    fn sell_side_priority_is_price_then_time() {
        let mut book = OrderBook::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        book.insert(order(a, Side::Sell, 102, 10, 1));
        book.insert(order(b, Side::Sell, 101, 20, 2));
        let eligible = book.eligible_sells(Price::new(Decimal::from(102)));
        assert_eq!(eligible, vec![b, a]);
    }

    #[test]
    fn remove_clears_all_indexes() {
        let mut book = OrderBook::new();
        let a = Uuid::new_v4();
        book.insert(order(a, Side::Buy, 100, 10, 1));
        assert!(book.remove(a).is_some());
        assert_eq!(book.depth(), (0, 0));
        assert!(book.get(a).is_none());
    }
}
