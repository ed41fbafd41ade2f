//! MatchingEngine (C6): admission, matching, and the cost model.
//!
//! The resting-order storage and price/time priority come from
//! `orderbook::OrderBook` (grounded on the teacher's `engine.rs`); admission
//! and the cascaded cost model are new code in the teacher's idiom, grounded
//! on `fee.rs`'s "checked intermediate, rate-table lookup" shape, generalized
//! from a single maker/taker rate pair to the full slippage/impact/fee
//! cascade spec §4.4 requires. Latency and slippage jitter must be pure
//! functions of their inputs (spec §4.6: "matching and cost models are pure
//! functions of their inputs, so replay reproduces fills"), so jitter is
//! drawn from a `StdRng` seeded deterministically from `(order_id, seq)`
//! rather than a single mutable RNG stream advanced once per call.

use crate::config::FeeTable;
use crate::config::SessionConfig;
use crate::core_types::{Nanos, OrderId, Seq, Side, Symbol};
use crate::money::{Fee, Price};
use crate::orderbook::{Order, OrderBook, OrderKind, OrderStatus, RejectReason, TimeInForce};
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// A newly-submitted order, before admission decides Accepted/Rejected.
/// Shaped to deserialize directly from a `POST /sessions/{id}/orders` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(default = "uuid::Uuid::new_v4")]
    pub id: OrderId,
    pub client_id: Option<String>,
    pub symbol: Symbol,
    pub side: Side,
    pub kind: OrderKind,
    pub tif: TimeInForce,
    pub qty: u64,
    pub limit_price: Option<Price>,
    pub stop_price: Option<Price>,
    pub trail_price: Option<Price>,
    pub trail_percent: Option<Decimal>,
}

pub struct Fill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub qty: u32,
    pub price: Price,
    pub fee: Fee,
    pub is_maker: bool,
}

fn deterministic_unit_interval(order_id: OrderId, seq: Seq, salt: u64) -> f64 {
    let mut hasher = DefaultHasher::new();
    order_id.hash(&mut hasher);
    seq.hash(&mut hasher);
    salt.hash(&mut hasher);
    let seed = hasher.finish();
    let mut rng = StdRng::seed_from_u64(seed);
    rng.r#gen::<f64>()
}

/// Draws a deterministic `uniform(0, max)` keyed on the order's identity, so
/// two runs of the same commands against the same data produce the same
/// jitter (spec §4.6 replay determinism).
fn deterministic_uniform(order_id: OrderId, seq: Seq, salt: u64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    deterministic_unit_interval(order_id, seq, salt) * max
}

pub struct MatchingEngine {
    books: FxHashMap<Symbol, OrderBook>,
    /// Market orders admitted before a qualifying trade has printed, kept in
    /// admission order per symbol (spec §8: "a market order against an empty
    /// tape remains Accepted until a trade arrives"). `OrderBook` itself
    /// never indexes Market orders by price, so this is the only place they
    /// are tracked as live.
    pending_market: FxHashMap<Symbol, Vec<OrderId>>,
    fee_table: FeeTable,
    enable_latency: bool,
    fixed_latency_us: u64,
    random_latency_max_us: u64,
    enable_slippage: bool,
    fixed_slippage_bps: f64,
    random_slippage_max_bps: f64,
    enable_market_impact: bool,
    market_impact_bps: f64,
    market_impact_per_share: f64,
    market_impact_sqrt_coef: f64,
    enable_partial_fills: bool,
    partial_fill_probability: f64,
    rejection_probability: f64,
}

impl MatchingEngine {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            books: FxHashMap::default(),
            pending_market: FxHashMap::default(),
            fee_table: config.fee_table,
            enable_latency: config.enable_latency,
            fixed_latency_us: config.fixed_latency_us,
            random_latency_max_us: config.random_latency_max_us,
            enable_slippage: config.enable_slippage,
            fixed_slippage_bps: config.fixed_slippage_bps,
            random_slippage_max_bps: config.random_slippage_max_bps,
            enable_market_impact: config.enable_market_impact,
            market_impact_bps: config.market_impact_bps,
            market_impact_per_share: config.market_impact_per_share,
            market_impact_sqrt_coef: config.market_impact_sqrt_coef,
            enable_partial_fills: config.enable_partial_fills,
            partial_fill_probability: config.partial_fill_probability,
            rejection_probability: config.rejection_probability,
        }
    }

    pub fn book(&self, symbol: &Symbol) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    pub fn order(&self, symbol: &Symbol, id: OrderId) -> Option<&Order> {
        self.books.get(symbol).and_then(|b| b.get(id))
    }

    pub fn orders(&self) -> impl Iterator<Item = &Order> {
        self.books.values().flat_map(|b| b.orders())
    }

    /// Admits a new order (spec §4.4 Admission). Caller has already checked
    /// buying power via `Ledger::check_admission`; this computes the
    /// latency-delayed `admission_ns` and the random-rejection draw.
    pub fn admit(&mut self, req: SubmitRequest, now_ns: Nanos, seq: Seq) -> Order {
        let random_reject = deterministic_unit_interval(req.id, seq, 1) < self.rejection_probability;

        let latency_ns = if self.enable_latency {
            let jitter_us =
                deterministic_uniform(req.id, seq, 2, self.random_latency_max_us as f64);
            (self.fixed_latency_us as f64 + jitter_us) as i64 * 1_000
        } else {
            0
        };
        let admission_ns = now_ns + latency_ns;

        let (status, reject_reason) = if random_reject {
            (OrderStatus::Rejected, Some(RejectReason::RandomRejection))
        } else if req.qty == 0 {
            (OrderStatus::Rejected, Some(RejectReason::InvalidQuantity))
        } else {
            (OrderStatus::Accepted, None)
        };

        let activated = !matches!(
            req.kind,
            OrderKind::Stop | OrderKind::StopLimit | OrderKind::TrailingStop
        );

        let order = Order {
            id: req.id,
            client_id: req.client_id,
            symbol: req.symbol.clone(),
            side: req.side,
            kind: req.kind,
            tif: req.tif,
            qty: req.qty,
            filled_qty: 0,
            limit_price: req.limit_price,
            stop_price: req.stop_price,
            trail_price: req.trail_price,
            trail_percent: req.trail_percent,
            activated,
            status,
            reject_reason,
            created_ns: now_ns,
            updated_ns: now_ns,
            admission_ns,
            avg_fill_price: None,
            seq,
        };

        if order.is_resting() {
            if order.kind == OrderKind::Market {
                self.pending_market.entry(req.symbol.clone()).or_default().push(order.id);
            }
            self.books.entry(req.symbol).or_default().insert(order.clone());
        }
        order
    }

    pub fn cancel(&mut self, symbol: &Symbol, id: OrderId) -> Option<Order> {
        if let Some(pending) = self.pending_market.get_mut(symbol) {
            pending.retain(|&pid| pid != id);
        }
        self.books.get_mut(symbol).and_then(|b| b.remove(id))
    }

    /// Rescales every resting order's quantity and price fields by a split
    /// ratio (spec §4.5 corporate actions: "open orders' qty/limit rescale
    /// the same way positions do"). `ratio` is shares-after / shares-before,
    /// e.g. `2` for a 2:1 forward split, `0.5` for a 1:2 reverse split.
    pub fn apply_split(&mut self, symbol: &Symbol, ratio: Decimal) {
        let Some(book) = self.books.get_mut(symbol) else {
            return;
        };
        let ids: Vec<OrderId> = book.orders().map(|o| o.id).collect();
        for id in ids {
            if let Some(order) = book.get_mut(id) {
                order.qty = rescale_qty(order.qty, ratio);
                order.filled_qty = rescale_qty(order.filled_qty, ratio);
                order.limit_price = order.limit_price.map(|p| rescale_price(p, ratio));
                order.stop_price = order.stop_price.map(|p| rescale_price(p, ratio));
                order.trail_price = order.trail_price.map(|p| rescale_price(p, ratio));
                order.avg_fill_price = order.avg_fill_price.map(|p| rescale_price(p, ratio));
            }
            book.reindex(id);
        }
    }

    /// Processes an incoming trade print: activates stops, fills eligible
    /// resting orders, and returns the fills produced (spec §4.4 Matching
    /// rules, tie-break determinism by price then admission_ns then seq).
    ///
    /// Never holds a `&OrderBook`/`&mut OrderBook` across a call back into
    /// `self` (`execute_fill`, `reject_unfilled`) — those calls need `&mut
    /// self` themselves, and a book reference kept alive across a loop
    /// iteration would conflict with them. Every lookup here is therefore a
    /// fresh `self.books.get(symbol)`.
    pub fn on_trade(
        &mut self,
        symbol: &Symbol,
        trade_price: Price,
        trade_size: u32,
        now_ns: Nanos,
    ) -> Vec<Fill> {
        let mut fills = Vec::new();
        if !self.books.contains_key(symbol) {
            return fills;
        }

        self.activate_stops(symbol, trade_price, now_ns);

        let mut remaining_liquidity = trade_size;

        let market_ids = self.pending_market.get(symbol).cloned().unwrap_or_default();
        let mut still_pending = Vec::with_capacity(market_ids.len());
        for id in market_ids {
            if remaining_liquidity == 0 {
                still_pending.push(id);
                continue;
            }
            match self.fill_market_order(symbol, id, trade_price, remaining_liquidity, now_ns) {
                Some(fill) => {
                    remaining_liquidity = remaining_liquidity.saturating_sub(fill.qty);
                    let still_resting = self
                        .books
                        .get(symbol)
                        .and_then(|b| b.get(id))
                        .map(|o| o.is_resting())
                        .unwrap_or(false);
                    if still_resting {
                        still_pending.push(id);
                    }
                    fills.push(fill);
                }
                None => {
                    let still_present = self
                        .books
                        .get(symbol)
                        .and_then(|b| b.get(id))
                        .map(|o| o.is_resting())
                        .unwrap_or(false);
                    if still_present {
                        still_pending.push(id);
                    }
                }
            }
        }
        self.pending_market.insert(symbol.clone(), still_pending);

        let buy_ids = self
            .books
            .get(symbol)
            .map(|b| b.eligible_buys(trade_price))
            .unwrap_or_default();
        for id in buy_ids {
            if remaining_liquidity == 0 {
                break;
            }
            let Some((remaining_qty, tif)) = self
                .books
                .get(symbol)
                .and_then(|b| b.get(id))
                .and_then(|o| (o.admission_ns <= now_ns).then(|| (o.remaining_qty(), o.tif)))
            else {
                continue;
            };
            if remaining_qty == 0 {
                continue;
            }
            if tif == TimeInForce::Fok && remaining_qty > u64::from(remaining_liquidity) {
                self.reject_unfilled(symbol, id, now_ns);
                continue;
            }
            let qty = remaining_qty.min(u64::from(remaining_liquidity)) as u32;
            let fill = self.execute_fill(symbol, id, qty, trade_price, Side::Buy, true, now_ns);
            remaining_liquidity = remaining_liquidity.saturating_sub(qty);
            fills.push(fill);
        }

        let sell_ids = self
            .books
            .get(symbol)
            .map(|b| b.eligible_sells(trade_price))
            .unwrap_or_default();
        for id in sell_ids {
            if remaining_liquidity == 0 {
                break;
            }
            let Some((remaining_qty, tif)) = self
                .books
                .get(symbol)
                .and_then(|b| b.get(id))
                .and_then(|o| (o.admission_ns <= now_ns).then(|| (o.remaining_qty(), o.tif)))
            else {
                continue;
            };
            if remaining_qty == 0 {
                continue;
            }
            if tif == TimeInForce::Fok && remaining_qty > u64::from(remaining_liquidity) {
                self.reject_unfilled(symbol, id, now_ns);
                continue;
            }
            let qty = remaining_qty.min(u64::from(remaining_liquidity)) as u32;
            let fill = self.execute_fill(symbol, id, qty, trade_price, Side::Sell, true, now_ns);
            remaining_liquidity = remaining_liquidity.saturating_sub(qty);
            fills.push(fill);
        }

        self.cancel_unmatched_immediate_orders(symbol, now_ns);

        fills
    }

    /// Fills a freshly-admitted Market order against the first qualifying
    /// trade at/after its `admission_ns` (spec §4.4 "Market order").
    pub fn fill_market_order(
        &mut self,
        symbol: &Symbol,
        order_id: OrderId,
        trade_price: Price,
        trade_size: u32,
        now_ns: Nanos,
    ) -> Option<Fill> {
        let book = self.books.get(symbol)?;
        let order = book.get(order_id)?;
        let is_market_like = order.kind == OrderKind::Market
            || (order.activated && order.limit_price.is_none());
        if !is_market_like || order.admission_ns > now_ns {
            return None;
        }
        let side = order.side;
        let tif = order.tif;
        let seq = order.seq;
        let remaining = order.remaining_qty();

        if tif == TimeInForce::Fok && remaining > u64::from(trade_size) {
            self.reject_unfilled(symbol, order_id, now_ns);
            return None;
        }

        let mut qty = remaining.min(u64::from(trade_size)) as u32;
        if self.enable_partial_fills && tif != TimeInForce::Fok {
            let partial_draw = deterministic_unit_interval(order_id, seq, 3);
            if partial_draw < self.partial_fill_probability && qty > 1 {
                qty = (qty / 2).max(1);
            }
        }
        if qty == 0 {
            return None;
        }
        Some(self.execute_fill(symbol, order_id, qty, trade_price, side, false, now_ns))
    }

    /// Removes an order with zero fills and marks it `Rejected` (spec §4.4
    /// `Fok`: "either fills fully on the first matching opportunity, or
    /// rejects with zero fills").
    fn reject_unfilled(&mut self, symbol: &Symbol, order_id: OrderId, now_ns: Nanos) {
        if let Some(book) = self.books.get_mut(symbol) {
            if let Some(order) = book.get_mut(order_id) {
                order.status = OrderStatus::Rejected;
                order.reject_reason = Some(RejectReason::FokUnfilled);
                order.updated_ns = now_ns;
            }
            book.remove(order_id);
        }
        if let Some(pending) = self.pending_market.get_mut(symbol) {
            pending.retain(|&pid| pid != order_id);
        }
    }

    /// Cancels (or, for an unfilled `Fok`, rejects) any `Ioc`/`Fok` order
    /// still resting after this tick's matching — an immediate-or-cancel
    /// order only gets the one matching opportunity (spec §3/§4.4: "any
    /// unfilled remainder cancels on the same matching tick").
    fn cancel_unmatched_immediate_orders(&mut self, symbol: &Symbol, now_ns: Nanos) {
        let ids: Vec<OrderId> = match self.books.get(symbol) {
            Some(book) => book
                .orders()
                .filter(|o| {
                    o.is_resting()
                        && o.admission_ns <= now_ns
                        && matches!(o.tif, TimeInForce::Ioc | TimeInForce::Fok)
                })
                .map(|o| o.id)
                .collect(),
            None => return,
        };
        if ids.is_empty() {
            return;
        }
        if let Some(book) = self.books.get_mut(symbol) {
            for &id in &ids {
                if let Some(order) = book.get_mut(id) {
                    if order.tif == TimeInForce::Fok && order.filled_qty == 0 {
                        order.status = OrderStatus::Rejected;
                        order.reject_reason = Some(RejectReason::FokUnfilled);
                    } else {
                        order.status = OrderStatus::Canceled;
                    }
                    order.updated_ns = now_ns;
                }
                book.remove(id);
            }
        }
        if let Some(pending) = self.pending_market.get_mut(symbol) {
            pending.retain(|pid| !ids.contains(pid));
        }
    }

    fn execute_fill(
        &mut self,
        symbol: &Symbol,
        order_id: OrderId,
        qty: u32,
        raw_price: Price,
        side: Side,
        is_maker: bool,
        now_ns: Nanos,
    ) -> Fill {
        let seq = self
            .books
            .get(symbol)
            .and_then(|b| b.get(order_id))
            .map(|o| o.seq)
            .unwrap_or(0);

        let (fill_price, fee) = self.apply_cost_model(order_id, seq, side, raw_price, qty, is_maker);

        if let Some(book) = self.books.get_mut(symbol) {
            if let Some(order) = book.get_mut(order_id) {
                order.filled_qty += u64::from(qty);
                order.updated_ns = now_ns;
                let prior_notional = order
                    .avg_fill_price
                    .map(|p| p.inner() * Decimal::from(order.filled_qty - u64::from(qty)))
                    .unwrap_or(Decimal::ZERO);
                let new_notional = prior_notional + fill_price.inner() * Decimal::from(qty);
                order.avg_fill_price =
                    Some(Price::new(new_notional / Decimal::from(order.filled_qty.max(1))));
                order.status = if order.is_filled() {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
                // An Ioc/Fok order that only partially fills stays resting
                // here; `cancel_unmatched_immediate_orders` sweeps it away
                // at the end of this same matching tick, and by
                // construction (see `on_trade`'s Fok pre-check) a Fok order
                // only ever reaches this point when it fills completely.
                if order.is_filled() {
                    book.remove(order_id);
                } else {
                    book.reindex(order_id);
                }
            }
        }

        Fill {
            order_id,
            symbol: symbol.clone(),
            side,
            qty,
            price: fill_price,
            fee,
            is_maker,
        }
    }

    /// Applies the cascaded cost model: slippage, then market impact, then
    /// fees (spec §4.4 "Cost model (in order, applied to fill price)").
    fn apply_cost_model(
        &self,
        order_id: OrderId,
        seq: Seq,
        side: Side,
        raw_price: Price,
        qty: u32,
        is_maker: bool,
    ) -> (Price, Fee) {
        let mut price = raw_price.inner();
        let adverse_sign = match side {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        };

        if self.enable_slippage {
            let slip_bps = self.fixed_slippage_bps
                + deterministic_uniform(order_id, seq, 4, self.random_slippage_max_bps);
            let slip_frac = Decimal::from_f64(slip_bps / 10_000.0).unwrap_or(Decimal::ZERO);
            price += price * slip_frac * adverse_sign;
        }

        if self.enable_market_impact {
            let notional = (price * Decimal::from(qty)).to_f64().unwrap_or(0.0);
            let impact_bps = self.market_impact_bps
                + (qty as f64) * self.market_impact_per_share
                + self.market_impact_sqrt_coef * (notional / 1_000_000.0).max(0.0).sqrt();
            let impact_frac = Decimal::from_f64(impact_bps / 10_000.0).unwrap_or(Decimal::ZERO);
            price += price * impact_frac * adverse_sign;
        }

        let fill_price = Price::new(price);
        let notional = fill_price.inner() * Decimal::from(qty);

        let mut total_fee = self.fee_table.per_share_commission * Decimal::from(qty)
            + self.fee_table.per_order_commission;

        if side == Side::Sell {
            total_fee += self.fee_table.sec_fee_per_million * (notional / Decimal::from(1_000_000));
            let taf = (self.fee_table.taf_fee_per_share * Decimal::from(qty))
                .min(self.fee_table.finra_taf_cap);
            total_fee += taf;
        }

        total_fee += if is_maker {
            self.fee_table.maker_rebate_per_share * Decimal::from(qty) * -Decimal::ONE
        } else {
            self.fee_table.taker_fee_per_share * Decimal::from(qty)
        };

        let fee = Fee::new(total_fee.max(Decimal::ZERO)).unwrap_or_else(|_| Fee::zero());
        (fill_price, fee)
    }

    /// Activates Stop/StopLimit/TrailingStop orders that the trade printed
    /// through, and advances trailing references favorably (spec §4.4). A
    /// triggered Stop/TrailingStop converts to a market order and is handed
    /// to `pending_market` (runs before `on_trade`'s market-order pass, so it
    /// competes for this same print's remaining liquidity) since
    /// `OrderBook::insert` deliberately never rests a priceless order in
    /// `bids`/`asks`.
    fn activate_stops(&mut self, symbol: &Symbol, trade_price: Price, now_ns: Nanos) {
        let Some(book) = self.books.get_mut(symbol) else {
            return;
        };
        let pending = book.pending_stop_ids();
        let mut newly_market = Vec::new();
        for id in pending {
            let Some(order) = book.get_mut(id) else { continue };

            if order.kind == OrderKind::TrailingStop {
                update_trailing_reference(order, trade_price);
            }

            let Some(stop) = order.stop_price else { continue };
            let triggered = match order.side {
                Side::Buy => trade_price >= stop,
                Side::Sell => trade_price <= stop,
            };
            if triggered {
                order.activated = true;
                order.updated_ns = now_ns;
                if order.kind == OrderKind::Stop || order.kind == OrderKind::TrailingStop {
                    order.limit_price = None; // converts to market
                    newly_market.push(id);
                }
                book.reindex(id);
            }
        }
        if !newly_market.is_empty() {
            self.pending_market.entry(symbol.clone()).or_default().extend(newly_market);
        }
    }
}

fn rescale_qty(qty: u64, ratio: Decimal) -> u64 {
    (Decimal::from(qty) * ratio)
        .round()
        .to_u64()
        .unwrap_or(qty)
}

fn rescale_price(price: Price, ratio: Decimal) -> Price {
    Price::new(price.inner() / ratio)
}

fn update_trailing_reference(order: &mut Order, trade_price: Price) {
    let reference = match order.side {
        // A sell trailing-stop trails the highest price seen (stop rises).
        Side::Sell => {
            let candidate = if let Some(trail_price) = order.trail_price {
                trade_price - trail_price
            } else if let Some(pct) = order.trail_percent {
                Price::new(trade_price.inner() * (Decimal::ONE - pct))
            } else {
                return;
            };
            order.stop_price.map(|s| candidate.max(s)).unwrap_or(candidate)
        }
        // A buy trailing-stop trails the lowest price seen (stop falls).
        Side::Buy => {
            let candidate = if let Some(trail_price) = order.trail_price {
                trade_price + trail_price
            } else if let Some(pct) = order.trail_percent {
                Price::new(trade_price.inner() * (Decimal::ONE + pct))
            } else {
                return;
            };
            order.stop_price.map(|s| candidate.min(s)).unwrap_or(candidate)
        }
    };
    order.stop_price = Some(reference);
}
