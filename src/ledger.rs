//! Ledger (C5): account, positions, fills, margin and P&L.
//!
//! `Position` and `Account` follow the teacher's `balance.rs` discipline —
//! private fields, every mutation a checked method, never a public setter —
//! generalized from a single available/frozen pair to the full multi-symbol
//! cash/equity/margin model spec §3 requires. The audit trail mirrors the
//! teacher's `ledger::LedgerWriter` (a durable append-only record of every
//! mutation); here that role is filled by the WAL (C7), so this module
//! stays pure in-memory state plus the arithmetic.

use crate::core_types::{Side, Symbol};
use crate::money::{Fee, Price};
use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerError {
    InsufficientBuyingPower,
    ForbiddenShort,
    PositionCapExceeded,
    SingleOrderCapExceeded,
}

/// One symbol's holdings. `cost_basis = avg_entry_price * |qty|` to within
/// rounding (spec §3 invariant); flipping sign closes the old leg (booking
/// realized P&L) and opens a new one at the crossing fill's price.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    qty: i64,
    avg_entry_price: Price,
    cost_basis: Decimal,
    market_value: Decimal,
    unrealized_pl: Decimal,
    realized_pl: Decimal,
}

impl Position {
    fn flat() -> Self {
        Self {
            qty: 0,
            avg_entry_price: Price::zero(),
            cost_basis: Decimal::ZERO,
            market_value: Decimal::ZERO,
            unrealized_pl: Decimal::ZERO,
            realized_pl: Decimal::ZERO,
        }
    }

    pub fn qty(&self) -> i64 {
        self.qty
    }

    pub fn avg_entry_price(&self) -> Price {
        self.avg_entry_price
    }

    pub fn cost_basis(&self) -> Decimal {
        self.cost_basis
    }

    pub fn market_value(&self) -> Decimal {
        self.market_value
    }

    pub fn unrealized_pl(&self) -> Decimal {
        self.unrealized_pl
    }

    pub fn realized_pl(&self) -> Decimal {
        self.realized_pl
    }

    pub fn is_flat(&self) -> bool {
        self.qty == 0
    }

    /// Applies a fill of `signed_qty` (positive for buy, negative for sell)
    /// at `fill_price`. Returns the realized P&L booked on any closed leg.
    fn apply_fill(&mut self, signed_qty: i64, fill_price: Price) -> Decimal {
        let mut realized = Decimal::ZERO;
        let prev_qty = self.qty;
        let same_direction = prev_qty == 0
            || (prev_qty > 0 && signed_qty > 0)
            || (prev_qty < 0 && signed_qty < 0);

        if same_direction {
            let new_qty = prev_qty + signed_qty;
            let prev_notional = self.avg_entry_price.inner() * Decimal::from(prev_qty.abs());
            let added_notional = fill_price.inner() * Decimal::from(signed_qty.abs());
            let new_notional = prev_notional + added_notional;
            self.avg_entry_price = if new_qty != 0 {
                Price::new(new_notional / Decimal::from(new_qty.abs()))
            } else {
                Price::zero()
            };
            self.qty = new_qty;
        } else {
            let closing_qty = signed_qty.abs().min(prev_qty.abs());
            let pl_per_share = if prev_qty > 0 {
                fill_price.inner() - self.avg_entry_price.inner()
            } else {
                self.avg_entry_price.inner() - fill_price.inner()
            };
            realized += pl_per_share * Decimal::from(closing_qty);

            let remaining_close = prev_qty.abs() - closing_qty;
            let flip_qty = signed_qty.abs() - closing_qty;

            if remaining_close > 0 {
                // Partial close; direction and avg price unchanged.
                self.qty = if prev_qty > 0 {
                    remaining_close
                } else {
                    -remaining_close
                };
            } else if flip_qty > 0 {
                // Closed fully and opened a new position on the other side.
                self.qty = if signed_qty > 0 { flip_qty } else { -flip_qty };
                self.avg_entry_price = fill_price;
            } else {
                self.qty = 0;
                self.avg_entry_price = Price::zero();
            }
        }

        self.cost_basis = self.avg_entry_price.inner() * Decimal::from(self.qty.abs());
        self.realized_pl += realized;
        realized
    }

    fn mark(&mut self, price: Price) {
        self.market_value = price.inner() * Decimal::from(self.qty);
        self.unrealized_pl = (price.inner() - self.avg_entry_price.inner()) * Decimal::from(self.qty);
    }
}

/// `equity = cash + long_mv - short_mv - accrued_fees` at every observable
/// instant (spec §3 invariant).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Account {
    cash: Decimal,
    long_mv: Decimal,
    short_mv: Decimal,
    accrued_fees: Decimal,
    initial_margin: Decimal,
    maintenance_margin: Decimal,
    pattern_day_trader: bool,
}

impl Account {
    fn new(initial_capital: Decimal) -> Self {
        Self {
            cash: initial_capital,
            long_mv: Decimal::ZERO,
            short_mv: Decimal::ZERO,
            accrued_fees: Decimal::ZERO,
            initial_margin: Decimal::ZERO,
            maintenance_margin: Decimal::ZERO,
            pattern_day_trader: false,
        }
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    pub fn equity(&self) -> Decimal {
        self.cash + self.long_mv - self.short_mv - self.accrued_fees
    }

    pub fn long_mv(&self) -> Decimal {
        self.long_mv
    }

    pub fn short_mv(&self) -> Decimal {
        self.short_mv
    }

    pub fn accrued_fees(&self) -> Decimal {
        self.accrued_fees
    }

    pub fn initial_margin(&self) -> Decimal {
        self.initial_margin
    }

    pub fn maintenance_margin(&self) -> Decimal {
        self.maintenance_margin
    }

    pub fn pattern_day_trader(&self) -> bool {
        self.pattern_day_trader
    }

    /// `buying_power`: cash-account approximation (2x equity for margin
    /// accounts is left as a future knob; spec §9 does not require it).
    pub fn buying_power(&self) -> Decimal {
        (self.equity() - self.maintenance_margin).max(Decimal::ZERO)
    }

    pub fn regt_buying_power(&self) -> Decimal {
        self.buying_power()
    }

    pub fn daytrading_buying_power(&self) -> Decimal {
        self.buying_power() * Decimal::from(4)
    }

    pub fn in_margin_call(&self) -> bool {
        self.equity() < self.maintenance_margin
    }
}

pub struct Ledger {
    account: Account,
    positions: FxHashMap<Symbol, Position>,
    maintenance_margin_pct: Decimal,
    allow_shorting: bool,
    max_position_value: Option<Decimal>,
    max_single_order_value: Option<Decimal>,
}

impl Ledger {
    pub fn new(
        initial_capital: Decimal,
        maintenance_margin_pct: Decimal,
        allow_shorting: bool,
        max_position_value: Option<Decimal>,
        max_single_order_value: Option<Decimal>,
    ) -> Self {
        Self {
            account: Account::new(initial_capital),
            positions: FxHashMap::default(),
            maintenance_margin_pct,
            allow_shorting,
            max_position_value,
            max_single_order_value,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&Symbol, &Position)> {
        self.positions.iter()
    }

    /// Checks admission-time buying power and policy caps before an order
    /// is accepted (spec §4.4 Admission).
    pub fn check_admission(
        &self,
        symbol: &Symbol,
        side: Side,
        qty: u64,
        est_price: Price,
    ) -> Result<(), LedgerError> {
        let notional = est_price.inner() * Decimal::from(qty);

        if let Some(cap) = self.max_single_order_value {
            if notional > cap {
                return Err(LedgerError::SingleOrderCapExceeded);
            }
        }

        let current_qty = self.positions.get(symbol).map(|p| p.qty()).unwrap_or(0);
        if side == Side::Sell && !self.allow_shorting && current_qty <= 0 {
            return Err(LedgerError::ForbiddenShort);
        }

        if let Some(cap) = self.max_position_value {
            let prospective_qty = match side {
                Side::Buy => current_qty + qty as i64,
                Side::Sell => current_qty - qty as i64,
            };
            let prospective_value = est_price.inner() * Decimal::from(prospective_qty.abs());
            if prospective_value > cap {
                return Err(LedgerError::PositionCapExceeded);
            }
        }

        if notional > self.account.buying_power() {
            return Err(LedgerError::InsufficientBuyingPower);
        }

        Ok(())
    }

    /// Applies a fill: updates the position, cash, and accrued fees.
    pub fn apply_fill(&mut self, symbol: &Symbol, side: Side, qty: u32, price: Price, fee: Fee) {
        let signed_qty = match side {
            Side::Buy => i64::from(qty),
            Side::Sell => -i64::from(qty),
        };

        let position = self
            .positions
            .entry(symbol.clone())
            .or_insert_with(Position::flat);
        position.apply_fill(signed_qty, price);

        let notional = price.inner() * Decimal::from(qty);
        self.account.cash -= Decimal::from(signed_qty.signum()) * notional;
        self.account.accrued_fees += fee.inner();

        if position.is_flat() {
            self.positions.remove(symbol);
        }
    }

    /// Re-marks a held symbol to the latest trade/quote price, refreshing
    /// `long_mv`/`short_mv`/`maintenance_margin` (spec §4.5 `mark_to_market`).
    pub fn mark_to_market(&mut self, symbol: &Symbol, price: Price) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.mark(price);
        }
        self.recompute_account_aggregates();
    }

    fn recompute_account_aggregates(&mut self) {
        let mut long_mv = Decimal::ZERO;
        let mut short_mv = Decimal::ZERO;
        for position in self.positions.values() {
            if position.qty() > 0 {
                long_mv += position.market_value();
            } else if position.qty() < 0 {
                short_mv += position.market_value().abs();
            }
        }
        self.account.long_mv = long_mv;
        self.account.short_mv = short_mv;
        self.account.maintenance_margin = (long_mv + short_mv) * self.maintenance_margin_pct;
        self.account.initial_margin = self.account.maintenance_margin;
    }

    /// Applies a dividend or split (spec §4.5 "Corporate actions").
    pub fn apply_dividend(&mut self, symbol: &Symbol, amount_per_share: Price) {
        if let Some(position) = self.positions.get(symbol) {
            let credit = amount_per_share.inner() * Decimal::from(position.qty());
            self.account.cash += credit;
        }
    }

    pub fn apply_split(&mut self, symbol: &Symbol, ratio: Decimal) {
        if ratio.is_zero() {
            return;
        }
        if let Some(position) = self.positions.get_mut(symbol) {
            let old_qty = Decimal::from(position.qty);
            let new_qty_dec = old_qty * ratio;
            let new_qty = new_qty_dec.trunc().to_i64().unwrap_or(position.qty);
            let fractional = new_qty_dec - Decimal::from(new_qty);

            position.avg_entry_price = Price::new(position.avg_entry_price.inner() / ratio);
            position.qty = new_qty;
            position.cost_basis = position.avg_entry_price.inner() * Decimal::from(new_qty.abs());

            // Fractional residual from the split is credited as cash
            // (spec §4.5: "any fractional residual is credited as cash").
            self.account.cash += fractional * position.avg_entry_price.inner();
        }
    }

    /// Returns `Some(margin_call)` when equity has fallen below maintenance
    /// margin (spec §4.5). Callers gate this on `enable_margin_call_checks`.
    pub fn check_margin(&self) -> Option<MarginCall> {
        if self.account.in_margin_call() {
            Some(MarginCall {
                equity: self.account.equity(),
                maintenance_margin: self.account.maintenance_margin(),
            })
        } else {
            None
        }
    }

    /// Target equity a forced liquidation should reach before stopping
    /// (spec §4.5: `equity >= 1.5 * maintenance_margin`).
    pub fn forced_liquidation_target(&self) -> Decimal {
        self.account.maintenance_margin * Decimal::new(15, 1)
    }

    /// Positions ordered from highest to lowest absolute market value, the
    /// order forced liquidation closes them in (spec §4.5 "descending risk
    /// order").
    pub fn positions_by_descending_risk(&self) -> Vec<Symbol> {
        let mut entries: Vec<_> = self
            .positions
            .iter()
            .map(|(symbol, position)| (symbol.clone(), position.market_value().abs()))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        entries.into_iter().map(|(symbol, _)| symbol).collect()
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            account: self.account,
            positions: self.positions.iter().map(|(s, p)| (s.clone(), *p)).collect(),
        }
    }

    pub fn restore(
        snapshot: LedgerSnapshot,
        maintenance_margin_pct: Decimal,
        allow_shorting: bool,
        max_position_value: Option<Decimal>,
        max_single_order_value: Option<Decimal>,
    ) -> Self {
        Self {
            account: snapshot.account,
            positions: snapshot.positions.into_iter().collect(),
            maintenance_margin_pct,
            allow_shorting,
            max_position_value,
            max_single_order_value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarginCall {
    pub equity: Decimal,
    pub maintenance_margin: Decimal,
}

/// Snapshot shape persisted by the checkpoint (C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub account: Account,
    pub positions: Vec<(Symbol, Position)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price(v: i64) -> Price {
        Price::new(Decimal::from(v))
    }

    #[test]
    fn buy_then_sell_books_realized_pl() {
        let mut ledger = Ledger::new(Decimal::from(10_000), Decimal::new(25, 2), true, None, None);
        let symbol = Symbol::new("AAPL");
        ledger.apply_fill(&symbol, Side::Buy, 10, price(100), Fee::zero());
        assert_eq!(ledger.position(&symbol).unwrap().qty(), 10);
        assert_eq!(ledger.account().cash(), Decimal::from(9_000));

        ledger.apply_fill(&symbol, Side::Sell, 10, price(110), Fee::zero());
        assert!(ledger.position(&symbol).is_none());
        // Realized P&L: +10*10 = 100, cash back to 10_000 + 100.
        assert_eq!(ledger.account().cash(), Decimal::from(10_100));
    }

    #[test]
    fn equity_invariant_holds_after_mark() {
        let mut ledger = Ledger::new(Decimal::from(10_000), Decimal::new(25, 2), true, None, None);
        let symbol = Symbol::new("AAPL");
        ledger.apply_fill(&symbol, Side::Buy, 10, price(100), Fee::zero());
        ledger.mark_to_market(&symbol, price(120));
        let expected = ledger.account().cash() + ledger.account().long_mv()
            - ledger.account().short_mv()
            - ledger.account().accrued_fees();
        assert_eq!(ledger.account().equity(), expected);
        assert_eq!(ledger.account().long_mv(), Decimal::from(1_200));
    }

    #[test]
    fn forbids_short_when_disallowed() {
        let ledger = Ledger::new(Decimal::from(10_000), Decimal::new(25, 2), false, None, None);
        let symbol = Symbol::new("AAPL");
        let result = ledger.check_admission(&symbol, Side::Sell, 10, price(100));
        assert_eq!(result, Err(LedgerError::ForbiddenShort));
    }

    #[test]
    fn dividend_credits_long_position() {
        let mut ledger = Ledger::new(Decimal::from(10_000), Decimal::new(25, 2), true, None, None);
        let symbol = Symbol::new("AAPL");
        ledger.apply_fill(&symbol, Side::Buy, 10, price(100), Fee::zero());
        let cash_before = ledger.account().cash();
        ledger.apply_dividend(&symbol, price(1));
        assert_eq!(ledger.account().cash(), cash_before + Decimal::from(10));
    }

    #[test]
    fn split_multiplies_qty_and_divides_avg_price() {
        let mut ledger = Ledger::new(Decimal::from(10_000), Decimal::new(25, 2), true, None, None);
        let symbol = Symbol::new("AAPL");
        ledger.apply_fill(&symbol, Side::Buy, 10, price(100), Fee::zero());
        ledger.apply_split(&symbol, Decimal::from(2));
        let position = ledger.position(&symbol).unwrap();
        assert_eq!(position.qty(), 20);
        assert_eq!(position.avg_entry_price().inner(), Decimal::from(50));
    }
}
