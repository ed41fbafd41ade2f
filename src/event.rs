//! Event (C1): the tagged record that flows through the whole pipeline.
//!
//! A single exhaustively-matched enum rather than a polymorphic hierarchy
//! (spec §9 design note), in the same spirit as the teacher's
//! `messages.rs` tagged inter-service messages.

use crate::core_types::{Nanos, Seq, Symbol};
use crate::money::{Fee, Price};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeData {
    pub price: Price,
    pub size: u32,
    pub conditions: Vec<u8>,
    pub exchange: u8,
    pub sip_ts_ns: Nanos,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteData {
    pub bid: Price,
    pub bid_size: u32,
    pub ask: Price,
    pub ask_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarData {
    pub open: Price,
    pub high: Price,
    pub low: Price,
    pub close: Price,
    pub volume: u64,
    pub vwap: Price,
    pub start_ns: Nanos,
    pub end_ns: Nanos,
    /// Marks this bar as the session's opening or closing cross, for
    /// `Opg`/`Cls` time-in-force participation (spec §4.4).
    pub is_open: bool,
    pub is_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderUpdateKind {
    Accepted,
    Fill {
        qty: u32,
        price: Price,
        fee: Fee,
        is_maker: bool,
    },
    Canceled,
    Rejected,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderUpdateData {
    pub order_id: crate::core_types::OrderId,
    pub kind: OrderUpdateKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorporateActionKind {
    Dividend { amount_per_share: Price },
    Split { ratio: RatioDecimal },
}

/// `Decimal` isn't `Eq`/`Hash`-friendly by default but does implement them;
/// this wrapper exists purely for a self-documenting field name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatioDecimal(pub Decimal);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorporateActionData {
    pub kind: CorporateActionKind,
}

/// The tagged event record. Every variant carries `timestamp_ns`, `symbol`
/// and `seq` so the EventQueue can order and dedupe uniformly regardless of
/// payload (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp_ns: Nanos,
    pub symbol: Symbol,
    pub seq: Seq,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Trade(TradeData),
    Quote(QuoteData),
    Bar(BarData),
    OrderUpdate(OrderUpdateData),
    CorporateAction(CorporateActionData),
}

impl Event {
    pub fn key(&self) -> (Nanos, Seq) {
        (self.timestamp_ns, self.seq)
    }

    pub fn is_market_data(&self) -> bool {
        matches!(
            self.payload,
            EventPayload::Trade(_) | EventPayload::Quote(_) | EventPayload::Bar(_)
        )
    }
}
