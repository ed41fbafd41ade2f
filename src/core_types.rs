//! Core types used throughout the system
//!
//! Semantic type aliases and the `Symbol` newtype. Kept first in the
//! module list since almost everything else depends on these.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Session identifier.
pub type SessionId = uuid::Uuid;

/// Order identifier, unique within a session.
pub type OrderId = uuid::Uuid;

/// Connection identifier for a streaming subscriber.
pub type ConnId = u64;

/// Ingestion sequence number. Strictly monotonic within one session's
/// EventQueue, used to break timestamp ties deterministically.
pub type Seq = u64;

/// Nanosecond timestamp, either wall-clock or virtual-session time.
pub type Nanos = i64;

/// Log sequence number: monotonic identifier of a WAL record within a
/// session.
pub type Lsn = u64;

/// Interned-ish ticker symbol. A plain owned `String` wrapper rather than
/// an index table: this domain has no per-asset decimal-precision registry
/// to key off of (see DESIGN.md), so a symbol is just its ticker text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Wire-protocol flavor a streaming subscriber speaks (spec §3 Subscriber,
/// §6 vendor-compatible APIs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiFlavor {
    Alpaca,
    Polygon,
    Finnhub,
    Generic,
}

/// A stream subscription kind (spec §3 Subscriber `subs: Map<Kind, ...>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Trades,
    Quotes,
    Bars,
    OrderUpdates,
    All,
}

/// A subscription target: a specific symbol, or `"*"` for every symbol in
/// the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionTarget {
    Symbol(Symbol),
    All,
}
