//! Money types
//!
//! Unified fixed-point decimal wrappers for prices, cash and fees. All
//! monetary arithmetic in this crate goes through `rust_decimal::Decimal`
//! via these newtypes — never a native binary float (spec §9).
//!
//! Simplified from the teacher's `money.rs` u64-satoshi scaled-amount
//! scheme: this domain (US equities) has a single global precision for
//! prices (6 fractional digits) and fees (4 fractional digits), not a
//! per-asset decimals table, so a `Decimal` newtype with an enforced scale
//! is sufficient and keeps arithmetic in terms clients already understand.

use rust_decimal::Decimal;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Deref, Sub};
use thiserror::Error;

/// Fractional digits carried by `Price` values.
pub const PRICE_SCALE: u32 = 6;

/// Fractional digits carried by `Fee` values.
pub const FEE_SCALE: u32 = 4;

#[derive(Debug, Error)]
pub enum MoneyError {
    #[error("precision overflow: provided {provided} decimals, max allowed {max}")]
    PrecisionOverflow { provided: u32, max: u32 },

    #[error("amount must be non-negative")]
    Negative,

    #[error("invalid decimal: {0}")]
    InvalidFormat(String),
}

/// A price or cash amount, rounded to `PRICE_SCALE` fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(Decimal);

impl Price {
    pub fn new(value: Decimal) -> Self {
        Self(value.round_dp(PRICE_SCALE))
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn from_str_strict(s: &str) -> Result<Self, MoneyError> {
        let d = Decimal::from_str(s.trim()).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
        Ok(Self::new(d))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }

    pub fn checked_mul_qty(self, qty: u64) -> Option<Decimal> {
        self.0.checked_mul(Decimal::from(qty))
    }
}

impl Deref for Price {
    type Target = Decimal;
    fn deref(&self) -> &Decimal {
        &self.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Price {
    type Output = Price;
    fn add(self, rhs: Price) -> Price {
        Price::new(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Price;
    fn sub(self, rhs: Price) -> Price {
        Price::new(self.0 - rhs.0)
    }
}

/// A fee amount, rounded to `FEE_SCALE` fractional digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fee(Decimal);

impl Fee {
    pub fn new(value: Decimal) -> Result<Self, MoneyError> {
        if value.is_sign_negative() {
            return Err(MoneyError::Negative);
        }
        Ok(Self(value.round_dp(FEE_SCALE)))
    }

    pub fn zero() -> Self {
        Self(Decimal::ZERO)
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl Deref for Fee {
    type Target = Decimal;
    fn deref(&self) -> &Decimal {
        &self.0
    }
}

impl fmt::Display for Fee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Fee {
    type Output = Fee;
    fn add(self, rhs: Fee) -> Fee {
        Fee((self.0 + rhs.0).round_dp(FEE_SCALE))
    }
}

/// Parses a client-provided decimal string, rejecting ambiguous formats the
/// way the teacher's `parse_amount` does (no leading-dot, no trailing-dot,
/// no scientific notation are accepted by `Decimal::from_str` already); this
/// additionally rejects more fractional digits than `max_scale` rather than
/// silently rounding.
pub fn parse_strict(s: &str, max_scale: u32) -> Result<Decimal, MoneyError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(MoneyError::InvalidFormat("empty string".into()));
    }
    let d = Decimal::from_str(s).map_err(|e| MoneyError::InvalidFormat(e.to_string()))?;
    if d.scale() > max_scale {
        return Err(MoneyError::PrecisionOverflow {
            provided: d.scale(),
            max: max_scale,
        });
    }
    Ok(d)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_rounds_to_scale() {
        let p = Price::new(Decimal::from_str("150.1234567").unwrap());
        assert_eq!(p.inner(), Decimal::from_str("150.123457").unwrap());
    }

    #[test]
    fn price_from_str_strict_rounds_rather_than_rejects() {
        assert!(Price::from_str_strict("1.2345678901").is_ok());
    }

    #[test]
    fn fee_rejects_negative() {
        assert!(Fee::new(Decimal::from_str("-1.0").unwrap()).is_err());
    }

    #[test]
    fn parse_strict_rejects_extra_scale() {
        assert!(parse_strict("1.23456", 4).is_err());
        assert!(parse_strict("1.2345", 4).is_ok());
    }
}
