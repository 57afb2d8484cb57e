//! Money type
//!
//! Monetary values are held as integer minor units (cents). Parsing and
//! formatting of the decimal wire representation goes through `rust_decimal`
//! so no floating point ever touches an amount.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::str::FromStr;

/// Number of minor units per major unit for every supported currency.
pub const MINOR_UNIT_SCALE: u32 = 2;

const MINOR_PER_MAJOR: i64 = 100;

/// An amount in integer minor currency units.
///
/// `Money` is signed so balance deltas can be expressed with the same type;
/// amounts carried by transactions are validated positive by the orchestrator.
///
/// # Example
/// ```
/// use finance_ledger::domain::Money;
///
/// let amount: Money = "100.25".parse().unwrap();
/// assert_eq!(amount.minor(), 10_025);
/// assert_eq!(amount.to_string(), "100.25");
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

/// Errors that can occur when parsing a Money value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    #[error("Invalid amount format: {0}")]
    ParseError(String),

    #[error("Amount has too many decimal places (max {MINOR_UNIT_SCALE}, got {0})")]
    TooManyDecimals(u32),

    #[error("Amount is out of representable range")]
    Overflow,
}

impl Money {
    pub const ZERO: Money = Money(0);

    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Whole major units, e.g. `Money::from_major(5)` is 5.00.
    pub const fn from_major(major: i64) -> Self {
        Self(major * MINOR_PER_MAJOR)
    }

    pub const fn minor(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, rhs: Money) -> Option<Money> {
        self.0.checked_add(rhs.0).map(Money)
    }

    pub fn checked_sub(self, rhs: Money) -> Option<Money> {
        self.0.checked_sub(rhs.0).map(Money)
    }

    /// Clamped at the `i64` range; for aggregates and reports only.
    pub fn saturating_add(self, rhs: Money) -> Money {
        Money(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Money) -> Money {
        Money(self.0.saturating_sub(rhs.0))
    }

    /// Parse a decimal string in major units ("12.50").
    pub fn parse_major(s: &str) -> Result<Self, MoneyError> {
        let value =
            Decimal::from_str(s.trim()).map_err(|e| MoneyError::ParseError(e.to_string()))?;
        Self::try_from(value)
    }

    /// Value in major units as an exact decimal.
    pub fn to_decimal(&self) -> Decimal {
        Decimal::new(self.0, MINOR_UNIT_SCALE)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        let value = value.normalize();
        if value.scale() > MINOR_UNIT_SCALE {
            return Err(MoneyError::TooManyDecimals(value.scale()));
        }
        let minor = value
            .checked_mul(Decimal::from(MINOR_PER_MAJOR))
            .and_then(|v| v.to_i64())
            .ok_or(MoneyError::Overflow)?;
        Ok(Self(minor))
    }
}

impl FromStr for Money {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_major(s)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let per = MINOR_PER_MAJOR as u64;
        write!(f, "{}{}.{:02}", sign, abs / per, abs % per)
    }
}

// Operators saturate. Balance changes go through `checked_*` and
// `Account::apply_delta`, which reject out-of-range results instead.

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Self::Output {
        Money(self.0.saturating_neg())
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, Money::saturating_add)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_major_units() {
        assert_eq!(Money::parse_major("100.00").unwrap(), Money::from_minor(10_000));
        assert_eq!(Money::parse_major("0.05").unwrap(), Money::from_minor(5));
        assert_eq!(Money::parse_major("7").unwrap(), Money::from_major(7));
        assert_eq!(Money::parse_major(" 12.5 ").unwrap(), Money::from_minor(1_250));
    }

    #[test]
    fn test_parse_rejects_sub_cent() {
        assert_eq!(
            Money::parse_major("1.001"),
            Err(MoneyError::TooManyDecimals(3))
        );
    }

    #[test]
    fn test_trailing_zeros_are_not_extra_precision() {
        assert_eq!(Money::parse_major("3.1000").unwrap(), Money::from_minor(310));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            Money::parse_major("abc"),
            Err(MoneyError::ParseError(_))
        ));
    }

    #[test]
    fn test_from_decimal() {
        assert_eq!(Money::try_from(dec!(10000.00)).unwrap(), Money::from_major(10_000));
        assert_eq!(Money::from_minor(-250).to_decimal(), dec!(-2.50));
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_minor(40_000).to_string(), "400.00");
        assert_eq!(Money::from_minor(-7).to_string(), "-0.07");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_major(5);
        let b = Money::from_minor(250);
        assert_eq!(a - b, Money::from_minor(250));
        assert_eq!(-b, Money::from_minor(-250));
        assert_eq!(vec![a, b].into_iter().sum::<Money>(), Money::from_minor(750));
        assert!(Money::from_minor(i64::MAX).checked_add(b).is_none());
    }

    #[test]
    fn test_operators_saturate() {
        let max = Money::from_minor(i64::MAX);
        let min = Money::from_minor(i64::MIN);
        assert_eq!(max + Money::from_minor(1), max);
        assert_eq!(min - Money::from_minor(1), min);
        assert_eq!(-min, max);
        assert_eq!(vec![max, max].into_iter().sum::<Money>(), max);
    }
}
