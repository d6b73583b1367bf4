use crate::error::{LedgerError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

/// A signed monetary value in integer minor units (e.g. cents).
///
/// All ledger arithmetic happens on this type; floating point never touches money.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Self = Self(0);

    pub const fn new(minor_units: i64) -> Self {
        Self(minor_units)
    }

    pub const fn minor_units(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn abs(&self) -> Self {
        Self(self.0.abs())
    }

    pub fn checked_add(self, rhs: Self) -> Result<Self> {
        self.0
            .checked_add(rhs.0)
            .map(Self)
            .ok_or_else(|| LedgerError::ValidationError("monetary overflow".to_string()))
    }

    pub fn checked_sub(self, rhs: Self) -> Result<Self> {
        self.0
            .checked_sub(rhs.0)
            .map(Self)
            .ok_or_else(|| LedgerError::ValidationError("monetary overflow".to_string()))
    }

    /// Converts a decimal major-unit amount ("123.45") into minor units.
    ///
    /// Rejects values carrying more precision than `scale` digits, so a feed can never
    /// smuggle in a fraction of a cent.
    pub fn from_decimal(value: Decimal, scale: u32) -> Result<Self> {
        let factor = 10i64
            .checked_pow(scale)
            .map(Decimal::from)
            .ok_or_else(|| LedgerError::ValidationError(format!("scale {} out of range", scale)))?;
        let scaled = value
            .checked_mul(factor)
            .ok_or_else(|| LedgerError::ValidationError(format!("amount {} out of range", value)))?;
        if scaled.fract() != Decimal::ZERO {
            return Err(LedgerError::ValidationError(format!(
                "amount {} has more than {} decimal places",
                value, scale
            )));
        }
        scaled
            .to_i64()
            .map(Self)
            .ok_or_else(|| LedgerError::ValidationError(format!("amount {} out of range", value)))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Self;
    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + m)
    }
}

impl<'a> Sum<&'a Money> for Money {
    fn sum<I: Iterator<Item = &'a Money>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, m| acc + *m)
    }
}

/// A strictly positive amount, used wherever a request names "how much".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Amount(Money);

impl Amount {
    pub fn new(minor_units: i64) -> Result<Self> {
        if minor_units > 0 {
            Ok(Self(Money(minor_units)))
        } else {
            Err(LedgerError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn money(&self) -> Money {
        self.0
    }
}

impl TryFrom<i64> for Amount {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self> {
        Self::new(value)
    }
}

impl TryFrom<Money> for Amount {
    type Error = LedgerError;

    fn try_from(value: Money) -> Result<Self> {
        Self::new(value.0)
    }
}

impl From<Amount> for i64 {
    fn from(amount: Amount) -> Self {
        amount.0.0
    }
}

impl From<Amount> for Money {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}
