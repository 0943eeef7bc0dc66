//! Fixed-precision decimal types for funding arithmetic.
//!
//! Rates are per-day interest fractions carried at 12 fractional digits;
//! amounts are currency quantities carried at 8. Both wrap `rust_decimal`
//! so arithmetic stays exact; only the decision engine's rate-weighted
//! sums drop to `f64`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Mul, Sub};
use std::str::FromStr;

/// Fractional digits carried by a `Rate`.
pub const RATE_SCALE: u32 = 12;
/// Fractional digits carried by an `Amount`.
pub const AMOUNT_SCALE: u32 = 8;

/// Per-day interest rate as a fraction (not a percentage).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rate(pub Decimal);

impl Rate {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Build from integer units at 12 fractional digits
    /// (`4_111_000_000` units = 0.004111/day).
    #[inline]
    pub fn from_units(units: u64) -> Self {
        Self(Decimal::from_i128_with_scale(units as i128, RATE_SCALE))
    }

    /// Integer units at 12 fractional digits, rounding past digits away.
    #[inline]
    pub fn units(&self) -> u64 {
        let mut d = self.0;
        d.rescale(RATE_SCALE);
        d.mantissa().max(0) as u64
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Lossy conversion for the engine's weighted averages.
    #[inline]
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Rate {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Rate {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

/// Currency amount at 8 fractional digits.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(pub Decimal);

impl Amount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Build from integer units at 8 fractional digits
    /// (`155_000_000` units = 1.55).
    #[inline]
    pub fn from_units(units: u64) -> Self {
        Self(Decimal::from_i128_with_scale(units as i128, AMOUNT_SCALE))
    }

    /// Integer units at 8 fractional digits.
    #[inline]
    pub fn units(&self) -> u64 {
        let mut d = self.0;
        d.rescale(AMOUNT_SCALE);
        d.mantissa().max(0) as u64
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Subtraction clamped at zero; amounts never go negative.
    #[inline]
    pub fn saturating_sub(&self, rhs: Amount) -> Amount {
        if rhs.0 >= self.0 {
            Amount::ZERO
        } else {
            Amount(self.0 - rhs.0)
        }
    }

    #[inline]
    pub fn min(&self, rhs: Amount) -> Amount {
        if self.0 <= rhs.0 {
            *self
        } else {
            rhs
        }
    }

    /// Lossy conversion for the engine's weighted averages.
    #[inline]
    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Amount {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Amount {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Mul for Amount {
    type Output = Self;

    /// Product of two amounts (position size times base price).
    fn mul(self, rhs: Self) -> Self::Output {
        Self(self.0 * rhs.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).sum())
    }
}
