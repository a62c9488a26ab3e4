use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

/// A token amount in base units. Contract payouts routinely exceed what a
/// u64 can hold, so amounts are 128-bit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Currency(u128);

impl Currency {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(u128::MAX);

    pub const fn new(base_units: u128) -> Self {
        Self(base_units)
    }

    pub const fn from_u64(value: u64) -> Self {
        Self(value as u128)
    }

    pub const fn base_units(&self) -> u128 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Self) -> Option<Self> {
        self.0.checked_add(other.0).map(Self)
    }

    pub fn checked_sub(self, other: Self) -> Option<Self> {
        self.0.checked_sub(other.0).map(Self)
    }

    pub fn checked_mul_u64(self, factor: u64) -> Option<Self> {
        self.0.checked_mul(factor as u128).map(Self)
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Sums an iterator of amounts, returning `None` on overflow.
    pub fn checked_sum<I: IntoIterator<Item = Currency>>(amounts: I) -> Option<Self> {
        amounts
            .into_iter()
            .try_fold(Currency::ZERO, |acc, v| acc.checked_add(v))
    }
}

impl From<u64> for Currency {
    fn from(value: u64) -> Self {
        Self(value as u128)
    }
}

impl Sum for Currency {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Currency::ZERO, |acc, v| acc.saturating_add(v))
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
