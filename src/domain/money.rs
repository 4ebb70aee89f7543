use crate::error::{DivisionError, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;

/// A monetary value in integer minor units (cents, fen, ...).
///
/// All division arithmetic happens on this type so that no share can ever
/// carry a fractional minor unit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Self = Self(0);

    pub const fn new(minor_units: u64) -> Self {
        Self(minor_units)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        Decimal::from(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        Self(iter.map(|a| a.0).fold(0u64, u64::saturating_add))
    }
}

impl<'a> Sum<&'a Amount> for Amount {
    fn sum<I: Iterator<Item = &'a Amount>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

/// Fraction of an order amount owed to a receiver, between 0 and 1 inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Ratio(Decimal);

impl Ratio {
    pub const ZERO: Self = Self(Decimal::ZERO);
    pub const ONE: Self = Self(Decimal::ONE);

    pub fn new(value: Decimal) -> Result<Self> {
        if value < Decimal::ZERO || value > Decimal::ONE {
            return Err(DivisionError::InvalidSplitConfig(format!(
                "ratio {value} is outside 0..=1"
            )));
        }
        Ok(Self(value))
    }

    /// Builds a ratio from a percentage, e.g. `30` for 30%.
    pub fn from_percent(percent: Decimal) -> Result<Self> {
        Self::new(percent / Decimal::ONE_HUNDRED)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Floor of `amount * ratio`, in minor units.
    pub fn share_of(&self, amount: Amount) -> Result<Amount> {
        let exact = Decimal::from(amount).checked_mul(self.0).ok_or_else(|| {
            DivisionError::IntegrityViolation(format!("{amount} * {} overflows", self.0))
        })?;
        exact.floor().to_u64().map(Amount::new).ok_or_else(|| {
            DivisionError::IntegrityViolation(format!("share {exact} is not representable"))
        })
    }
}

impl TryFrom<Decimal> for Ratio {
    type Error = DivisionError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Ratio> for Decimal {
    fn from(ratio: Ratio) -> Self {
        ratio.0
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount_arithmetic() {
        let a = Amount::new(10);
        let b = Amount::new(4);
        assert_eq!(a.checked_sub(b), Some(Amount::new(6)));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(b.saturating_sub(a), Amount::ZERO);
        assert_eq!(a.checked_add(b), Some(Amount::new(14)));
        assert_eq!(Amount::new(u64::MAX).checked_add(b), None);
    }

    #[test]
    fn test_amount_sum_saturates() {
        let total: Amount = [Amount::new(u64::MAX), Amount::new(1)].iter().sum();
        assert_eq!(total, Amount::new(u64::MAX));
    }

    #[test]
    fn test_ratio_validation() {
        assert!(Ratio::new(dec!(0)).is_ok());
        assert!(Ratio::new(dec!(1)).is_ok());
        assert!(matches!(
            Ratio::new(dec!(1.0001)),
            Err(DivisionError::InvalidSplitConfig(_))
        ));
        assert!(matches!(
            Ratio::new(dec!(-0.1)),
            Err(DivisionError::InvalidSplitConfig(_))
        ));
        assert_eq!(Ratio::from_percent(dec!(30)).unwrap().value(), dec!(0.3));
    }

    #[test]
    fn test_ratio_share_floors() {
        let ratio = Ratio::new(dec!(0.3333)).unwrap();
        assert_eq!(ratio.share_of(Amount::new(100)).unwrap(), Amount::new(33));
        assert_eq!(ratio.share_of(Amount::new(2)).unwrap(), Amount::ZERO);
        assert_eq!(
            Ratio::ONE.share_of(Amount::new(u64::MAX)).unwrap(),
            Amount::new(u64::MAX)
        );
    }

    #[test]
    fn test_ratio_deserialize_rejects_out_of_range() {
        let ok: Ratio = serde_json::from_str("\"0.25\"").unwrap();
        assert_eq!(ok.value(), dec!(0.25));
        assert!(serde_json::from_str::<Ratio>("\"1.5\"").is_err());
    }
}
