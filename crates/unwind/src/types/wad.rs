//! Newtype wrapper for 18-decimals fixed-point values on the wire.
//!
//! Plan entry data carries proportions and debt amounts as WAD-scaled `U256`
//! words; the engine itself computes in `Decimal`.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;
use std::str::FromStr;

/// WAD-scaled value (18 decimals). Used for proportions and plan amounts.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Wad(pub U256);

const WAD_SCALE: Decimal = dec!(1_000_000_000_000_000_000);

impl Wad {
    pub const ONE: Wad = Wad(U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]));
    pub const ZERO: Wad = Wad(U256::ZERO);
    /// `2^256 - 1`, the "use the pool's natural proportion" sentinel.
    pub const MAX: Wad = Wad(U256::MAX);

    /// Convert on-chain WAD (U256) to off-chain `Decimal`.
    ///
    /// Returns `None` when the value does not fit a `Decimal` (e.g. the
    /// [`Wad::MAX`] sentinel).
    pub fn to_decimal(self) -> Option<Decimal> {
        let raw = Decimal::from_str(&self.0.to_string()).ok()?;
        Some(raw / WAD_SCALE)
    }

    /// Scale a non-negative `Decimal` to WAD, truncating below 1e-18.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        if value.is_sign_negative() {
            return None;
        }
        let scaled = value.checked_mul(WAD_SCALE)?.trunc();
        U256::from_str(&scaled.to_string()).ok().map(Self)
    }

    /// Create from a `U256` that is already WAD-scaled.
    pub fn from_raw(val: U256) -> Self {
        Self(val)
    }

    /// Inner `U256`.
    pub fn raw(self) -> U256 {
        self.0
    }
}

impl fmt::Debug for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_decimal() {
            Some(d) => write!(f, "Wad({d})"),
            None => write!(f, "Wad(raw {})", self.0),
        }
    }
}

impl fmt::Display for Wad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_decimal() {
            Some(d) => write!(f, "{d}"),
            None => write!(f, "{}", self.0),
        }
    }
}

impl From<U256> for Wad {
    fn from(val: U256) -> Self {
        Self(val)
    }
}

/// Convert basis points to a fraction `Decimal`.
pub fn bps_to_decimal(bps: u32) -> Decimal {
    Decimal::from(bps) / dec!(10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wad_one_is_one() {
        assert_eq!(Wad::ONE.to_decimal(), Some(dec!(1)));
    }

    #[test]
    fn test_wad_zero() {
        assert_eq!(Wad::ZERO.to_decimal(), Some(dec!(0)));
    }

    #[test]
    fn test_wad_half_proportion() {
        let half = Wad::from_raw(U256::from(500_000_000_000_000_000u128));
        assert_eq!(half.to_decimal(), Some(dec!(0.5)));
    }

    #[test]
    fn test_sentinel_does_not_convert() {
        assert_eq!(Wad::MAX.to_decimal(), None);
        assert_eq!(Wad(U256::MAX).to_decimal(), None);
    }

    #[test]
    fn test_from_decimal_truncates() {
        let w = Wad::from_decimal(dec!(2.5)).unwrap();
        assert_eq!(w.raw(), U256::from(2_500_000_000_000_000_000u128));
        let tiny = Wad::from_decimal(dec!(0.0000000000000000019)).unwrap();
        assert_eq!(tiny.raw(), U256::from(1u64));
    }

    #[test]
    fn test_from_decimal_rejects_negative() {
        assert!(Wad::from_decimal(dec!(-1)).is_none());
    }

    #[test]
    fn test_bps_to_decimal() {
        assert_eq!(bps_to_decimal(7500), dec!(0.75));
    }
}
