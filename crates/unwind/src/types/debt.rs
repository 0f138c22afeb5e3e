use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::position::{PairAmounts, PairSide};
use crate::errors::UnwindError;

/// Borrow direction of the money-market leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebtDirection {
    /// Collateral = token A, debt = token B.
    Direct,
    /// Collateral = token B, debt = token A.
    Reverse,
}

impl DebtDirection {
    pub fn collateral_side(self) -> PairSide {
        match self {
            Self::Direct => PairSide::A,
            Self::Reverse => PairSide::B,
        }
    }

    pub fn borrow_side(self) -> PairSide {
        self.collateral_side().other()
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Direct => Self::Reverse,
            Self::Reverse => Self::Direct,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Reverse => "reverse",
        }
    }
}

/// Collateral posted and debt owed in one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtLeg {
    #[serde(with = "rust_decimal::serde::str")]
    pub collateral: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_to_repay: Decimal,
}

impl DebtLeg {
    pub fn new(collateral: Decimal, amount_to_repay: Decimal) -> Self {
        Self {
            collateral,
            amount_to_repay,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.collateral <= Decimal::ZERO && self.amount_to_repay <= Decimal::ZERO
    }

    /// Collateral released when `repaid` of the debt is returned.
    pub fn collateral_for(&self, repaid: Decimal) -> Decimal {
        if self.amount_to_repay <= Decimal::ZERO || repaid >= self.amount_to_repay {
            return self.collateral;
        }
        self.collateral * repaid / self.amount_to_repay
    }

    /// The leg after repaying `repaid`.
    pub fn after_repay(&self, repaid: Decimal) -> DebtLeg {
        let released = self.collateral_for(repaid);
        DebtLeg::new(
            (self.collateral - released).max(Decimal::ZERO),
            (self.amount_to_repay - repaid).max(Decimal::ZERO),
        )
    }
}

/// Read-only projection of the money-market positions of a strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebtSnapshot {
    pub direct: DebtLeg,
    pub reverse: DebtLeg,
    /// Oracle USD prices of token A and token B.
    pub prices: PairAmounts,
}

impl DebtSnapshot {
    pub fn leg(&self, direction: DebtDirection) -> DebtLeg {
        match direction {
            DebtDirection::Direct => self.direct,
            DebtDirection::Reverse => self.reverse,
        }
    }

    /// The only non-empty direction, if any.
    ///
    /// Direct and reverse debts coexisting is state corruption.
    pub fn active(&self) -> Result<Option<(DebtDirection, DebtLeg)>, UnwindError> {
        match (self.direct.is_empty(), self.reverse.is_empty()) {
            (true, true) => Ok(None),
            (false, true) => Ok(Some((DebtDirection::Direct, self.direct))),
            (true, false) => Ok(Some((DebtDirection::Reverse, self.reverse))),
            (false, false) => Err(UnwindError::DebtDirectionConflict {
                direct: self.direct.amount_to_repay,
                reverse: self.reverse.amount_to_repay,
            }),
        }
    }

    /// Collateral plus debt expressed per side: locked assets minus owed assets.
    pub fn net_locked(&self) -> PairAmounts {
        PairAmounts::new(
            self.direct.collateral - self.reverse.amount_to_repay,
            self.reverse.collateral - self.direct.amount_to_repay,
        )
    }

    /// Whether both directions are at or below the per-asset dust floor.
    pub fn is_dust(&self, thresholds: &LiquidationThresholds) -> bool {
        self.direct.amount_to_repay <= thresholds.get(PairSide::B)
            && self.reverse.amount_to_repay <= thresholds.get(PairSide::A)
    }

    /// The larger of the two outstanding debts, in their own units.
    pub fn max_amount_to_repay(&self) -> Decimal {
        self.direct.amount_to_repay.max(self.reverse.amount_to_repay)
    }
}

/// Per-asset dust floor: amounts below it are treated as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiquidationThresholds {
    #[serde(with = "rust_decimal::serde::str")]
    pub a: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub b: Decimal,
}

impl LiquidationThresholds {
    pub fn new(a: Decimal, b: Decimal) -> Self {
        Self { a, b }
    }

    pub fn get(&self, side: PairSide) -> Decimal {
        match side {
            PairSide::A => self.a,
            PairSide::B => self.b,
        }
    }

    /// Floor rule: `amount` if it reaches the threshold, zero otherwise.
    pub fn floor(&self, side: PairSide, amount: Decimal) -> Decimal {
        if amount <= Decimal::ZERO || amount < self.get(side) {
            Decimal::ZERO
        } else {
            amount
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snapshot(direct: DebtLeg, reverse: DebtLeg) -> DebtSnapshot {
        DebtSnapshot {
            direct,
            reverse,
            prices: PairAmounts::new(dec!(1), dec!(1)),
        }
    }

    #[test]
    fn test_active_direction() {
        let s = snapshot(DebtLeg::new(dec!(100), dec!(50)), DebtLeg::default());
        let (dir, leg) = s.active().unwrap().unwrap();
        assert_eq!(dir, DebtDirection::Direct);
        assert_eq!(leg.amount_to_repay, dec!(50));

        let s = snapshot(DebtLeg::default(), DebtLeg::new(dec!(10), dec!(5)));
        assert_eq!(s.active().unwrap().unwrap().0, DebtDirection::Reverse);

        assert!(snapshot(DebtLeg::default(), DebtLeg::default())
            .active()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_coexisting_debts_rejected() {
        let s = snapshot(DebtLeg::new(dec!(100), dec!(50)), DebtLeg::new(dec!(1), dec!(1)));
        assert!(matches!(
            s.active(),
            Err(UnwindError::DebtDirectionConflict { .. })
        ));
    }

    #[test]
    fn test_partial_repay_releases_pro_rata() {
        let leg = DebtLeg::new(dec!(1000), dec!(500));
        assert_eq!(leg.collateral_for(dec!(100)), dec!(200));
        assert_eq!(leg.collateral_for(dec!(600)), dec!(1000));
        let after = leg.after_repay(dec!(100));
        assert_eq!(after, DebtLeg::new(dec!(800), dec!(400)));
    }

    #[test]
    fn test_floor_rule() {
        let t = LiquidationThresholds::new(dec!(0.01), dec!(5));
        assert_eq!(t.floor(PairSide::A, dec!(0.001)), Decimal::ZERO);
        assert_eq!(t.floor(PairSide::A, dec!(0.02)), dec!(0.02));
        assert_eq!(t.floor(PairSide::B, dec!(4.99)), Decimal::ZERO);
        assert_eq!(t.floor(PairSide::B, dec!(-1)), Decimal::ZERO);
    }

    #[test]
    fn test_dust_check_uses_borrow_asset_threshold() {
        let t = LiquidationThresholds::new(dec!(1), dec!(2));
        let s = snapshot(DebtLeg::new(dec!(3), dec!(1.5)), DebtLeg::default());
        assert!(s.is_dust(&t));
        let s = snapshot(DebtLeg::default(), DebtLeg::new(dec!(3), dec!(1.5)));
        assert!(!s.is_dust(&t));
    }
}
