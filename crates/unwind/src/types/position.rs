use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::UnwindError;

/// One of the two pool assets. `A` is always the underlying (vault asset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PairSide {
    A,
    B,
}

impl PairSide {
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "token_a",
            Self::B => "token_b",
        }
    }
}

/// A pair of amounts indexed by [`PairSide`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairAmounts {
    #[serde(with = "rust_decimal::serde::str")]
    pub a: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub b: Decimal,
}

impl PairAmounts {
    pub const ZERO: PairAmounts = PairAmounts {
        a: Decimal::ZERO,
        b: Decimal::ZERO,
    };

    pub fn new(a: Decimal, b: Decimal) -> Self {
        Self { a, b }
    }

    pub fn get(&self, side: PairSide) -> Decimal {
        match side {
            PairSide::A => self.a,
            PairSide::B => self.b,
        }
    }

    pub fn get_mut(&mut self, side: PairSide) -> &mut Decimal {
        match side {
            PairSide::A => &mut self.a,
            PairSide::B => &mut self.b,
        }
    }

    pub fn add(&self, other: &PairAmounts) -> PairAmounts {
        PairAmounts::new(self.a + other.a, self.b + other.b)
    }

    /// USD value given per-asset prices.
    pub fn value_usd(&self, prices: &PairAmounts) -> Decimal {
        self.a * prices.a + self.b * prices.b
    }

    /// Value share of token B, or `None` for an empty pair.
    pub fn share_b(&self, prices: &PairAmounts) -> Option<Decimal> {
        let total = self.value_usd(prices);
        if total <= Decimal::ZERO {
            return None;
        }
        Some(self.b * prices.b / total)
    }
}

/// Fuse circuit-breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FuseStatus {
    Disabled,
    Off,
    OnLowerLimit,
    OnUpperLimit,
}

impl FuseStatus {
    /// Whether the strategy is in forced-unwind mode.
    pub fn is_on(&self) -> bool {
        matches!(self, Self::OnLowerLimit | Self::OnUpperLimit)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Off => "off",
            Self::OnLowerLimit => "on_lower_limit",
            Self::OnUpperLimit => "on_upper_limit",
        }
    }
}

/// Hysteresis bounds on the pool price (token A priced in token B).
///
/// Array order follows the operator-facing convention
/// `[lower_on, lower_off, upper_on, upper_off]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FuseThresholds {
    #[serde(with = "rust_decimal::serde::str")]
    pub lower_on: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub lower_off: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub upper_on: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub upper_off: Decimal,
}

impl FuseThresholds {
    pub fn from_array(values: [Decimal; 4]) -> Self {
        Self {
            lower_on: values[0],
            lower_off: values[1],
            upper_on: values[2],
            upper_off: values[3],
        }
    }

    pub fn to_array(&self) -> [Decimal; 4] {
        [self.lower_on, self.lower_off, self.upper_on, self.upper_off]
    }

    /// Require `0 < lower_on < lower_off < upper_off < upper_on`.
    pub fn validate(&self) -> Result<(), UnwindError> {
        if self.lower_on <= Decimal::ZERO {
            return Err(UnwindError::InvalidFuseThresholds {
                reason: format!("lower_on ({}) must be > 0", self.lower_on),
            });
        }
        if !(self.lower_on < self.lower_off
            && self.lower_off < self.upper_off
            && self.upper_off < self.upper_on)
        {
            return Err(UnwindError::InvalidFuseThresholds {
                reason: format!(
                    "expected lower_on < lower_off < upper_off < upper_on, got {:?}",
                    self.to_array()
                ),
            });
        }
        Ok(())
    }
}

/// Durable record of a pair strategy. Persisted as a single record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionState {
    pub token_a: Address,
    pub token_b: Address,
    pub pool: Address,
    /// Fuse is evaluated only for pairs expected to trade near 1:1.
    pub stable_pool: bool,
    pub tick_spacing: i32,
    pub lower_tick: i32,
    pub upper_tick: i32,
    pub rebalance_tick_range: i32,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_liquidity: Decimal,
    pub fuse_status: FuseStatus,
    pub fuse_thresholds: FuseThresholds,
    pub withdraw_done: bool,
    pub last_rebalance_no_swap: u64,
    /// Invested assets in underlying units at the end of the last operation.
    #[serde(with = "rust_decimal::serde::str")]
    pub invested_assets: Decimal,
    /// Losses covered by the insurance reserve that later gains repay first.
    #[serde(with = "rust_decimal::serde::str")]
    pub debt_to_insurance: Decimal,
}

impl PositionState {
    /// Fresh state for a newly initialised strategy.
    ///
    /// Non-stable pairs start with the fuse OFF; it is never evaluated for them.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        token_a: Address,
        token_b: Address,
        pool: Address,
        stable_pool: bool,
        tick_spacing: i32,
        lower_tick: i32,
        upper_tick: i32,
        rebalance_tick_range: i32,
        fuse_thresholds: FuseThresholds,
    ) -> Self {
        Self {
            token_a,
            token_b,
            pool,
            stable_pool,
            tick_spacing,
            lower_tick,
            upper_tick,
            rebalance_tick_range,
            total_liquidity: Decimal::ZERO,
            fuse_status: FuseStatus::Off,
            fuse_thresholds,
            withdraw_done: false,
            last_rebalance_no_swap: 0,
            invested_assets: Decimal::ZERO,
            debt_to_insurance: Decimal::ZERO,
        }
    }

    /// Address of the given side.
    pub fn token(&self, side: PairSide) -> Address {
        match side {
            PairSide::A => self.token_a,
            PairSide::B => self.token_b,
        }
    }

    /// Map an address back to its side of the pair.
    pub fn side_of(&self, token: Address) -> Option<PairSide> {
        if token == self.token_a {
            Some(PairSide::A)
        } else if token == self.token_b {
            Some(PairSide::B)
        } else {
            None
        }
    }

    /// `withdraw_done` may only be set while the fuse is ON.
    pub fn ensure_consistent(&self) -> Result<(), UnwindError> {
        if self.withdraw_done && !self.fuse_status.is_on() {
            return Err(UnwindError::FuseInconsistency {
                status: self.fuse_status.as_str().into(),
            });
        }
        Ok(())
    }
}
