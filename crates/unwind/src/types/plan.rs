//! Withdrawal plans and their ABI-style entry-data encoding.
//!
//! Wire layout is a tuple of 32-byte big-endian words:
//! `(kind, propNotUnderlying18[, debtAmountToReduce18])`.

use alloy::primitives::{Address, U256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::wad::Wad;
use crate::errors::UnwindError;

pub const PLAN_SWAP_REPAY: u64 = 0;
pub const PLAN_REPAY_SWAP_REPAY: u64 = 1;
pub const PLAN_SWAP_ONLY: u64 = 2;

const WORD: usize = 32;

/// Target value share of the non-underlying asset (token B).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum PropTarget {
    /// Fixed fraction in `[0, 1]`.
    Fixed(#[serde(with = "rust_decimal::serde::str")] Decimal),
    /// Whatever the pool's current range requires.
    PoolProportion,
}

impl PropTarget {
    pub fn validate(&self) -> Result<(), UnwindError> {
        if let Self::Fixed(p) = self {
            if *p < Decimal::ZERO || *p > Decimal::ONE {
                return Err(UnwindError::ProportionOutOfRange {
                    value: p.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Resolve against the pool's current proportion.
    pub fn resolve(&self, pool_proportion: Decimal) -> Decimal {
        match self {
            Self::Fixed(p) => *p,
            Self::PoolProportion => pool_proportion,
        }
    }

    fn to_word(self) -> Result<U256, UnwindError> {
        match self {
            Self::PoolProportion => Ok(Wad::MAX.raw()),
            Self::Fixed(p) => {
                self.validate()?;
                Wad::from_decimal(p)
                    .map(Wad::raw)
                    .ok_or_else(|| UnwindError::ProportionOutOfRange {
                        value: p.to_string(),
                    })
            }
        }
    }

    fn from_word(word: U256) -> Result<Self, UnwindError> {
        if word == U256::MAX {
            return Ok(Self::PoolProportion);
        }
        if word > Wad::ONE.raw() {
            return Err(UnwindError::ProportionOutOfRange {
                value: Wad(word).to_string(),
            });
        }
        let p = Wad(word)
            .to_decimal()
            .ok_or_else(|| UnwindError::ProportionOutOfRange {
                value: word.to_string(),
            })?;
        Ok(Self::Fixed(p))
    }
}

/// How a withdrawal step combines swapping and debt repayment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Plan {
    /// Swap, then repay with the proceeds.
    SwapRepay { prop: PropTarget },
    /// Repay with what is on hand, swap to cover `debt_amount_to_reduce`, repay again.
    RepaySwapRepay {
        prop: PropTarget,
        #[serde(with = "rust_decimal::serde::str")]
        debt_amount_to_reduce: Decimal,
    },
    /// Swap towards the target proportion without touching debt.
    SwapOnly { prop: PropTarget },
}

impl Plan {
    pub fn kind(&self) -> u64 {
        match self {
            Self::SwapRepay { .. } => PLAN_SWAP_REPAY,
            Self::RepaySwapRepay { .. } => PLAN_REPAY_SWAP_REPAY,
            Self::SwapOnly { .. } => PLAN_SWAP_ONLY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SwapRepay { .. } => "swap_repay",
            Self::RepaySwapRepay { .. } => "repay_swap_repay",
            Self::SwapOnly { .. } => "swap_only",
        }
    }

    pub fn prop(&self) -> PropTarget {
        match self {
            Self::SwapRepay { prop } | Self::SwapOnly { prop } => *prop,
            Self::RepaySwapRepay { prop, .. } => *prop,
        }
    }

    /// Whether the plan interacts with the money-market leg.
    pub fn repays_debt(&self) -> bool {
        !matches!(self, Self::SwapOnly { .. })
    }

    pub fn validate(&self) -> Result<(), UnwindError> {
        self.prop().validate()?;
        if let Self::RepaySwapRepay {
            debt_amount_to_reduce,
            ..
        } = self
        {
            if debt_amount_to_reduce.is_sign_negative() {
                return Err(UnwindError::MalformedPlan {
                    reason: format!("negative debt_amount_to_reduce {debt_amount_to_reduce}"),
                });
            }
        }
        Ok(())
    }

    /// Encode as consecutive 32-byte big-endian words.
    pub fn encode(&self) -> Result<Vec<u8>, UnwindError> {
        let mut words = vec![U256::from(self.kind()), self.prop().to_word()?];
        if let Self::RepaySwapRepay {
            debt_amount_to_reduce,
            ..
        } = self
        {
            let amount = Wad::from_decimal(*debt_amount_to_reduce).ok_or_else(|| {
                UnwindError::MalformedPlan {
                    reason: format!("debt_amount_to_reduce {debt_amount_to_reduce} not encodable"),
                }
            })?;
            words.push(amount.raw());
        }
        Ok(words
            .iter()
            .flat_map(|w| w.to_be_bytes::<WORD>())
            .collect())
    }

    /// Decode entry data produced by [`Plan::encode`] (or an off-chain caller).
    pub fn decode(data: &[u8]) -> Result<Self, UnwindError> {
        if data.len() % WORD != 0 || data.len() < 2 * WORD {
            return Err(UnwindError::MalformedPlan {
                reason: format!("entry data length {} is not 2 or 3 words", data.len()),
            });
        }
        let words: Vec<U256> = data.chunks(WORD).map(U256::from_be_slice).collect();

        let kind = words[0];
        let prop = PropTarget::from_word(words[1])?;

        let plan = if kind == U256::from(PLAN_SWAP_REPAY) {
            Self::SwapRepay { prop }
        } else if kind == U256::from(PLAN_SWAP_ONLY) {
            Self::SwapOnly { prop }
        } else if kind == U256::from(PLAN_REPAY_SWAP_REPAY) {
            let raw = words.get(2).copied().ok_or_else(|| UnwindError::MalformedPlan {
                reason: "repay_swap_repay requires debt_amount_to_reduce".into(),
            })?;
            let debt_amount_to_reduce =
                Wad(raw).to_decimal().ok_or_else(|| UnwindError::MalformedPlan {
                    reason: format!("debt_amount_to_reduce {raw} out of range"),
                })?;
            Self::RepaySwapRepay {
                prop,
                debt_amount_to_reduce,
            }
        } else {
            return Err(UnwindError::InvalidPlanKind {
                kind: kind.to_string(),
            });
        };

        let expected_words = if plan.kind() == PLAN_REPAY_SWAP_REPAY { 3 } else { 2 };
        if words.len() != expected_words {
            return Err(UnwindError::MalformedPlan {
                reason: format!(
                    "{} expects {expected_words} words, got {}",
                    plan.name(),
                    words.len()
                ),
            });
        }
        Ok(plan)
    }

    /// `0x`-prefixed hex of [`Plan::encode`].
    pub fn entry_data_hex(&self) -> Result<String, UnwindError> {
        Ok(format!("0x{}", hex::encode(self.encode()?)))
    }

    /// Decode hex entry data, with or without the `0x` prefix.
    pub fn from_entry_data_hex(data: &str) -> Result<Self, UnwindError> {
        let digits = data.strip_prefix("0x").unwrap_or(data);
        let bytes = hex::decode(digits).map_err(|e| UnwindError::MalformedPlan {
            reason: format!("entry data is not hex: {e}"),
        })?;
        Self::decode(&bytes)
    }
}

/// Whether leftover balances go back into the pool at the end of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryToPool {
    Disabled,
    Allowed,
    AllowedIfCompleted,
}

impl EntryToPool {
    pub fn permits(&self, completed: bool) -> bool {
        match self {
            Self::Disabled => false,
            Self::Allowed => true,
            Self::AllowedIfCompleted => completed,
        }
    }
}

/// Planner output: what to sell this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// `None` means no swap is required this step.
    pub token_to_swap: Option<Address>,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_to_swap: Decimal,
}

impl Quote {
    pub fn none() -> Self {
        Self {
            token_to_swap: None,
            amount_to_swap: Decimal::ZERO,
        }
    }

    pub fn is_swap_required(&self) -> bool {
        self.token_to_swap.is_some() && self.amount_to_swap > Decimal::ZERO
    }
}
