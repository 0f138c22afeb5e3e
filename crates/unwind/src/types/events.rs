use alloy::primitives::Address;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::debt::DebtDirection;

/// Loss of one operation and how much of it the profit buffer absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebalancedEvent {
    #[serde(with = "rust_decimal::serde::str")]
    pub loss: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub profit_to_cover: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub covered_by_rewards: Decimal,
}

/// Invested assets drift observed between operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixPriceChangesEvent {
    #[serde(with = "rust_decimal::serde::str")]
    pub invested_assets_before: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub invested_assets_out: Decimal,
}

/// Insurance draw for a loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverLossEvent {
    #[serde(with = "rust_decimal::serde::str")]
    pub loss: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_covered: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub debt_to_insurance_inc: Decimal,
}

/// Gain routed to the insurance reserve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendToInsuranceEvent {
    #[serde(with = "rust_decimal::serde::str")]
    pub sent_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub unsent_amount: Decimal,
}

/// Swap executed through an aggregator fill.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapByAggEvent {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_in: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_out: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_out_expected: Decimal,
    pub aggregator: Address,
}

/// Borrow opened to restore the pool proportion before entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowedEvent {
    pub direction: DebtDirection,
    #[serde(with = "rust_decimal::serde::str")]
    pub collateral: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrowed: Decimal,
}

/// Deposit of leftover balances into the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnteredPoolEvent {
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_a: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount_b: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidity: Decimal,
}

/// Accounting artifact of one step. Consumed by the caller, never persisted
/// as strategy state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsSet {
    pub rebalanced: Option<RebalancedEvent>,
    pub fix_price_changes: Option<FixPriceChangesEvent>,
    pub cover_loss: Vec<CoverLossEvent>,
    #[serde(with = "decimal_vec")]
    pub uncovered_loss: Vec<Decimal>,
    pub send_to_insurance: Vec<SendToInsuranceEvent>,
    #[serde(with = "decimal_vec")]
    pub to_distribution: Vec<Decimal>,
    pub swap_by_agg: Option<SwapByAggEvent>,
    pub borrowed: Option<BorrowedEvent>,
    pub entered_pool: Option<EnteredPoolEvent>,
}

impl EventsSet {
    pub fn total_uncovered(&self) -> Decimal {
        self.uncovered_loss.iter().copied().sum()
    }

    pub fn total_covered_by_insurance(&self) -> Decimal {
        self.cover_loss.iter().map(|e| e.amount_covered).sum()
    }

    pub fn total_sent_to_insurance(&self) -> Decimal {
        self.send_to_insurance.iter().map(|e| e.sent_amount).sum()
    }
}

/// Decimal vectors as JSON string arrays.
mod decimal_vec {
    use rust_decimal::Decimal;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(values: &[Decimal], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let strings: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        strings.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Decimal>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| Decimal::from_str(s).map_err(serde::de::Error::custom))
            .collect()
    }
}
