//! Collaborator interfaces the unwind engine drives.
//!
//! The engine never reaches a venue directly: every side effect goes through
//! one of these traits. Each stateful collaborator also implements
//! [`Checkpoint`] so a failed step can restore it to the state observed at
//! step entry.

use alloy::primitives::Address;
use rust_decimal::Decimal;

use crate::errors::UnwindError;
use crate::types::{DebtLeg, PairAmounts, SwapFill, SwapRequest};

/// Snapshot/restore used to make a step all-or-nothing.
pub trait Checkpoint {
    type Snapshot;

    fn checkpoint(&self) -> Self::Snapshot;
    fn restore(&mut self, snapshot: Self::Snapshot);
}

/// Money-market adapter: one borrow position per (collateral, borrow) pair.
pub trait MoneyMarket: Checkpoint {
    /// Oracle USD price of `asset`.
    fn price(&self, asset: Address) -> Result<Decimal, UnwindError>;

    /// Collateral posted and debt owed for the pair.
    fn position(&self, collateral_asset: Address, borrow_asset: Address) -> DebtLeg;

    /// Repay `amount` of the borrow asset. Returns the collateral released.
    fn repay(
        &mut self,
        collateral_asset: Address,
        borrow_asset: Address,
        amount: Decimal,
    ) -> Result<Decimal, UnwindError>;

    /// Post `collateral_amount` and borrow against it. Returns the amount borrowed.
    fn borrow(
        &mut self,
        collateral_asset: Address,
        collateral_amount: Decimal,
        borrow_asset: Address,
    ) -> Result<Decimal, UnwindError>;

    /// USD borrowed per USD of collateral for the pair.
    fn borrow_ratio(&self, collateral_asset: Address, borrow_asset: Address) -> Decimal;
}

/// Result of depositing into the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolEntry {
    /// Amounts actually taken from the strategy.
    pub consumed: PairAmounts,
    pub liquidity: Decimal,
    pub lower_tick: i32,
    pub upper_tick: i32,
}

/// Concentrated-liquidity depositor.
pub trait PoolDepositor: Checkpoint {
    /// Pool-side signal that the position has drifted out of its range.
    fn need_rebalance(&self) -> bool;
    fn current_tick(&self) -> i32;
    /// Price of token A expressed in token B.
    fn current_price(&self) -> Decimal;
    /// Value share of token B the current range requires, in `[0, 1]`.
    fn proportion_b(&self) -> Decimal;
    /// Amounts `liquidity` would return on exit, without exiting.
    fn quote_exit(&self, liquidity: Decimal) -> PairAmounts;
    fn exit(&mut self, liquidity: Decimal) -> Result<PairAmounts, UnwindError>;
    /// Deposit up to `amounts`; the range is chosen by the depositor.
    fn enter(&mut self, amounts: PairAmounts) -> Result<PoolEntry, UnwindError>;
}

/// Executes aggregator calldata.
pub trait SwapRouter: Checkpoint {
    /// Returns the amount of `fill.token_out` received.
    fn swap(&mut self, fill: &SwapFill) -> Result<Decimal, UnwindError>;
}

/// Vault-level profit holder and insurance reserve, shared by every strategy
/// of the vault. Passed into a step by `&mut`.
pub trait VaultSplitter: Checkpoint {
    fn profit_buffer(&self) -> Decimal;
    fn insurance_balance(&self) -> Decimal;
    fn insurance_target(&self) -> Decimal;
    fn consume_profit_buffer(&mut self, amount: Decimal) -> Result<(), UnwindError>;
    fn draw_insurance(&mut self, amount: Decimal) -> Result<(), UnwindError>;
    fn send_to_insurance(&mut self, amount: Decimal) -> Result<(), UnwindError>;
    /// Loss the vault share price has to absorb.
    fn register_uncovered_loss(&mut self, amount: Decimal);
}

/// Builds executable swap instructions. The only async collaborator: it is
/// called by the orchestration loop between `quote` and `step`.
#[allow(async_fn_in_trait)]
pub trait SwapAggregator {
    async fn build_swap(&self, request: &SwapRequest) -> Result<SwapFill, UnwindError>;
}
