//! In-memory venues for dry runs and tests.
//!
//! Every venue prices through the same oracle map, is deterministic, and
//! supports failure injection (repay failure, pool entry failure, swap
//! haircut) so the atomic-step rollback can be exercised end to end.
//! [`PaperStore`] persists the venues next to the position record so a dry
//! run can resume where it stopped.

use std::collections::HashMap;
use std::path::PathBuf;

use alloy::primitives::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::adapters::{
    Checkpoint, MoneyMarket, PoolDepositor, PoolEntry, SwapAggregator, SwapRouter, VaultSplitter,
};
use super::state_store::JsonStateStore;
use crate::config::PaperConfig;
use crate::core::orchestrator::StepStore;
use crate::core::strategy::PairStrategy;
use crate::errors::UnwindError;
use crate::types::wad::bps_to_decimal;
use crate::types::{DebtLeg, PairAmounts, PositionState, SwapFill, SwapRequest, Wad};

pub type PaperStrategy = PairStrategy<PaperMoneyMarket, PaperPool, PaperSwapRouter>;

/// Oracle USD prices keyed by token.
pub type PaperPrices = HashMap<Address, Decimal>;

fn oracle_price(prices: &PaperPrices, asset: Address) -> Result<Decimal, UnwindError> {
    prices
        .get(&asset)
        .copied()
        .filter(|p| *p > Decimal::ZERO)
        .ok_or_else(|| UnwindError::adapter("oracle", format!("no price for {asset}")))
}

/// `amount` of `token_in` converted to `token_out` at oracle prices.
fn oracle_out(
    prices: &PaperPrices,
    token_in: Address,
    token_out: Address,
    amount: Decimal,
) -> Result<Decimal, UnwindError> {
    Ok(amount * oracle_price(prices, token_in)? / oracle_price(prices, token_out)?)
}

fn bps_factor(bps: u32) -> Decimal {
    Decimal::ONE - bps_to_decimal(bps)
}

// ---------------------------------------------------------------------------
// Money market
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PaperMoneyMarket {
    prices: PaperPrices,
    positions: HashMap<(Address, Address), DebtLeg>,
    borrow_ratio: Decimal,
    /// Every repay reverts while set.
    pub fail_repay: bool,
}

impl PaperMoneyMarket {
    pub fn new(prices: PaperPrices, borrow_ratio: Decimal) -> Self {
        Self {
            prices,
            positions: HashMap::new(),
            borrow_ratio,
            fail_repay: false,
        }
    }

    /// Seed an existing borrow position.
    pub fn with_position(mut self, collateral_asset: Address, borrow_asset: Address, leg: DebtLeg) -> Self {
        self.positions.insert((collateral_asset, borrow_asset), leg);
        self
    }

    pub fn set_price(&mut self, asset: Address, price: Decimal) {
        self.prices.insert(asset, price);
    }
}

impl Checkpoint for PaperMoneyMarket {
    type Snapshot = HashMap<(Address, Address), DebtLeg>;

    fn checkpoint(&self) -> Self::Snapshot {
        self.positions.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        self.positions = snapshot;
    }
}

impl MoneyMarket for PaperMoneyMarket {
    fn price(&self, asset: Address) -> Result<Decimal, UnwindError> {
        oracle_price(&self.prices, asset)
    }

    fn position(&self, collateral_asset: Address, borrow_asset: Address) -> DebtLeg {
        self.positions
            .get(&(collateral_asset, borrow_asset))
            .copied()
            .unwrap_or_default()
    }

    fn repay(
        &mut self,
        collateral_asset: Address,
        borrow_asset: Address,
        amount: Decimal,
    ) -> Result<Decimal, UnwindError> {
        if self.fail_repay {
            return Err(UnwindError::adapter("money market", "repay reverted"));
        }
        let leg = self.position(collateral_asset, borrow_asset);
        if amount > leg.amount_to_repay {
            return Err(UnwindError::adapter(
                "money market",
                format!("repay {amount} exceeds debt {}", leg.amount_to_repay),
            ));
        }
        let released = leg.collateral_for(amount);
        let after = leg.after_repay(amount);
        if after.is_empty() {
            self.positions.remove(&(collateral_asset, borrow_asset));
        } else {
            self.positions.insert((collateral_asset, borrow_asset), after);
        }
        debug!(%amount, %released, "paper repay");
        Ok(released)
    }

    fn borrow(
        &mut self,
        collateral_asset: Address,
        collateral_amount: Decimal,
        borrow_asset: Address,
    ) -> Result<Decimal, UnwindError> {
        if collateral_amount <= Decimal::ZERO {
            return Err(UnwindError::adapter("money market", "zero collateral"));
        }
        let borrowed =
            oracle_out(&self.prices, collateral_asset, borrow_asset, collateral_amount)? * self.borrow_ratio;
        let leg = self.position(collateral_asset, borrow_asset);
        self.positions.insert(
            (collateral_asset, borrow_asset),
            DebtLeg::new(leg.collateral + collateral_amount, leg.amount_to_repay + borrowed),
        );
        debug!(%collateral_amount, %borrowed, "paper borrow");
        Ok(borrowed)
    }

    fn borrow_ratio(&self, _collateral_asset: Address, _borrow_asset: Address) -> Decimal {
        self.borrow_ratio
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Value-based concentrated-liquidity stand-in. Liquidity is measured in
/// token-B value; deposits are taken at the configured B share.
#[derive(Debug, Clone)]
pub struct PaperPool {
    price: Decimal,
    proportion_b: Decimal,
    tick: i32,
    tick_spacing: i32,
    half_width: i32,
    lower_tick: i32,
    upper_tick: i32,
    out_of_range: bool,
    reserves: PairAmounts,
    liquidity: Decimal,
    pub fail_enter: bool,
}

impl PaperPool {
    pub fn new(price: Decimal, proportion_b: Decimal, tick: i32, tick_spacing: i32, half_width: i32) -> Self {
        let (lower_tick, upper_tick) = range_around(tick, tick_spacing, half_width);
        Self {
            price,
            proportion_b,
            tick,
            tick_spacing,
            half_width,
            lower_tick,
            upper_tick,
            out_of_range: false,
            reserves: PairAmounts::ZERO,
            liquidity: Decimal::ZERO,
            fail_enter: false,
        }
    }

    /// Seed an existing deposit.
    pub fn with_deposit(mut self, reserves: PairAmounts, liquidity: Decimal) -> Self {
        self.reserves = reserves;
        self.liquidity = liquidity;
        self
    }

    pub fn set_price(&mut self, price: Decimal) {
        self.price = price;
    }

    pub fn set_tick(&mut self, tick: i32) {
        self.tick = tick;
    }

    pub fn set_out_of_range(&mut self, out_of_range: bool) {
        self.out_of_range = out_of_range;
    }

    pub fn range(&self) -> (i32, i32) {
        (self.lower_tick, self.upper_tick)
    }

    pub fn liquidity(&self) -> Decimal {
        self.liquidity
    }

    pub fn reserves(&self) -> PairAmounts {
        self.reserves
    }
}

fn range_around(tick: i32, spacing: i32, half_width: i32) -> (i32, i32) {
    let spacing = spacing.max(1);
    let center = tick - tick.rem_euclid(spacing);
    (center - half_width, center + half_width)
}

impl Checkpoint for PaperPool {
    type Snapshot = PaperPool;

    fn checkpoint(&self) -> Self::Snapshot {
        self.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        *self = snapshot;
    }
}

impl PoolDepositor for PaperPool {
    fn need_rebalance(&self) -> bool {
        self.out_of_range
    }

    fn current_tick(&self) -> i32 {
        self.tick
    }

    fn current_price(&self) -> Decimal {
        self.price
    }

    fn proportion_b(&self) -> Decimal {
        self.proportion_b
    }

    fn quote_exit(&self, liquidity: Decimal) -> PairAmounts {
        if self.liquidity <= Decimal::ZERO || liquidity <= Decimal::ZERO {
            return PairAmounts::ZERO;
        }
        let share = (liquidity / self.liquidity).min(Decimal::ONE);
        PairAmounts::new(self.reserves.a * share, self.reserves.b * share)
    }

    fn exit(&mut self, liquidity: Decimal) -> Result<PairAmounts, UnwindError> {
        if liquidity > self.liquidity {
            return Err(UnwindError::adapter(
                "pool",
                format!("exit {liquidity} exceeds liquidity {}", self.liquidity),
            ));
        }
        let amounts = self.quote_exit(liquidity);
        self.reserves = PairAmounts::new(self.reserves.a - amounts.a, self.reserves.b - amounts.b);
        self.liquidity -= liquidity;
        Ok(amounts)
    }

    fn enter(&mut self, amounts: PairAmounts) -> Result<PoolEntry, UnwindError> {
        if self.fail_enter {
            return Err(UnwindError::PoolEntryFailed {
                reason: "paper pool rejected the deposit".into(),
            });
        }
        let p = self.proportion_b;
        let value_a = amounts.a.max(Decimal::ZERO) * self.price;
        let value_b = amounts.b.max(Decimal::ZERO);

        let total = if p <= Decimal::ZERO {
            value_a
        } else if p >= Decimal::ONE {
            value_b
        } else {
            (value_a / (Decimal::ONE - p)).min(value_b / p)
        };
        if total <= Decimal::ZERO || self.price <= Decimal::ZERO {
            return Err(UnwindError::PoolEntryFailed {
                reason: format!("nothing to deposit for proportion {p}"),
            });
        }

        let consumed = PairAmounts::new(
            (total * (Decimal::ONE - p) / self.price).min(amounts.a),
            (total * p).min(amounts.b),
        );
        let (lower_tick, upper_tick) = range_around(self.tick, self.tick_spacing, self.half_width);
        self.lower_tick = lower_tick;
        self.upper_tick = upper_tick;
        self.out_of_range = false;
        self.reserves = self.reserves.add(&consumed);
        self.liquidity += total;

        Ok(PoolEntry {
            consumed,
            liquidity: total,
            lower_tick,
            upper_tick,
        })
    }
}

// ---------------------------------------------------------------------------
// Swap router
// ---------------------------------------------------------------------------

/// Fills swaps at oracle price minus slippage and an optional haircut.
#[derive(Debug, Clone)]
pub struct PaperSwapRouter {
    prices: PaperPrices,
    slippage_bps: u32,
    /// Extra shortfall applied to every fill, in percent.
    pub haircut_pct: Decimal,
    swaps_executed: u32,
}

impl PaperSwapRouter {
    pub fn new(prices: PaperPrices, slippage_bps: u32) -> Self {
        Self {
            prices,
            slippage_bps,
            haircut_pct: Decimal::ZERO,
            swaps_executed: 0,
        }
    }

    pub fn swaps_executed(&self) -> u32 {
        self.swaps_executed
    }

    pub fn set_price(&mut self, asset: Address, price: Decimal) {
        self.prices.insert(asset, price);
    }
}

impl Checkpoint for PaperSwapRouter {
    type Snapshot = u32;

    fn checkpoint(&self) -> u32 {
        self.swaps_executed
    }

    fn restore(&mut self, snapshot: u32) {
        self.swaps_executed = snapshot;
    }
}

impl SwapRouter for PaperSwapRouter {
    fn swap(&mut self, fill: &SwapFill) -> Result<Decimal, UnwindError> {
        let haircut = Decimal::ONE - self.haircut_pct / dec!(100);
        let out = oracle_out(&self.prices, fill.token_in, fill.token_out, fill.amount_in)?
            * bps_factor(self.slippage_bps)
            * haircut;
        self.swaps_executed += 1;
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Vault / insurance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperVault {
    #[serde(with = "rust_decimal::serde::str")]
    pub profit_buffer: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub insurance_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub insurance_target: Decimal,
    /// Cumulative loss reported to the share price.
    #[serde(with = "rust_decimal::serde::str")]
    pub uncovered_total: Decimal,
}

impl PaperVault {
    pub fn new(profit_buffer: Decimal, insurance_balance: Decimal, insurance_target: Decimal) -> Self {
        Self {
            profit_buffer,
            insurance_balance,
            insurance_target,
            uncovered_total: Decimal::ZERO,
        }
    }
}

impl Checkpoint for PaperVault {
    type Snapshot = PaperVault;

    fn checkpoint(&self) -> Self::Snapshot {
        self.clone()
    }

    fn restore(&mut self, snapshot: Self::Snapshot) {
        *self = snapshot;
    }
}

impl VaultSplitter for PaperVault {
    fn profit_buffer(&self) -> Decimal {
        self.profit_buffer
    }

    fn insurance_balance(&self) -> Decimal {
        self.insurance_balance
    }

    fn insurance_target(&self) -> Decimal {
        self.insurance_target
    }

    fn consume_profit_buffer(&mut self, amount: Decimal) -> Result<(), UnwindError> {
        if amount > self.profit_buffer {
            return Err(UnwindError::adapter("vault", "profit buffer overdrawn"));
        }
        self.profit_buffer -= amount;
        Ok(())
    }

    fn draw_insurance(&mut self, amount: Decimal) -> Result<(), UnwindError> {
        if amount > self.insurance_balance {
            return Err(UnwindError::adapter("vault", "insurance overdrawn"));
        }
        self.insurance_balance -= amount;
        Ok(())
    }

    fn send_to_insurance(&mut self, amount: Decimal) -> Result<(), UnwindError> {
        self.insurance_balance += amount;
        Ok(())
    }

    fn register_uncovered_loss(&mut self, amount: Decimal) {
        self.uncovered_total += amount;
    }
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Builds fills at oracle price minus a declared slippage.
#[derive(Debug, Clone)]
pub struct PaperAggregator {
    prices: PaperPrices,
    slippage_bps: u32,
    router: Address,
}

impl PaperAggregator {
    pub fn new(prices: PaperPrices, slippage_bps: u32, router: Address) -> Self {
        Self {
            prices,
            slippage_bps,
            router,
        }
    }
}

impl SwapAggregator for PaperAggregator {
    async fn build_swap(&self, request: &SwapRequest) -> Result<SwapFill, UnwindError> {
        let expected = oracle_out(&self.prices, request.token_in, request.token_out, request.amount_in)?
            * bps_factor(self.slippage_bps);
        let amount_word = Wad::from_decimal(request.amount_in)
            .ok_or_else(|| UnwindError::adapter("paper aggregator", "amount not encodable"))?;

        let mut calldata = Vec::with_capacity(72);
        calldata.extend_from_slice(request.token_in.as_slice());
        calldata.extend_from_slice(request.token_out.as_slice());
        calldata.extend_from_slice(&amount_word.raw().to_be_bytes::<32>());

        Ok(SwapFill {
            provider: "paper".into(),
            aggregator: self.router,
            token_in: request.token_in,
            token_out: request.token_out,
            amount_in: request.amount_in,
            amount_out_expected: expected,
            calldata,
        })
    }
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Balances of every paper venue at the last committed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperLedger {
    /// Strategy's liquid balances.
    pub balances: PairAmounts,
    pub direct_debt: DebtLeg,
    pub reverse_debt: DebtLeg,
    pub pool_reserves: PairAmounts,
    #[serde(with = "rust_decimal::serde::str")]
    pub pool_liquidity: Decimal,
    pub vault: PaperVault,
}

impl PaperLedger {
    /// Starting venues described by `paper.json`.
    pub fn seed(paper: &PaperConfig) -> Self {
        Self {
            balances: paper.balances,
            direct_debt: paper.direct_debt.unwrap_or_default(),
            reverse_debt: paper.reverse_debt.unwrap_or_default(),
            pool_reserves: paper.pool_deposit,
            pool_liquidity: paper.pool_liquidity,
            vault: PaperVault::new(paper.profit_buffer, paper.insurance_balance, paper.insurance_target),
        }
    }

    pub fn capture(strategy: &PaperStrategy, vault: &PaperVault) -> Self {
        let (a, b) = (strategy.state().token_a, strategy.state().token_b);
        Self {
            balances: strategy.balances(),
            direct_debt: strategy.money_market().position(a, b),
            reverse_debt: strategy.money_market().position(b, a),
            pool_reserves: strategy.pool().reserves(),
            pool_liquidity: strategy.pool().liquidity(),
            vault: vault.clone(),
        }
    }

    /// Money market holding this ledger's positions for the pair.
    pub fn money_market(
        &self,
        token_a: Address,
        token_b: Address,
        prices: PaperPrices,
        borrow_ratio: Decimal,
    ) -> PaperMoneyMarket {
        let mut mm = PaperMoneyMarket::new(prices, borrow_ratio);
        if !self.direct_debt.is_empty() {
            mm = mm.with_position(token_a, token_b, self.direct_debt);
        }
        if !self.reverse_debt.is_empty() {
            mm = mm.with_position(token_b, token_a, self.reverse_debt);
        }
        mm
    }

    /// Fail unless `state` was saved against these venues.
    pub fn ensure_backs(&self, state: &PositionState) -> Result<(), UnwindError> {
        if self.pool_liquidity != state.total_liquidity {
            return Err(UnwindError::RecordMismatch {
                reason: format!(
                    "position records liquidity {} but the pool ledger holds {}",
                    state.total_liquidity, self.pool_liquidity
                ),
            });
        }
        Ok(())
    }
}

/// Position record plus the paper ledger it was saved against. The ledger is
/// written first, so a position record never points past its venues.
pub struct PaperStore {
    position: JsonStateStore,
    ledger: JsonStateStore<PaperLedger>,
}

impl PaperStore {
    pub fn new(position_path: impl Into<PathBuf>, ledger_path: impl Into<PathBuf>) -> Self {
        Self {
            position: JsonStateStore::new(position_path),
            ledger: JsonStateStore::new(ledger_path),
        }
    }

    pub fn position(&self) -> &JsonStateStore {
        &self.position
    }

    /// `None` when no position has been persisted. A position without a
    /// ledger, or with one that does not back it, is an error.
    pub fn load(&self) -> Result<Option<(PositionState, PaperLedger)>, UnwindError> {
        match (self.position.load()?, self.ledger.load()?) {
            (Some(state), Some(ledger)) => {
                ledger.ensure_backs(&state)?;
                Ok(Some((state, ledger)))
            }
            (Some(_), None) => Err(UnwindError::RecordMismatch {
                reason: format!(
                    "{} has no paper ledger at {}",
                    self.position.path().display(),
                    self.ledger.path().display()
                ),
            }),
            (None, Some(_)) => {
                warn!(path = %self.ledger.path().display(), "paper ledger without a position record ignored");
                Ok(None)
            }
            (None, None) => Ok(None),
        }
    }

    pub fn save(&self, strategy: &PaperStrategy, vault: &PaperVault) -> Result<(), UnwindError> {
        self.ledger.save(&PaperLedger::capture(strategy, vault))?;
        self.position.save(strategy.state())
    }
}

impl StepStore<PaperMoneyMarket, PaperPool, PaperSwapRouter, PaperVault> for PaperStore {
    fn save_step(&self, strategy: &PaperStrategy, vault: &PaperVault) -> Result<(), UnwindError> {
        self.save(strategy, vault)
    }
}
