//! Pair strategy: position state plus the atomic withdraw-by-aggregator step.
//!
//! The strategy owns its liquid balances and the three venue adapters. The
//! vault handle is shared across strategies and is passed in by `&mut` for
//! the duration of one step.
//!
//! Step flow:
//! 1. Validate fuse consistency and debt exclusivity
//! 2. Measure price drift since the last operation
//! 3. Exit the pool
//! 4. Repay with the borrow asset on hand (repay-swap-repay only)
//! 5. Execute the injected aggregator fill, checked against the oracle
//! 6. Repay with the swap proceeds
//! 7. Decide completion
//! 8. Optionally borrow to the pool proportion and re-enter
//! 9. Reconcile the step's loss or gain, then settle the drift
//!
//! Any error restores the state, balances and every adapter to the
//! checkpoint taken on entry.

use alloy::primitives::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::fuse::{self, FuseDecision};
use super::loss_reconciler::{self, ReconcileLimits, ReserveView};
use super::planner::{self, QuoteContext};
use crate::errors::UnwindError;
use crate::execution::adapters::{Checkpoint, MoneyMarket, PoolDepositor, SwapRouter, VaultSplitter};
use crate::types::{
    BorrowedEvent, DebtDirection, DebtSnapshot, EnteredPoolEvent, EntryToPool, EventsSet,
    FixPriceChangesEvent, FuseStatus, FuseThresholds, LiquidationThresholds, PairAmounts,
    Plan, PositionState, Quote, SwapByAggEvent, SwapFill,
};

/// Tunables of the step executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyParams {
    pub thresholds: LiquidationThresholds,
    /// Largest accepted shortfall of a swap against the oracle, percent.
    pub max_swap_deviation_pct: Decimal,
    /// Distance from the target B share that still counts as reached.
    pub proportion_tolerance: Decimal,
    /// Over-sizing of debt-covering swaps, percent.
    pub swap_amount_gap_pct: Decimal,
    pub max_insurance_draw_pct: Decimal,
    pub accounting_epsilon: Decimal,
}

impl Default for StrategyParams {
    fn default() -> Self {
        Self {
            thresholds: LiquidationThresholds::default(),
            max_swap_deviation_pct: dec!(1),
            proportion_tolerance: dec!(0.01),
            swap_amount_gap_pct: dec!(1),
            max_insurance_draw_pct: dec!(1),
            accounting_epsilon: dec!(0.000001),
        }
    }
}

/// Everything one step consumes. The fill is built by the caller between
/// `quote_withdraw_by_agg` and the step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub token_to_swap: Option<Address>,
    pub amount_to_swap: Decimal,
    pub fill: Option<SwapFill>,
    pub plan: Plan,
    pub entry_to_pool: EntryToPool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub completed: bool,
    pub events: EventsSet,
}

/// Result of a no-swap rebalance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebalanceOutcome {
    pub decision: FuseDecision,
    pub events: EventsSet,
}

pub struct PairStrategy<M, P, R> {
    address: Address,
    state: PositionState,
    balances: PairAmounts,
    params: StrategyParams,
    money_market: M,
    pool: P,
    router: R,
}

struct StepCheckpoint<M, P, R, V> {
    state: PositionState,
    balances: PairAmounts,
    money_market: M,
    pool: P,
    router: R,
    vault: V,
}

impl<M, P, R> PairStrategy<M, P, R>
where
    M: MoneyMarket,
    P: PoolDepositor,
    R: SwapRouter,
{
    pub fn new(
        address: Address,
        state: PositionState,
        balances: PairAmounts,
        params: StrategyParams,
        money_market: M,
        pool: P,
        router: R,
    ) -> Self {
        Self {
            address,
            state,
            balances,
            params,
            money_market,
            pool,
            router,
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> &PositionState {
        &self.state
    }

    pub fn balances(&self) -> PairAmounts {
        self.balances
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    pub fn money_market(&self) -> &M {
        &self.money_market
    }

    pub fn money_market_mut(&mut self) -> &mut M {
        &mut self.money_market
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut P {
        &mut self.pool
    }

    pub fn router_mut(&mut self) -> &mut R {
        &mut self.router
    }

    // -----------------------------------------------------------------------
    // Read-only views
    // -----------------------------------------------------------------------

    /// Money-market positions in both directions plus oracle prices.
    pub fn debt_snapshot(&self) -> Result<DebtSnapshot, UnwindError> {
        let (a, b) = (self.state.token_a, self.state.token_b);
        Ok(DebtSnapshot {
            direct: self.money_market.position(a, b),
            reverse: self.money_market.position(b, a),
            prices: PairAmounts::new(self.money_market.price(a)?, self.money_market.price(b)?),
        })
    }

    /// Liquid balances plus what the pool would return on a full exit.
    fn holdings(&self) -> PairAmounts {
        self.balances
            .add(&self.pool.quote_exit(self.state.total_liquidity))
    }

    /// Invested assets in token-A units: liquid, pooled and locked assets net
    /// of debt, with token B converted at oracle prices.
    pub fn invested_assets(&self) -> Result<Decimal, UnwindError> {
        let debts = self.debt_snapshot()?;
        if debts.prices.a <= Decimal::ZERO {
            return Err(UnwindError::adapter("money market", "zero price for token A"));
        }
        let total = self.holdings().add(&debts.net_locked());
        Ok(total.value_usd(&debts.prices) / debts.prices.a)
    }

    /// Evaluate the fuse without applying it.
    pub fn fuse_decision(&self) -> FuseDecision {
        fuse::evaluate(
            self.pool.need_rebalance(),
            self.pool.current_tick(),
            self.pool.current_price(),
            &self.state,
        )
    }

    pub fn need_rebalance(&self) -> bool {
        self.fuse_decision().need_rebalance
    }

    /// Size the next step. Pure: never mutates state or adapters.
    pub fn quote_withdraw_by_agg(
        &self,
        plan: &Plan,
        max_amount_to_swap: Option<Decimal>,
    ) -> Result<Quote, UnwindError> {
        self.state.ensure_consistent()?;
        let ctx = QuoteContext {
            holdings: self.holdings(),
            debts: self.debt_snapshot()?,
            thresholds: self.params.thresholds,
            pool_proportion: self.pool.proportion_b(),
            swap_gap_pct: self.params.swap_amount_gap_pct,
            max_amount_to_swap,
        };
        Ok(match planner::quote(plan, &ctx)? {
            Some(sizing) => Quote {
                token_to_swap: Some(self.state.token(sizing.sell)),
                amount_to_swap: sizing.amount,
            },
            None => Quote::none(),
        })
    }

    // -----------------------------------------------------------------------
    // Operator controls
    // -----------------------------------------------------------------------

    pub fn set_fuse_thresholds(&mut self, thresholds: FuseThresholds) -> Result<(), UnwindError> {
        thresholds.validate()?;
        info!(thresholds = ?thresholds.to_array(), "fuse thresholds updated");
        self.state.fuse_thresholds = thresholds;
        Ok(())
    }

    pub fn set_fuse_status(&mut self, status: FuseStatus) {
        info!(from = self.state.fuse_status.as_str(), to = status.as_str(), "fuse status set");
        self.state.fuse_status = status;
        self.state.withdraw_done = false;
    }

    // -----------------------------------------------------------------------
    // Atomic operations
    // -----------------------------------------------------------------------

    fn take_checkpoint<V: VaultSplitter>(&self, vault: &V) -> StepCheckpoint<M::Snapshot, P::Snapshot, R::Snapshot, V::Snapshot> {
        StepCheckpoint {
            state: self.state.clone(),
            balances: self.balances,
            money_market: self.money_market.checkpoint(),
            pool: self.pool.checkpoint(),
            router: self.router.checkpoint(),
            vault: vault.checkpoint(),
        }
    }

    fn rollback<V: VaultSplitter>(
        &mut self,
        saved: StepCheckpoint<M::Snapshot, P::Snapshot, R::Snapshot, V::Snapshot>,
        vault: &mut V,
    ) {
        self.state = saved.state;
        self.balances = saved.balances;
        self.money_market.restore(saved.money_market);
        self.pool.restore(saved.pool);
        self.router.restore(saved.router);
        vault.restore(saved.vault);
    }

    /// Execute one withdraw-by-aggregator step, all or nothing.
    pub fn withdraw_by_agg_step<V: VaultSplitter>(
        &mut self,
        request: StepRequest,
        vault: &mut V,
    ) -> Result<StepOutcome, UnwindError> {
        let saved = self.take_checkpoint(vault);
        match self.step_inner(&request, vault) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.rollback(saved, vault);
                warn!(plan = request.plan.name(), error = %e, recoverable = e.is_recoverable(), "step reverted");
                Err(e)
            }
        }
    }

    fn step_inner<V: VaultSplitter>(
        &mut self,
        request: &StepRequest,
        vault: &mut V,
    ) -> Result<StepOutcome, UnwindError> {
        let mut events = EventsSet::default();

        // 1. Validate
        self.state.ensure_consistent()?;
        request.plan.validate()?;
        self.debt_snapshot()?.active()?;
        let pool_proportion = self.pool.proportion_b();

        // 2. Price drift since the last operation
        let (invested_before, recorded) = self.fix_price_changes(&mut events)?;

        // 3. Exit the pool
        self.exit_pool()?;

        // 4. Repay with what is on hand
        if matches!(request.plan, Plan::RepaySwapRepay { .. }) {
            self.repay_available()?;
        }

        // 5. Swap
        if request.amount_to_swap > Decimal::ZERO {
            let event = self.swap_by_agg(request)?;
            events.swap_by_agg = Some(event);
        }

        // 6. Repay with proceeds
        if request.plan.repays_debt() {
            self.repay_available()?;
        }
        let debts = self.debt_snapshot()?;
        let active = debts.active()?;

        // 7. Completion
        let mut completed = debts.is_dust(&self.params.thresholds);
        if let Plan::SwapOnly { prop } = request.plan {
            let target = prop.resolve(pool_proportion);
            completed = completed
                && self
                    .balances
                    .share_b(&debts.prices)
                    .map_or(true, |share| (share - target).abs() <= self.params.proportion_tolerance);
        }

        // 8. Entry
        if request.entry_to_pool.permits(completed) && !self.state.fuse_status.is_on() {
            self.enter_pool(active.map(|(d, _)| d), &debts.prices, &mut events)?;
        }

        // 9. Reconcile
        let invested_after = self.invested_assets()?;
        let profit_available = vault.profit_buffer();
        self.reconcile(invested_before, invested_after, profit_available, vault, &mut events, true)?;
        self.settle_price_drift(recorded, invested_before, vault, &mut events)?;

        if completed {
            self.state.withdraw_done = self.state.fuse_status.is_on();
            self.state.last_rebalance_no_swap = 0;
        }
        self.state.invested_assets = self.invested_assets()?;

        info!(
            plan = request.plan.name(),
            completed,
            debt_left = %debts.max_amount_to_repay(),
            liquidity = %self.state.total_liquidity,
            invested = %self.state.invested_assets,
            "withdraw step committed"
        );
        Ok(StepOutcome { completed, events })
    }

    /// Exit and, unless the fuse turned on, re-enter the pool without swapping.
    pub fn rebalance_no_swaps<V: VaultSplitter>(
        &mut self,
        now: u64,
        vault: &mut V,
    ) -> Result<RebalanceOutcome, UnwindError> {
        self.state.ensure_consistent()?;
        let decision = self.fuse_decision();
        if !decision.need_rebalance {
            return Err(UnwindError::NoRebalanceNeeded);
        }

        let saved = self.take_checkpoint(vault);
        match self.rebalance_inner(decision, now, vault) {
            Ok(events) => Ok(RebalanceOutcome { decision, events }),
            Err(e) => {
                self.rollback(saved, vault);
                warn!(error = %e, "rebalance reverted");
                Err(e)
            }
        }
    }

    fn rebalance_inner<V: VaultSplitter>(
        &mut self,
        decision: FuseDecision,
        now: u64,
        vault: &mut V,
    ) -> Result<EventsSet, UnwindError> {
        let mut events = EventsSet::default();
        self.debt_snapshot()?.active()?;
        let (invested_before, recorded) = self.fix_price_changes(&mut events)?;

        fuse::apply(&mut self.state, &decision);
        self.exit_pool()?;

        if !self.state.fuse_status.is_on() {
            let debts = self.debt_snapshot()?;
            let active = debts.active()?;
            self.enter_pool(active.map(|(d, _)| d), &debts.prices, &mut events)?;
        } else {
            info!(status = self.state.fuse_status.as_str(), "fuse on, pool left for forced unwind");
        }

        let invested_after = self.invested_assets()?;
        let profit_available = vault.profit_buffer();
        self.reconcile(invested_before, invested_after, profit_available, vault, &mut events, true)?;
        self.settle_price_drift(recorded, invested_before, vault, &mut events)?;

        self.state.last_rebalance_no_swap = now;
        self.state.invested_assets = self.invested_assets()?;
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // Step phases
    // -----------------------------------------------------------------------

    /// Measure drift between the recorded and the current invested assets.
    ///
    /// Returns the invested assets the operation starts from, plus the
    /// recorded baseline when one exists. Nothing moves here: the drift is
    /// settled by [`Self::settle_price_drift`] once the operation's own
    /// transfers are done, and quotes stay valid against the liquid balances.
    fn fix_price_changes(&self, events: &mut EventsSet) -> Result<(Decimal, Option<Decimal>), UnwindError> {
        let current = self.invested_assets()?;
        let recorded = self.state.invested_assets;
        if recorded <= Decimal::ZERO {
            return Ok((current, None));
        }
        events.fix_price_changes = Some(FixPriceChangesEvent {
            invested_assets_before: recorded,
            invested_assets_out: current,
        });
        Ok((current, Some(recorded)))
    }

    /// Settle `recorded → current` against the reserves. Drift losses are
    /// covered by insurance only; drift gains are swept from the underlying
    /// left after the operation.
    fn settle_price_drift<V: VaultSplitter>(
        &mut self,
        recorded: Option<Decimal>,
        current: Decimal,
        vault: &mut V,
        events: &mut EventsSet,
    ) -> Result<(), UnwindError> {
        if let Some(recorded) = recorded {
            self.reconcile(recorded, current, Decimal::ZERO, vault, events, false)?;
        }
        Ok(())
    }

    fn reconcile<V: VaultSplitter>(
        &mut self,
        before: Decimal,
        after: Decimal,
        profit_available: Decimal,
        vault: &mut V,
        events: &mut EventsSet,
        record_rebalanced: bool,
    ) -> Result<Decimal, UnwindError> {
        let view = ReserveView {
            profit_buffer: profit_available,
            insurance_balance: vault.insurance_balance(),
            insurance_target: vault.insurance_target(),
            debt_to_insurance: self.state.debt_to_insurance,
            underlying_balance: self.balances.a,
        };
        let limits = ReconcileLimits {
            max_insurance_draw_pct: self.params.max_insurance_draw_pct,
            epsilon: self.params.accounting_epsilon,
        };
        let rec = loss_reconciler::reconcile(before, after, &view, &limits);
        let sent = loss_reconciler::apply(
            &rec,
            vault,
            &mut self.state.debt_to_insurance,
            events,
            record_rebalanced,
            profit_available,
        )?;
        self.balances.a -= sent;
        Ok(sent)
    }

    fn exit_pool(&mut self) -> Result<(), UnwindError> {
        let liquidity = self.state.total_liquidity;
        if liquidity <= Decimal::ZERO {
            return Ok(());
        }
        let amounts = self.pool.exit(liquidity)?;
        self.balances = self.balances.add(&amounts);
        self.state.total_liquidity = Decimal::ZERO;
        debug!(%liquidity, a = %amounts.a, b = %amounts.b, "pool exited");
        Ok(())
    }

    /// Repay the active leg with the borrow asset on hand. Amounts below the
    /// dust floor are skipped unless they retire the whole debt.
    fn repay_available(&mut self) -> Result<Decimal, UnwindError> {
        let Some((direction, leg)) = self.debt_snapshot()?.active()? else {
            return Ok(Decimal::ZERO);
        };
        let borrow_side = direction.borrow_side();
        let collateral_side = direction.collateral_side();
        let amount = leg.amount_to_repay.min(self.balances.get(borrow_side));
        if amount <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }
        if amount < self.params.thresholds.get(borrow_side) && amount < leg.amount_to_repay {
            debug!(%amount, "repay below dust floor skipped");
            return Ok(Decimal::ZERO);
        }

        let released = self.money_market.repay(
            self.state.token(collateral_side),
            self.state.token(borrow_side),
            amount,
        )?;
        *self.balances.get_mut(borrow_side) -= amount;
        *self.balances.get_mut(collateral_side) += released;
        debug!(direction = direction.as_str(), %amount, %released, "debt repaid");
        Ok(amount)
    }

    /// Execute the injected fill after checking it against the request, the
    /// balance and the oracle.
    fn swap_by_agg(&mut self, request: &StepRequest) -> Result<SwapByAggEvent, UnwindError> {
        let token_in = request.token_to_swap.ok_or_else(|| UnwindError::SwapMismatch {
            reason: "amount_to_swap without token_to_swap".into(),
        })?;
        let side_in = self.state.side_of(token_in).ok_or_else(|| UnwindError::SwapMismatch {
            reason: format!("{token_in} is not a pool asset"),
        })?;
        let side_out = side_in.other();
        let fill = request.fill.as_ref().ok_or_else(|| UnwindError::SwapMismatch {
            reason: "swap requested without aggregator fill".into(),
        })?;
        if fill.token_in != token_in || fill.token_out != self.state.token(side_out) {
            return Err(UnwindError::SwapMismatch {
                reason: format!("fill routes {} -> {}", fill.token_in, fill.token_out),
            });
        }
        if fill.amount_in != request.amount_to_swap {
            return Err(UnwindError::SwapMismatch {
                reason: format!(
                    "fill amount {} differs from requested {}",
                    fill.amount_in, request.amount_to_swap
                ),
            });
        }
        let available = self.balances.get(side_in);
        if fill.amount_in > available {
            return Err(UnwindError::InsufficientBalance {
                token: side_in.as_str().into(),
                required: fill.amount_in,
                available,
            });
        }

        let prices = self.debt_snapshot()?.prices;
        let price_out = prices.get(side_out);
        if price_out <= Decimal::ZERO {
            return Err(UnwindError::adapter(
                "money market",
                format!("zero price for {}", side_out.as_str()),
            ));
        }
        let implied = fill.amount_in * prices.get(side_in) / price_out;
        check_deviation(implied, fill.amount_out_expected, self.params.max_swap_deviation_pct)?;

        let received = self.router.swap(fill)?;
        check_deviation(implied, received, self.params.max_swap_deviation_pct)?;

        *self.balances.get_mut(side_in) -= fill.amount_in;
        *self.balances.get_mut(side_out) += received;
        info!(
            provider = %fill.provider,
            sold = side_in.as_str(),
            amount_in = %fill.amount_in,
            received = %received,
            expected = %fill.amount_out_expected,
            "swap by aggregator"
        );
        Ok(SwapByAggEvent {
            amount_in: fill.amount_in,
            amount_out: received,
            amount_out_expected: fill.amount_out_expected,
            aggregator: fill.aggregator,
        })
    }

    /// Borrow towards the pool proportion if needed, then deposit balances.
    fn enter_pool(
        &mut self,
        active: Option<DebtDirection>,
        prices: &PairAmounts,
        events: &mut EventsSet,
    ) -> Result<(), UnwindError> {
        let t = self.params.thresholds;
        if self.balances.a < t.a.max(Decimal::ZERO) && self.balances.b < t.b.max(Decimal::ZERO) {
            return Ok(());
        }
        let (a, b) = (self.state.token_a, self.state.token_b);

        let borrow = planner::entry_borrow(
            &self.balances,
            self.pool.proportion_b(),
            prices,
            self.money_market.borrow_ratio(a, b),
            self.params.proportion_tolerance,
            active,
            &t,
        );
        if let Some(plan) = borrow {
            let collateral_side = plan.direction.collateral_side();
            let borrow_side = plan.direction.borrow_side();
            let borrowed = self.money_market.borrow(
                self.state.token(collateral_side),
                plan.collateral_amount,
                self.state.token(borrow_side),
            )?;
            *self.balances.get_mut(collateral_side) -= plan.collateral_amount;
            *self.balances.get_mut(borrow_side) += borrowed;
            self.debt_snapshot()?.active()?;
            events.borrowed = Some(BorrowedEvent {
                direction: plan.direction,
                collateral: plan.collateral_amount,
                borrowed,
            });
        }

        let entry = self.pool.enter(self.balances)?;
        self.balances = PairAmounts::new(
            self.balances.a - entry.consumed.a,
            self.balances.b - entry.consumed.b,
        );
        self.state.total_liquidity += entry.liquidity;
        self.state.lower_tick = entry.lower_tick;
        self.state.upper_tick = entry.upper_tick;
        info!(
            a = %entry.consumed.a,
            b = %entry.consumed.b,
            liquidity = %entry.liquidity,
            lower = entry.lower_tick,
            upper = entry.upper_tick,
            "pool entered"
        );
        events.entered_pool = Some(EnteredPoolEvent {
            amount_a: entry.consumed.a,
            amount_b: entry.consumed.b,
            liquidity: entry.liquidity,
        });
        Ok(())
    }
}

/// Fail if `actual` falls short of `implied` by more than `max_pct` percent.
/// Outputs above the oracle amount are accepted.
pub fn check_deviation(implied: Decimal, actual: Decimal, max_pct: Decimal) -> Result<(), UnwindError> {
    if implied <= Decimal::ZERO || actual >= implied {
        return Ok(());
    }
    let deviation_pct = (implied - actual) / implied * dec!(100);
    if deviation_pct > max_pct {
        return Err(UnwindError::SwapDeviation {
            expected: implied,
            received: actual,
            deviation_pct,
            max_pct,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::adapters::SwapAggregator;
    use crate::execution::paper::{
        PaperAggregator, PaperMoneyMarket, PaperPool, PaperPrices, PaperSwapRouter, PaperVault,
    };
    use crate::types::{DebtLeg, PropTarget, SwapRequest};
    use alloy::primitives::address;
    use std::collections::HashMap;

    const TOKEN_A: Address = address!("00000000000000000000000000000000000000aa");
    const TOKEN_B: Address = address!("00000000000000000000000000000000000000bb");
    const POOL: Address = address!("00000000000000000000000000000000000000cc");
    const STRATEGY: Address = address!("00000000000000000000000000000000000000dd");

    type Strategy = PairStrategy<PaperMoneyMarket, PaperPool, PaperSwapRouter>;

    fn prices() -> PaperPrices {
        HashMap::from([(TOKEN_A, dec!(1)), (TOKEN_B, dec!(1))])
    }

    fn thresholds() -> FuseThresholds {
        FuseThresholds::from_array([dec!(0.5), dec!(0.7), dec!(1.5), dec!(1.3)])
    }

    /// Direct debt 1000 A / 500 B, pool holding 300 / 300.
    fn leveraged() -> Strategy {
        let mut state = PositionState::new(TOKEN_A, TOKEN_B, POOL, true, 10, -100, 100, 10, thresholds());
        state.total_liquidity = dec!(600);
        let mm = PaperMoneyMarket::new(prices(), dec!(0.5))
            .with_position(TOKEN_A, TOKEN_B, DebtLeg::new(dec!(1000), dec!(500)));
        let pool = PaperPool::new(dec!(1), dec!(0.5), 0, 10, 100)
            .with_deposit(PairAmounts::new(dec!(300), dec!(300)), dec!(600));
        let router = PaperSwapRouter::new(prices(), 0);
        PairStrategy::new(STRATEGY, state, PairAmounts::ZERO, StrategyParams::default(), mm, pool, router)
    }

    fn vault() -> PaperVault {
        PaperVault::new(dec!(5), dec!(50), dec!(100))
    }

    async fn request(strategy: &Strategy, plan: Plan, entry: EntryToPool) -> StepRequest {
        let quote = strategy.quote_withdraw_by_agg(&plan, None).unwrap();
        let fill = match quote.token_to_swap {
            Some(token_in) if quote.is_swap_required() => {
                let side = strategy.state().side_of(token_in).unwrap();
                let agg = PaperAggregator::new(prices(), 0, Address::ZERO);
                Some(
                    agg.build_swap(&SwapRequest {
                        token_in,
                        token_out: strategy.state().token(side.other()),
                        amount_in: quote.amount_to_swap,
                        beneficiary: strategy.address(),
                    })
                    .await
                    .unwrap(),
                )
            }
            _ => None,
        };
        StepRequest {
            token_to_swap: quote.token_to_swap,
            amount_to_swap: quote.amount_to_swap,
            fill,
            plan,
            entry_to_pool: entry,
        }
    }

    #[tokio::test]
    async fn test_swap_repay_pool_proportion_unwinds_fully() {
        let mut s = leveraged();
        let mut v = vault();
        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };
        let req = request(&s, plan, EntryToPool::Disabled).await;
        let outcome = s.withdraw_by_agg_step(req, &mut v).unwrap();

        assert!(outcome.completed);
        assert_eq!(s.state().total_liquidity, Decimal::ZERO);
        let debts = s.debt_snapshot().unwrap();
        assert_eq!(debts.net_locked(), PairAmounts::ZERO);
        assert_eq!(s.balances(), PairAmounts::new(dec!(1000), dec!(100)));
        assert!(!s.state().withdraw_done);
        assert!(outcome.events.swap_by_agg.is_some());
    }

    #[tokio::test]
    async fn test_repay_swap_repay_reduces_debt_and_collateral() {
        let mut s = leveraged();
        let mut v = vault();
        let before = s.debt_snapshot().unwrap().direct;
        let plan = Plan::RepaySwapRepay {
            prop: PropTarget::PoolProportion,
            debt_amount_to_reduce: dec!(200),
        };
        let req = request(&s, plan, EntryToPool::Disabled).await;
        s.withdraw_by_agg_step(req, &mut v).unwrap();

        let after = s.debt_snapshot().unwrap().direct;
        assert!(after.amount_to_repay < before.amount_to_repay);
        assert!(after.collateral < before.collateral);
    }

    #[tokio::test]
    async fn test_swap_deviation_reverts_everything() {
        let mut s = leveraged();
        s.router_mut().haircut_pct = dec!(10);
        let mut v = vault();
        let state_before = s.state().clone();
        let balances_before = s.balances();
        let debts_before = s.debt_snapshot().unwrap();
        let vault_before = v.clone();

        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };
        let req = request(&s, plan, EntryToPool::Disabled).await;
        assert_eq!(req.amount_to_swap, dec!(300));
        let err = s.withdraw_by_agg_step(req, &mut v).unwrap_err();

        assert!(matches!(err, UnwindError::SwapDeviation { .. }));
        assert!(err.is_recoverable());
        assert_eq!(s.state(), &state_before);
        assert_eq!(s.balances(), balances_before);
        assert_eq!(s.debt_snapshot().unwrap(), debts_before);
        assert_eq!(s.pool().liquidity(), dec!(600));
        assert_eq!(v, vault_before);
    }

    #[tokio::test]
    async fn test_repay_failure_reverts() {
        let mut s = leveraged();
        s.money_market_mut().fail_repay = true;
        let mut v = vault();
        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };
        let req = request(&s, plan, EntryToPool::Disabled).await;
        let err = s.withdraw_by_agg_step(req, &mut v).unwrap_err();
        assert!(matches!(err, UnwindError::Adapter { .. }));
        assert_eq!(s.state().total_liquidity, dec!(600));
        assert_eq!(s.balances(), PairAmounts::ZERO);
    }

    #[tokio::test]
    async fn test_fill_mismatch_rejected() {
        let mut s = leveraged();
        let mut v = vault();
        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };
        let mut req = request(&s, plan, EntryToPool::Disabled).await;
        req.amount_to_swap = dec!(299);
        let err = s.withdraw_by_agg_step(req, &mut v).unwrap_err();
        assert!(matches!(err, UnwindError::SwapMismatch { .. }));
    }

    #[tokio::test]
    async fn test_completion_under_fuse_sets_withdraw_done() {
        let mut s = leveraged();
        s.set_fuse_status(FuseStatus::OnLowerLimit);
        let mut v = vault();
        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };
        let req = request(&s, plan, EntryToPool::Allowed).await;
        let outcome = s.withdraw_by_agg_step(req, &mut v).unwrap();
        assert!(outcome.completed);
        assert!(s.state().withdraw_done);
        // Fuse on: no re-entry even though entry is allowed.
        assert_eq!(s.state().total_liquidity, Decimal::ZERO);
        assert!(outcome.events.entered_pool.is_none());
    }

    #[tokio::test]
    async fn test_entry_allowed_borrows_to_pool_proportion() {
        let state = PositionState::new(TOKEN_A, TOKEN_B, POOL, true, 10, -100, 100, 10, thresholds());
        let mut s = PairStrategy::new(
            STRATEGY,
            state,
            PairAmounts::new(dec!(100), dec!(0)),
            StrategyParams::default(),
            PaperMoneyMarket::new(prices(), dec!(0.5)),
            PaperPool::new(dec!(1), dec!(0.5), 0, 10, 100),
            PaperSwapRouter::new(prices(), 0),
        );
        let mut v = vault();
        let plan = Plan::SwapRepay {
            prop: PropTarget::Fixed(Decimal::ZERO),
        };
        let req = request(&s, plan, EntryToPool::Allowed).await;
        assert!(req.fill.is_none());
        let outcome = s.withdraw_by_agg_step(req, &mut v).unwrap();

        let borrowed = outcome.events.borrowed.unwrap();
        assert_eq!(borrowed.direction, DebtDirection::Direct);
        assert!(outcome.events.entered_pool.is_some());
        assert!(s.state().total_liquidity > Decimal::ZERO);
        assert!(outcome.completed);
    }

    #[tokio::test]
    async fn test_quote_does_not_mutate() {
        let s = leveraged();
        let plan = Plan::RepaySwapRepay {
            prop: PropTarget::Fixed(dec!(0.4)),
            debt_amount_to_reduce: dec!(100),
        };
        let state = s.state().clone();
        let first = s.quote_withdraw_by_agg(&plan, Some(dec!(50))).unwrap();
        for _ in 0..3 {
            assert_eq!(s.quote_withdraw_by_agg(&plan, Some(dec!(50))).unwrap(), first);
        }
        assert_eq!(s.state(), &state);
        assert_eq!(s.pool().liquidity(), dec!(600));
    }

    #[test]
    fn test_fuse_trip_exits_pool_without_reentry() {
        let mut s = leveraged();
        let mut v = vault();
        s.pool_mut().set_price(dec!(0.49));
        let outcome = s.rebalance_no_swaps(1_700_000_000, &mut v).unwrap();
        assert_eq!(outcome.decision.new_status, FuseStatus::OnLowerLimit);
        assert_eq!(s.state().fuse_status, FuseStatus::OnLowerLimit);
        assert_eq!(s.state().total_liquidity, Decimal::ZERO);
        assert_eq!(s.state().last_rebalance_no_swap, 1_700_000_000);
        assert!(!s.state().withdraw_done);
    }

    #[test]
    fn test_rebalance_not_needed() {
        let mut s = leveraged();
        let mut v = vault();
        assert!(matches!(
            s.rebalance_no_swaps(1, &mut v),
            Err(UnwindError::NoRebalanceNeeded)
        ));
    }

    #[test]
    fn test_out_of_range_reenters_on_new_range() {
        let mut s = leveraged();
        let mut v = vault();
        s.pool_mut().set_tick(500);
        s.pool_mut().set_out_of_range(true);
        let outcome = s.rebalance_no_swaps(42, &mut v).unwrap();
        assert!(!outcome.decision.status_changed);
        assert!(outcome.events.entered_pool.is_some());
        assert_eq!(s.state().lower_tick, 400);
        assert_eq!(s.state().upper_tick, 600);
        assert!(s.state().total_liquidity > Decimal::ZERO);
    }

    #[test]
    fn test_fuse_controls() {
        let mut s = leveraged();
        assert!(s
            .set_fuse_thresholds(FuseThresholds::from_array([dec!(0.7), dec!(0.5), dec!(1.5), dec!(1.3)]))
            .is_err());
        s.set_fuse_thresholds(FuseThresholds::from_array([dec!(0.6), dec!(0.8), dec!(1.4), dec!(1.2)]))
            .unwrap();
        assert_eq!(s.state().fuse_thresholds.lower_on, dec!(0.6));
        s.set_fuse_status(FuseStatus::Disabled);
        assert!(!s.state().withdraw_done);
        assert_eq!(s.fuse_decision().new_status, FuseStatus::Disabled);
    }

    #[test]
    fn test_invested_assets_nets_debt() {
        let s = leveraged();
        // 300 + 300 pooled, 1000 collateral, 500 debt.
        assert_eq!(s.invested_assets().unwrap(), dec!(1100));
    }

    #[tokio::test]
    async fn test_entry_if_completed_skipped_when_debt_remains() {
        let plan = Plan::SwapOnly {
            prop: PropTarget::Fixed(dec!(0.5)),
        };

        let mut s = leveraged();
        let mut v = vault();
        let req = request(&s, plan, EntryToPool::AllowedIfCompleted).await;
        let outcome = s.withdraw_by_agg_step(req, &mut v).unwrap();
        assert!(!outcome.completed);
        assert!(outcome.events.entered_pool.is_none());
        assert_eq!(s.state().total_liquidity, Decimal::ZERO);
        assert_eq!(s.balances(), PairAmounts::new(dec!(300), dec!(300)));

        // Unconditional entry re-deposits the same balances.
        let mut s = leveraged();
        let mut v = vault();
        let req = request(&s, plan, EntryToPool::Allowed).await;
        let outcome = s.withdraw_by_agg_step(req, &mut v).unwrap();
        assert!(!outcome.completed);
        assert!(outcome.events.entered_pool.is_some());
        assert_eq!(s.state().total_liquidity, dec!(600));
    }

    #[tokio::test]
    async fn test_pool_entry_failure_reverts_everything() {
        let mut s = leveraged();
        s.pool_mut().fail_enter = true;
        let mut v = vault();
        let state_before = s.state().clone();
        let debts_before = s.debt_snapshot().unwrap();
        let vault_before = v.clone();

        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };
        let req = request(&s, plan, EntryToPool::Allowed).await;
        assert!(req.fill.is_some());
        let err = s.withdraw_by_agg_step(req, &mut v).unwrap_err();

        assert!(matches!(err, UnwindError::PoolEntryFailed { .. }));
        assert_eq!(s.state(), &state_before);
        assert_eq!(s.balances(), PairAmounts::ZERO);
        assert_eq!(s.debt_snapshot().unwrap(), debts_before);
        assert_eq!(s.pool().liquidity(), dec!(600));
        assert_eq!(s.router_mut().swaps_executed(), 0);
        assert_eq!(v, vault_before);
    }

    #[test]
    fn test_both_debt_directions_open_aborts_step() {
        let mut state = PositionState::new(TOKEN_A, TOKEN_B, POOL, true, 10, -100, 100, 10, thresholds());
        state.total_liquidity = dec!(600);
        let mm = PaperMoneyMarket::new(prices(), dec!(0.5))
            .with_position(TOKEN_A, TOKEN_B, DebtLeg::new(dec!(1000), dec!(500)))
            .with_position(TOKEN_B, TOKEN_A, DebtLeg::new(dec!(100), dec!(50)));
        let pool = PaperPool::new(dec!(1), dec!(0.5), 0, 10, 100)
            .with_deposit(PairAmounts::new(dec!(300), dec!(300)), dec!(600));
        let mut s = PairStrategy::new(
            STRATEGY,
            state,
            PairAmounts::ZERO,
            StrategyParams::default(),
            mm,
            pool,
            PaperSwapRouter::new(prices(), 0),
        );
        let mut v = vault();
        let state_before = s.state().clone();
        let plan = Plan::SwapRepay {
            prop: PropTarget::PoolProportion,
        };

        assert!(matches!(
            s.quote_withdraw_by_agg(&plan, None),
            Err(UnwindError::DebtDirectionConflict { .. })
        ));
        let req = StepRequest {
            token_to_swap: None,
            amount_to_swap: Decimal::ZERO,
            fill: None,
            plan,
            entry_to_pool: EntryToPool::Allowed,
        };
        let err = s.withdraw_by_agg_step(req, &mut v).unwrap_err();

        assert!(matches!(err, UnwindError::DebtDirectionConflict { .. }));
        assert_eq!(s.state(), &state_before);
        assert_eq!(s.balances(), PairAmounts::ZERO);
        assert_eq!(s.pool().liquidity(), dec!(600));
        assert_eq!(v, vault());
    }

    /// Paper market whose oracle quotes token B at zero.
    struct ZeroPricedB(PaperMoneyMarket);

    impl Checkpoint for ZeroPricedB {
        type Snapshot = <PaperMoneyMarket as Checkpoint>::Snapshot;

        fn checkpoint(&self) -> Self::Snapshot {
            self.0.checkpoint()
        }

        fn restore(&mut self, snapshot: Self::Snapshot) {
            self.0.restore(snapshot)
        }
    }

    impl MoneyMarket for ZeroPricedB {
        fn price(&self, asset: Address) -> Result<Decimal, UnwindError> {
            if asset == TOKEN_B {
                return Ok(Decimal::ZERO);
            }
            self.0.price(asset)
        }

        fn position(&self, collateral_asset: Address, borrow_asset: Address) -> DebtLeg {
            self.0.position(collateral_asset, borrow_asset)
        }

        fn repay(
            &mut self,
            collateral_asset: Address,
            borrow_asset: Address,
            amount: Decimal,
        ) -> Result<Decimal, UnwindError> {
            self.0.repay(collateral_asset, borrow_asset, amount)
        }

        fn borrow(
            &mut self,
            collateral_asset: Address,
            collateral_amount: Decimal,
            borrow_asset: Address,
        ) -> Result<Decimal, UnwindError> {
            self.0.borrow(collateral_asset, collateral_amount, borrow_asset)
        }

        fn borrow_ratio(&self, collateral_asset: Address, borrow_asset: Address) -> Decimal {
            self.0.borrow_ratio(collateral_asset, borrow_asset)
        }
    }

    #[tokio::test]
    async fn test_zero_output_price_rejects_swap() {
        let mut state = PositionState::new(TOKEN_A, TOKEN_B, POOL, true, 10, -100, 100, 10, thresholds());
        state.total_liquidity = dec!(600);
        let pool = PaperPool::new(dec!(1), dec!(0.5), 0, 10, 100)
            .with_deposit(PairAmounts::new(dec!(300), dec!(300)), dec!(600));
        let mut s = PairStrategy::new(
            STRATEGY,
            state,
            PairAmounts::ZERO,
            StrategyParams::default(),
            ZeroPricedB(PaperMoneyMarket::new(prices(), dec!(0.5))),
            pool,
            PaperSwapRouter::new(prices(), 0),
        );
        let mut v = vault();
        let fill = PaperAggregator::new(prices(), 0, Address::ZERO)
            .build_swap(&SwapRequest {
                token_in: TOKEN_A,
                token_out: TOKEN_B,
                amount_in: dec!(100),
                beneficiary: STRATEGY,
            })
            .await
            .unwrap();
        let req = StepRequest {
            token_to_swap: Some(TOKEN_A),
            amount_to_swap: dec!(100),
            fill: Some(fill),
            plan: Plan::SwapOnly {
                prop: PropTarget::Fixed(dec!(0.5)),
            },
            entry_to_pool: EntryToPool::Disabled,
        };

        let err = s.withdraw_by_agg_step(req, &mut v).unwrap_err();
        assert!(matches!(err, UnwindError::Adapter { .. }));
        assert_eq!(s.pool().liquidity(), dec!(600));
        assert_eq!(s.router_mut().swaps_executed(), 0);
    }

    #[test]
    fn test_deviation_check() {
        assert!(check_deviation(dec!(100), dec!(99.5), dec!(1)).is_ok());
        assert!(check_deviation(dec!(100), dec!(110), dec!(1)).is_ok());
        assert!(matches!(
            check_deviation(dec!(100), dec!(90), dec!(1)),
            Err(UnwindError::SwapDeviation { .. })
        ));
    }
}
