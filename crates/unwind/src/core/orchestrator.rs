//! Orchestration loop: quote, build the aggregator fill, step; repeat.
//!
//! Every iteration re-quotes against fresh state so the fill always matches
//! the position it is executed on. Recoverable step errors are retried with a
//! new quote; anything else stops the loop. Cancellation is observed between
//! steps only, never inside one. Each committed step is handed to a
//! [`StepStore`] before the next one starts.

use rust_decimal::Decimal;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::strategy::{PairStrategy, StepOutcome, StepRequest};
use crate::config::UnwindConfig;
use crate::errors::UnwindError;
use crate::execution::adapters::{MoneyMarket, PoolDepositor, SwapAggregator, SwapRouter, VaultSplitter};
use crate::execution::state_store::JsonStateStore;
use crate::types::{EntryToPool, Plan, PositionState, Quote, SwapFill, SwapRequest};

/// Durable sink for the strategy after every committed step.
pub trait StepStore<M, P, R, V> {
    fn save_step(&self, strategy: &PairStrategy<M, P, R>, vault: &V) -> Result<(), UnwindError>;
}

/// Persists the position record only.
impl<M, P, R, V> StepStore<M, P, R, V> for JsonStateStore<PositionState>
where
    M: MoneyMarket,
    P: PoolDepositor,
    R: SwapRouter,
{
    fn save_step(&self, strategy: &PairStrategy<M, P, R>, _vault: &V) -> Result<(), UnwindError> {
        self.save(strategy.state())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopParams {
    pub plan: Plan,
    pub entry_to_pool: EntryToPool,
    pub single_iteration: bool,
    pub max_amount_to_swap: Option<Decimal>,
    pub max_iterations: u32,
    /// Extra attempts per iteration after a recoverable error.
    pub max_step_retries: u32,
    /// Consecutive steps without progress tolerated before giving up.
    pub max_stalled_steps: u32,
}

impl From<&UnwindConfig> for LoopParams {
    fn from(cfg: &UnwindConfig) -> Self {
        Self {
            plan: cfg.plan,
            entry_to_pool: cfg.entry_to_pool,
            single_iteration: cfg.single_iteration,
            max_amount_to_swap: cfg.max_amount_to_swap,
            max_iterations: cfg.max_iterations,
            max_step_retries: cfg.max_step_retries,
            max_stalled_steps: cfg.max_stalled_steps,
        }
    }
}

/// One committed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub iteration: u32,
    pub attempts: u32,
    pub quote: Quote,
    pub provider: Option<String>,
    pub debt_before: Decimal,
    pub debt_after: Decimal,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnwindReport {
    pub iterations: u32,
    pub completed: bool,
    pub cancelled: bool,
    pub steps: Vec<StepReport>,
    pub total_swapped_in: Decimal,
    pub total_covered_by_insurance: Decimal,
    pub total_uncovered: Decimal,
    pub total_sent_to_insurance: Decimal,
}

impl UnwindReport {
    fn record(&mut self, step: StepReport) {
        let events = &step.outcome.events;
        if let Some(swap) = &events.swap_by_agg {
            self.total_swapped_in += swap.amount_in;
        }
        self.total_covered_by_insurance += events.total_covered_by_insurance();
        self.total_uncovered += events.total_uncovered();
        self.total_sent_to_insurance += events.total_sent_to_insurance();
        self.completed = step.outcome.completed;
        self.steps.push(step);
    }
}

/// Drive withdraw-by-aggregator steps until the plan completes.
///
/// Stops early on cancellation, after one step when `single_iteration` is
/// set, or when `max_iterations` is exhausted. Fails with
/// [`UnwindError::Stalled`] after `max_stalled_steps` steps in a row that
/// neither swapped nor reduced debt.
pub async fn run_withdraw_by_agg<M, P, R, V, A>(
    strategy: &mut PairStrategy<M, P, R>,
    vault: &mut V,
    aggregator: &A,
    params: &LoopParams,
    store: Option<&dyn StepStore<M, P, R, V>>,
    shutdown: &CancellationToken,
) -> Result<UnwindReport, UnwindError>
where
    M: MoneyMarket,
    P: PoolDepositor,
    R: SwapRouter,
    V: VaultSplitter,
    A: SwapAggregator,
{
    let mut report = UnwindReport::default();
    let mut stalled = 0u32;

    info!(
        plan = params.plan.name(),
        max_iterations = params.max_iterations,
        single_iteration = params.single_iteration,
        "unwind loop started"
    );

    while report.iterations < params.max_iterations {
        if shutdown.is_cancelled() {
            info!(iterations = report.iterations, "unwind loop cancelled");
            report.cancelled = true;
            break;
        }
        report.iterations += 1;
        let iteration = report.iterations;

        let debt_before = strategy.debt_snapshot()?.max_amount_to_repay();
        let (quote, fill, outcome, attempts) = step_with_retries(strategy, vault, aggregator, params).await?;
        let debt_after = strategy.debt_snapshot()?.max_amount_to_repay();

        if let Some(store) = store {
            store.save_step(strategy, vault)?;
        }

        let progressed = outcome.completed || outcome.events.swap_by_agg.is_some() || debt_after < debt_before;
        let completed = outcome.completed;
        report.record(StepReport {
            iteration,
            attempts,
            quote,
            provider: fill.map(|f| f.provider),
            debt_before,
            debt_after,
            outcome,
        });

        if completed {
            info!(iterations = iteration, "unwind completed");
            break;
        }
        if params.single_iteration {
            break;
        }

        if progressed {
            stalled = 0;
        } else {
            stalled += 1;
            warn!(iteration, stalled, "step made no progress");
            if stalled >= params.max_stalled_steps {
                return Err(UnwindError::Stalled { steps: stalled });
            }
        }
    }

    if !report.completed && !report.cancelled && !params.single_iteration {
        warn!(iterations = report.iterations, "iteration cap reached before completion");
    }
    Ok(report)
}

async fn step_with_retries<M, P, R, V, A>(
    strategy: &mut PairStrategy<M, P, R>,
    vault: &mut V,
    aggregator: &A,
    params: &LoopParams,
) -> Result<(Quote, Option<SwapFill>, StepOutcome, u32), UnwindError>
where
    M: MoneyMarket,
    P: PoolDepositor,
    R: SwapRouter,
    V: VaultSplitter,
    A: SwapAggregator,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let quote = strategy.quote_withdraw_by_agg(&params.plan, params.max_amount_to_swap)?;

        let result = match build_fill(strategy, aggregator, &quote).await {
            Ok(fill) => strategy
                .withdraw_by_agg_step(
                    StepRequest {
                        token_to_swap: quote.token_to_swap,
                        amount_to_swap: quote.amount_to_swap,
                        fill: fill.clone(),
                        plan: params.plan,
                        entry_to_pool: params.entry_to_pool,
                    },
                    vault,
                )
                .map(|outcome| (fill, outcome)),
            Err(e) => Err(e),
        };

        match result {
            Ok((fill, outcome)) => return Ok((quote, fill, outcome, attempts)),
            Err(e) if e.is_recoverable() && attempts <= params.max_step_retries => {
                warn!(attempt = attempts, error = %e, "step failed, re-quoting");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Ask the aggregator for calldata matching `quote`, if it requires a swap.
async fn build_fill<M, P, R, A>(
    strategy: &PairStrategy<M, P, R>,
    aggregator: &A,
    quote: &Quote,
) -> Result<Option<SwapFill>, UnwindError>
where
    M: MoneyMarket,
    P: PoolDepositor,
    R: SwapRouter,
    A: SwapAggregator,
{
    let Some(token_in) = quote.token_to_swap.filter(|_| quote.is_swap_required()) else {
        return Ok(None);
    };
    let side = strategy.state().side_of(token_in).ok_or_else(|| UnwindError::SwapMismatch {
        reason: format!("quoted token {token_in} is not a pool asset"),
    })?;
    let request = SwapRequest {
        token_in,
        token_out: strategy.state().token(side.other()),
        amount_in: quote.amount_to_swap,
        beneficiary: strategy.address(),
    };
    aggregator.build_swap(&request).await.map(Some)
}
