//! Unwind planner: sizes the swap of one withdrawal step.
//!
//! Everything here is pure arithmetic over a [`QuoteContext`]: callers may
//! quote speculatively any number of times without touching position state.
//! The module also sizes the borrow that restores the pool proportion before
//! leftover balances are deposited back.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::debug;

use crate::errors::UnwindError;
use crate::types::{DebtDirection, DebtLeg, DebtSnapshot, LiquidationThresholds, PairAmounts, PairSide, Plan};

/// Inputs of a quote, captured by the strategy immediately before quoting.
#[derive(Debug, Clone, Copy)]
pub struct QuoteContext {
    /// Liquid balances plus what the pool would return on a full exit.
    pub holdings: PairAmounts,
    pub debts: DebtSnapshot,
    pub thresholds: LiquidationThresholds,
    /// Value share of token B required by the pool's current range.
    pub pool_proportion: Decimal,
    /// Over-sizing of debt-covering swaps, in percent.
    pub swap_gap_pct: Decimal,
    /// Upper bound on the swapped amount; `None` is uncapped.
    pub max_amount_to_swap: Option<Decimal>,
}

/// What to sell and how much. `None` from [`quote`] means no swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSizing {
    pub sell: PairSide,
    pub amount: Decimal,
}

/// Size the swap for `plan`.
pub fn quote(plan: &Plan, ctx: &QuoteContext) -> Result<Option<SwapSizing>, UnwindError> {
    plan.validate()?;
    let p = plan.prop().resolve(ctx.pool_proportion);
    if p < Decimal::ZERO || p > Decimal::ONE {
        return Err(UnwindError::ProportionOutOfRange { value: p.to_string() });
    }
    let active = ctx.debts.active()?;
    let prices = ctx.debts.prices;

    let raw = match plan {
        Plan::SwapOnly { .. } => swap_toward(p, &ctx.holdings, &ctx.holdings, &prices),
        Plan::SwapRepay { .. } => {
            let post = after_full_repay(&ctx.holdings, active);
            swap_toward(p, &post, &ctx.holdings, &prices)
        }
        Plan::RepaySwapRepay {
            debt_amount_to_reduce,
            ..
        } => repay_swap_repay(p, *debt_amount_to_reduce, ctx, active),
    };

    let sizing = raw.and_then(|s| {
        let amount = ctx.thresholds.floor(s.sell, s.amount);
        let amount = match ctx.max_amount_to_swap {
            Some(cap) => amount.min(cap),
            None => amount,
        };
        (amount > Decimal::ZERO).then_some(SwapSizing { sell: s.sell, amount })
    });

    debug!(
        plan = plan.name(),
        target = %p,
        sell = sizing.map(|s| s.sell.as_str()),
        amount = %sizing.map(|s| s.amount).unwrap_or_default(),
        "quote computed"
    );
    Ok(sizing)
}

/// Swap that moves `target_holdings` to B share `p`, capped by `available`.
///
/// Oracle-priced swaps preserve value, so selling `(pV - b·pB) / pA` of A
/// lands exactly on the target share.
fn swap_toward(
    p: Decimal,
    target_holdings: &PairAmounts,
    available: &PairAmounts,
    prices: &PairAmounts,
) -> Option<SwapSizing> {
    if prices.a <= Decimal::ZERO || prices.b <= Decimal::ZERO {
        return None;
    }
    let total = target_holdings.value_usd(prices);
    if total <= Decimal::ZERO {
        return None;
    }
    let delta = p * total - target_holdings.b * prices.b;
    if delta > Decimal::ZERO {
        Some(SwapSizing {
            sell: PairSide::A,
            amount: (delta / prices.a).min(available.a.max(Decimal::ZERO)),
        })
    } else if delta < Decimal::ZERO {
        Some(SwapSizing {
            sell: PairSide::B,
            amount: (-delta / prices.b).min(available.b.max(Decimal::ZERO)),
        })
    } else {
        None
    }
}

/// Holdings after the active leg is repaid in full and its collateral returned.
/// The borrow side may go negative: that shortfall is what the swap must cover.
fn after_full_repay(holdings: &PairAmounts, active: Option<(DebtDirection, DebtLeg)>) -> PairAmounts {
    let mut post = *holdings;
    if let Some((direction, leg)) = active {
        *post.get_mut(direction.collateral_side()) += leg.collateral;
        *post.get_mut(direction.borrow_side()) -= leg.amount_to_repay;
    }
    post
}

fn repay_swap_repay(
    p: Decimal,
    debt_amount_to_reduce: Decimal,
    ctx: &QuoteContext,
    active: Option<(DebtDirection, DebtLeg)>,
) -> Option<SwapSizing> {
    let prices = ctx.debts.prices;
    let Some((direction, leg)) = active else {
        return swap_toward(p, &ctx.holdings, &ctx.holdings, &prices);
    };
    let borrow_side = direction.borrow_side();
    let collateral_side = direction.collateral_side();

    // Phase 1: repay with the borrow asset already on hand.
    let repaid = leg.amount_to_repay.min(ctx.holdings.get(borrow_side).max(Decimal::ZERO));
    let mut holdings = ctx.holdings;
    *holdings.get_mut(borrow_side) -= repaid;
    *holdings.get_mut(collateral_side) += leg.collateral_for(repaid);
    let remaining = leg.after_repay(repaid);

    let required = debt_amount_to_reduce.min(leg.amount_to_repay) - repaid;
    if required > Decimal::ZERO {
        let price_borrow = prices.get(borrow_side);
        let price_collateral = prices.get(collateral_side);
        if price_collateral <= Decimal::ZERO {
            return None;
        }
        let gap = Decimal::ONE + ctx.swap_gap_pct / dec!(100);
        let amount = required * price_borrow / price_collateral * gap;
        return Some(SwapSizing {
            sell: collateral_side,
            amount: amount.min(holdings.get(collateral_side).max(Decimal::ZERO)),
        });
    }

    let remaining_active = (!remaining.is_empty()).then_some((direction, remaining));
    let post = after_full_repay(&holdings, remaining_active);
    swap_toward(p, &post, &holdings, &prices)
}

// ---------------------------------------------------------------------------
// Borrow before pool entry
// ---------------------------------------------------------------------------

/// Collateral to post so liquid balances reach the pool proportion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryBorrow {
    pub direction: DebtDirection,
    /// Collateral in collateral-asset units.
    pub collateral_amount: Decimal,
}

/// Size the borrow that brings `balances` to B share `q` before entry.
///
/// With `V` the liquid value and `k` the borrow ratio, posting `x` USD of A
/// and borrowing `k·x` of B yields share `q` when
/// `x = (qV - b·pB) / (k(1-q) + q)`; the reverse direction uses
/// `y = (b·pB - qV) / (1 - q + qk)`. A borrow opposite to an existing debt is
/// never opened, and shares within `tolerance` of `q` need no borrow.
pub fn entry_borrow(
    balances: &PairAmounts,
    q: Decimal,
    prices: &PairAmounts,
    borrow_ratio: Decimal,
    tolerance: Decimal,
    active: Option<DebtDirection>,
    thresholds: &LiquidationThresholds,
) -> Option<EntryBorrow> {
    if prices.a <= Decimal::ZERO || prices.b <= Decimal::ZERO || borrow_ratio <= Decimal::ZERO {
        return None;
    }
    let value = balances.value_usd(prices);
    let share = balances.share_b(prices)?;
    if (share - q).abs() <= tolerance {
        return None;
    }
    let value_b = balances.b * prices.b;

    let (direction, usd) = if share < q {
        let denom = borrow_ratio * (Decimal::ONE - q) + q;
        (DebtDirection::Direct, (q * value - value_b) / denom)
    } else {
        let denom = Decimal::ONE - q + q * borrow_ratio;
        (DebtDirection::Reverse, (value_b - q * value) / denom)
    };
    if active == Some(direction.opposite()) {
        debug!(direction = direction.as_str(), "entry borrow blocked by opposite debt");
        return None;
    }
    if usd <= Decimal::ZERO {
        return None;
    }

    let side = direction.collateral_side();
    let amount = (usd / prices.get(side)).min(balances.get(side));
    let amount = thresholds.floor(side, amount);
    (amount > Decimal::ZERO).then_some(EntryBorrow {
        direction,
        collateral_amount: amount,
    })
}
