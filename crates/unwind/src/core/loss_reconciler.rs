//! Loss reconciler.
//!
//! Classifies the change of invested assets over one operation and routes it:
//! losses are covered by the vault's profit buffer, then by the insurance
//! reserve up to a per-operation ceiling, and the rest is reported to the
//! vault as uncovered. Gains repay the strategy's debt to insurance, then top
//! the reserve up to its target; the excess is left for distribution.
//!
//! [`reconcile`] is pure; [`apply`] performs every resulting transfer against
//! the vault handle in one call.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::UnwindError;
use crate::execution::adapters::VaultSplitter;
use crate::types::{CoverLossEvent, EventsSet, RebalancedEvent, SendToInsuranceEvent};

/// Vault-side balances visible to one reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveView {
    pub profit_buffer: Decimal,
    pub insurance_balance: Decimal,
    pub insurance_target: Decimal,
    pub debt_to_insurance: Decimal,
    /// Strategy's liquid underlying balance, the source of insurance sends.
    pub underlying_balance: Decimal,
}

/// Reconciliation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileLimits {
    /// Per-operation insurance draw ceiling, percent of invested assets before.
    pub max_insurance_draw_pct: Decimal,
    /// Deltas at or below this are ignored.
    pub epsilon: Decimal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reconciliation {
    pub loss: Decimal,
    pub gain: Decimal,
    pub covered_by_rewards: Decimal,
    pub covered_by_insurance: Decimal,
    pub uncovered: Decimal,
    /// Part of the gain owed to insurance for earlier covered losses.
    pub insurance_debt_repaid: Decimal,
    pub sent_to_insurance: Decimal,
    pub unsent_to_insurance: Decimal,
    pub to_distribution: Decimal,
}

impl Reconciliation {
    /// Change of the strategy's `debt_to_insurance`.
    pub fn debt_to_insurance_delta(&self) -> Decimal {
        self.covered_by_insurance - self.insurance_debt_repaid
    }
}

/// Classify `before → after`.
pub fn reconcile(
    before: Decimal,
    after: Decimal,
    view: &ReserveView,
    limits: &ReconcileLimits,
) -> Reconciliation {
    let delta = after - before;
    if delta.abs() <= limits.epsilon {
        return Reconciliation::default();
    }

    if delta < Decimal::ZERO {
        let loss = -delta;
        let covered_by_rewards = loss.min(view.profit_buffer.max(Decimal::ZERO));
        let rest = loss - covered_by_rewards;
        let ceiling = (before.max(Decimal::ZERO) * limits.max_insurance_draw_pct / dec!(100))
            .min(view.insurance_balance)
            .max(Decimal::ZERO);
        let covered_by_insurance = rest.min(ceiling);
        Reconciliation {
            loss,
            covered_by_rewards,
            covered_by_insurance,
            uncovered: rest - covered_by_insurance,
            ..Default::default()
        }
    } else {
        let gain = delta;
        let owed = gain.min(view.debt_to_insurance.max(Decimal::ZERO));
        let balance_after_repay = view.insurance_balance + owed;
        let top_up = (gain - owed).min((view.insurance_target - balance_after_repay).max(Decimal::ZERO));
        let wanted = owed + top_up;
        let sent = wanted.min(view.underlying_balance.max(Decimal::ZERO));
        Reconciliation {
            gain,
            insurance_debt_repaid: sent.min(owed),
            sent_to_insurance: sent,
            unsent_to_insurance: wanted - sent,
            to_distribution: gain - wanted,
            ..Default::default()
        }
    }
}

/// Execute the transfers of `rec` and record them.
///
/// Returns the amount of underlying that left the strategy.
pub fn apply<V: VaultSplitter>(
    rec: &Reconciliation,
    vault: &mut V,
    debt_to_insurance: &mut Decimal,
    events: &mut EventsSet,
    record_rebalanced: bool,
    profit_available: Decimal,
) -> Result<Decimal, UnwindError> {
    if rec.loss > Decimal::ZERO {
        if rec.covered_by_rewards > Decimal::ZERO {
            vault.consume_profit_buffer(rec.covered_by_rewards)?;
        }
        if rec.covered_by_insurance > Decimal::ZERO {
            vault.draw_insurance(rec.covered_by_insurance)?;
            events.cover_loss.push(CoverLossEvent {
                loss: rec.loss,
                amount_covered: rec.covered_by_insurance,
                debt_to_insurance_inc: rec.covered_by_insurance,
            });
        }
        if rec.uncovered > Decimal::ZERO {
            vault.register_uncovered_loss(rec.uncovered);
            events.uncovered_loss.push(rec.uncovered);
            warn!(
                loss = %rec.loss,
                uncovered = %rec.uncovered,
                "loss exceeds insurance ceiling, reported to vault"
            );
        }
    }
    if record_rebalanced {
        events.rebalanced = Some(RebalancedEvent {
            loss: rec.loss,
            profit_to_cover: profit_available,
            covered_by_rewards: rec.covered_by_rewards,
        });
    }

    if rec.gain > Decimal::ZERO {
        if rec.sent_to_insurance > Decimal::ZERO {
            vault.send_to_insurance(rec.sent_to_insurance)?;
        }
        if rec.sent_to_insurance > Decimal::ZERO || rec.unsent_to_insurance > Decimal::ZERO {
            events.send_to_insurance.push(SendToInsuranceEvent {
                sent_amount: rec.sent_to_insurance,
                unsent_amount: rec.unsent_to_insurance,
            });
        }
        if rec.to_distribution > Decimal::ZERO {
            events.to_distribution.push(rec.to_distribution);
        }
    }

    *debt_to_insurance = (*debt_to_insurance + rec.debt_to_insurance_delta()).max(Decimal::ZERO);

    if rec.loss > Decimal::ZERO || rec.gain > Decimal::ZERO {
        info!(
            loss = %rec.loss,
            gain = %rec.gain,
            rewards = %rec.covered_by_rewards,
            insurance = %rec.covered_by_insurance,
            uncovered = %rec.uncovered,
            sent = %rec.sent_to_insurance,
            "reconciled"
        );
    }
    Ok(rec.sent_to_insurance)
}
