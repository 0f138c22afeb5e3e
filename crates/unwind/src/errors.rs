use rust_decimal::Decimal;
use thiserror::Error;

/// Typed error hierarchy for the unwind engine.
///
/// Library-internal errors use specific variants; application code wraps with
/// `anyhow::Context` for propagation. [`UnwindError::is_recoverable`] splits
/// the taxonomy: recoverable errors revert one step and may be retried with a
/// fresh quote, everything else stops the orchestration loop.
#[derive(Error, Debug)]
pub enum UnwindError {
    // -- Plan / quote (fatal) -----------------------------------------------
    #[error("invalid plan kind: {kind}")]
    InvalidPlanKind { kind: String },

    #[error("target proportion {value} is outside [0, 1]")]
    ProportionOutOfRange { value: String },

    #[error("malformed plan entry data: {reason}")]
    MalformedPlan { reason: String },

    #[error("direct and reverse debts coexist (direct {direct}, reverse {reverse})")]
    DebtDirectionConflict { direct: Decimal, reverse: Decimal },

    // -- Fuse (fatal) -------------------------------------------------------
    #[error("fuse inconsistency: withdraw_done is set while fuse is {status}")]
    FuseInconsistency { status: String },

    #[error("invalid fuse thresholds: {reason}")]
    InvalidFuseThresholds { reason: String },

    // -- Step execution (recoverable) ---------------------------------------
    #[error("swap deviation {deviation_pct:.4}% exceeds max {max_pct}% (expected {expected}, got {received})")]
    SwapDeviation {
        expected: Decimal,
        received: Decimal,
        deviation_pct: Decimal,
        max_pct: Decimal,
    },

    #[error("swap fill does not match the step: {reason}")]
    SwapMismatch { reason: String },

    #[error("insufficient {token} balance: required {required}, available {available}")]
    InsufficientBalance {
        token: String,
        required: Decimal,
        available: Decimal,
    },

    #[error("{component} call failed: {reason}")]
    Adapter { component: String, reason: String },

    #[error("pool entry failed: {reason}")]
    PoolEntryFailed { reason: String },

    #[error("all aggregator providers failed")]
    AggregatorUnavailable,

    // -- Orchestration ------------------------------------------------------
    #[error("unwind stalled: no progress in {steps} consecutive steps")]
    Stalled { steps: u32 },

    #[error("rebalance is not needed")]
    NoRebalanceNeeded,

    // -- Persistence (fatal) ------------------------------------------------
    #[error("persisted records disagree: {reason}")]
    RecordMismatch { reason: String },

    // -- Configuration ------------------------------------------------------
    #[error("configuration error: {0}")]
    Config(String),

    // -- Forwarded errors ---------------------------------------------------
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UnwindError {
    /// Shorthand for a failed collaborator call.
    pub fn adapter(component: &str, reason: impl Into<String>) -> Self {
        Self::Adapter {
            component: component.into(),
            reason: reason.into(),
        }
    }

    /// Whether the orchestration loop may re-quote and retry after this error.
    ///
    /// Plan/state corruption and fuse inconsistencies are fatal and require
    /// manual intervention.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SwapDeviation { .. }
                | Self::SwapMismatch { .. }
                | Self::InsufficientBalance { .. }
                | Self::Adapter { .. }
                | Self::PoolEntryFailed { .. }
                | Self::AggregatorUnavailable
                | Self::Reqwest(_)
        )
    }
}
