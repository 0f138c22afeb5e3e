use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};

use crate::types::{DebtLeg, EntryToPool, PairAmounts, Plan};

// ---------------------------------------------------------------------------
// Top-level aggregate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UnwindAppConfig {
    pub app: AppConfig,
    pub pair: PairConfig,
    pub unwind: UnwindConfig,
    pub insurance: InsuranceConfig,
    pub aggregator: AggregatorConfig,
    pub paper: Option<PaperConfig>,
}

// ---------------------------------------------------------------------------
// app.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    /// JSON file holding the persisted `PositionState`.
    pub state_file: String,
    /// Address the strategy acts as (swap beneficiary).
    pub strategy_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub log_dir: String,
}

// ---------------------------------------------------------------------------
// pair.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct PairConfig {
    /// Underlying (vault) asset.
    pub token_a: TokenConfig,
    pub token_b: TokenConfig,
    pub pool: String,
    pub stable_pool: bool,
    pub tick_spacing: i32,
    pub lower_tick: i32,
    pub upper_tick: i32,
    pub rebalance_tick_range: i32,
    /// `[lower_on, lower_off, upper_on, upper_off]`.
    pub fuse_thresholds: Vec<Decimal>,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold_a: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub liquidation_threshold_b: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub symbol: String,
    pub address: String,
    pub decimals: u32,
}

// ---------------------------------------------------------------------------
// unwind.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UnwindConfig {
    /// Structured plan, or the hex entry data an on-chain caller would pass.
    #[serde(deserialize_with = "plan_or_entry_data")]
    pub plan: Plan,
    pub entry_to_pool: EntryToPool,
    /// Run exactly one step instead of looping to completion.
    #[serde(default)]
    pub single_iteration: bool,
    /// Cap on a single swap, in units of the sold token.
    #[serde(default, with = "rust_decimal::serde::str_option")]
    pub max_amount_to_swap: Option<Decimal>,
    pub max_iterations: u32,
    pub max_step_retries: u32,
    pub max_stalled_steps: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub max_swap_deviation_pct: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub proportion_tolerance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub swap_amount_gap_pct: Decimal,
}

fn plan_or_entry_data<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Plan, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PlanInput {
        EntryData(String),
        Structured(Plan),
    }

    match PlanInput::deserialize(deserializer)? {
        PlanInput::Structured(plan) => Ok(plan),
        PlanInput::EntryData(data) => Plan::from_entry_data_hex(&data).map_err(serde::de::Error::custom),
    }
}

// ---------------------------------------------------------------------------
// insurance.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct InsuranceConfig {
    /// Per-operation draw ceiling, percent of invested assets.
    #[serde(with = "rust_decimal::serde::str")]
    pub max_draw_pct: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub accounting_epsilon: Decimal,
}

// ---------------------------------------------------------------------------
// aggregator.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregatorMode {
    /// Oracle-priced fills, no network.
    Paper,
    /// HTTP quotes from the configured providers.
    Live,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    pub mode: AggregatorMode,
    pub providers: Vec<AggregatorProviderConfig>,
    pub max_slippage_bps: u32,
    pub quote_cache_ttl_seconds: u64,
    #[serde(default = "default_quote_cache_size")]
    pub quote_cache_size: usize,
}

fn default_quote_cache_size() -> usize {
    crate::constants::DEFAULT_QUOTE_CACHE_SIZE
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorProviderConfig {
    pub name: String,
    pub enabled: bool,
    pub priority: u32,
    pub base_url: String,
    #[serde(default)]
    pub api_key_env: String,
    pub rate_limit_rps: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub approved_routers: Vec<String>,
}

// ---------------------------------------------------------------------------
// paper.json (optional)
// ---------------------------------------------------------------------------

/// Starting venue state for a dry run.
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    #[serde(with = "rust_decimal::serde::str")]
    pub price_a: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub price_b: Decimal,
    pub pool_tick: i32,
    pub range_half_width: i32,
    #[serde(with = "rust_decimal::serde::str")]
    pub pool_proportion_b: Decimal,
    pub swap_slippage_bps: u32,
    #[serde(with = "rust_decimal::serde::str")]
    pub borrow_ratio: Decimal,
    pub balances: PairAmounts,
    pub pool_deposit: PairAmounts,
    #[serde(with = "rust_decimal::serde::str")]
    pub pool_liquidity: Decimal,
    #[serde(default)]
    pub direct_debt: Option<DebtLeg>,
    #[serde(default)]
    pub reverse_debt: Option<DebtLeg>,
    #[serde(with = "rust_decimal::serde::str")]
    pub profit_buffer: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub insurance_balance: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub insurance_target: Decimal,
    /// Router address stamped on paper fills.
    pub router: String,
    /// JSON file holding the paper venues between runs.
    #[serde(default = "default_paper_ledger_file")]
    pub ledger_file: String,
}

fn default_paper_ledger_file() -> String {
    crate::constants::DEFAULT_PAPER_LEDGER_FILE.into()
}
