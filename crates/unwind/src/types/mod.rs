pub mod aggregator;
pub mod debt;
pub mod events;
pub mod plan;
pub mod position;
pub mod wad;

pub use aggregator::{SwapFill, SwapRequest};
pub use debt::{DebtDirection, DebtLeg, DebtSnapshot, LiquidationThresholds};
pub use events::{
    BorrowedEvent, CoverLossEvent, EnteredPoolEvent, EventsSet, FixPriceChangesEvent,
    RebalancedEvent, SendToInsuranceEvent, SwapByAggEvent,
};
pub use plan::{EntryToPool, Plan, PropTarget, Quote};
pub use position::{FuseStatus, FuseThresholds, PairAmounts, PairSide, PositionState};
pub use wad::Wad;
