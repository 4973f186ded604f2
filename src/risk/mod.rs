//! Supervision of open hedge positions.
//!
//! - Liquidation proximity of leveraged legs
//! - Periodic and on-demand reconciliation against exchange state
//! - Operator close of both legs

mod liquidation;
mod monitor;

pub use liquidation::{liquidation_distance_pct, liquidation_proximity};
pub use monitor::{PositionMonitor, TickSummary};
