//! Position entities shared by the executors, the monitor and the store.
//!
//! - `HedgePosition`: two legs on two exchanges, opened by graduated entry
//! - `TriangularOpportunity` / `TriangularPosition`: three legs on one exchange

mod hedge;
mod lock;
mod triangular;

pub use hedge::{HedgeLeg, HedgePosition, HedgeStatus, LegRole, LegStatus};
pub use lock::{PositionGuard, PositionLocks};
pub use triangular::{
    Direction, ExecutionLeg, LegConversion, LegExecutionStatus, TriangleKey, TrianglePath,
    TriangularOpportunity, TriangularPosition, TriangularStatus,
};
