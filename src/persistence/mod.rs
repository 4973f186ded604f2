//! Position storage.
//!
//! The core only needs `create`, `update`, `get` and `find` for both
//! position families. Two implementations:
//! - `MemoryPositionStore`: process-local, used by tests and paper sessions
//! - `SqlitePositionStore`: survives restarts

mod memory;
mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::exchange::Venue;
use crate::position::{HedgePosition, HedgeStatus, TriangularPosition, TriangularStatus};

pub use memory::MemoryPositionStore;
pub use sqlite::SqlitePositionStore;

/// Selects hedge positions. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HedgeFilter {
    pub statuses: Vec<HedgeStatus>,
    pub symbol: Option<String>,
    pub monitoring_enabled: Option<bool>,
    /// Matches either leg's exchange
    pub exchange: Option<Venue>,
}

impl HedgeFilter {
    pub fn status(status: HedgeStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Self::default()
        }
    }

    /// Active positions with monitoring switched on.
    pub fn monitored() -> Self {
        Self {
            statuses: vec![HedgeStatus::Active],
            monitoring_enabled: Some(true),
            ..Self::default()
        }
    }

    pub fn matches(&self, position: &HedgePosition) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&position.status))
            && self.symbol.as_ref().map_or(true, |s| *s == position.symbol)
            && self
                .monitoring_enabled
                .map_or(true, |m| m == position.monitoring_enabled)
            && self.exchange.map_or(true, |v| {
                position.primary.exchange == v || position.hedge.exchange == v
            })
    }
}

/// Selects triangular positions. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TriangularFilter {
    pub statuses: Vec<TriangularStatus>,
    pub exchange: Option<Venue>,
}

impl TriangularFilter {
    pub fn matches(&self, position: &TriangularPosition) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&position.status))
            && self.exchange.map_or(true, |v| v == position.exchange)
    }
}

/// Persistence for position entities.
///
/// `update` replaces the stored snapshot and fails with `NotFound` when the
/// id was never created. Results of `find` are ordered by creation time.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn create_hedge(&self, position: &HedgePosition) -> Result<()>;
    async fn update_hedge(&self, position: &HedgePosition) -> Result<()>;
    async fn get_hedge(&self, id: Uuid) -> Result<Option<HedgePosition>>;
    async fn find_hedges(&self, filter: &HedgeFilter) -> Result<Vec<HedgePosition>>;

    async fn create_triangular(&self, position: &TriangularPosition) -> Result<()>;
    async fn update_triangular(&self, position: &TriangularPosition) -> Result<()>;
    async fn get_triangular(&self, id: Uuid) -> Result<Option<TriangularPosition>>;
    async fn find_triangular(&self, filter: &TriangularFilter) -> Result<Vec<TriangularPosition>>;
    /// Returns whether a position was removed.
    async fn delete_triangular(&self, id: Uuid) -> Result<bool>;
}
