//! Triangular opportunities and the positions that execute them.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ArbError, Result};
use crate::exchange::{OrderSide, PairPrice, Venue};

/// Which way round the cycle is traded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// A -> B -> C -> A
    Forward,
    /// A -> C -> B -> A
    Reverse,
}

/// Three assets forming a cycle that starts and ends in `asset_a`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrianglePath {
    pub asset_a: String,
    pub asset_b: String,
    pub asset_c: String,
    pub direction: Direction,
}

impl TrianglePath {
    /// Assets in trading order, start asset repeated at the end.
    pub fn hops(&self) -> [(&str, &str); 3] {
        let (a, b, c) = (self.asset_a.as_str(), self.asset_b.as_str(), self.asset_c.as_str());
        match self.direction {
            Direction::Forward => [(a, b), (b, c), (c, a)],
            Direction::Reverse => [(a, c), (c, b), (b, a)],
        }
    }
}

impl fmt::Display for TrianglePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [(a, b), (_, c), _] = self.hops();
        write!(f, "{a}->{b}->{c}->{a}")
    }
}

/// Dedup key: a consumer keeps only the latest opportunity per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriangleKey {
    pub exchange: Venue,
    pub asset_a: String,
    pub asset_b: String,
    pub asset_c: String,
    pub direction: Direction,
}

impl TriangleKey {
    pub fn new(exchange: Venue, path: &TrianglePath) -> Self {
        Self {
            exchange,
            asset_a: path.asset_a.clone(),
            asset_b: path.asset_b.clone(),
            asset_c: path.asset_c.clone(),
            direction: path.direction,
        }
    }
}

/// One conversion step of a cycle: spend `from_asset`, receive `to_asset`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegConversion {
    /// Canonical pair traded (`BASE/QUOTE`)
    pub symbol: String,
    pub from_asset: String,
    pub to_asset: String,
    /// Buy when spending the quote asset, sell when spending the base asset
    pub side: OrderSide,
}

/// A detected cycle with the prices it was evaluated at.
///
/// Immutable once published. Later detections of the same triangle carry a
/// new id and supersede this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangularOpportunity {
    pub id: Uuid,
    pub exchange: Venue,
    pub path: TrianglePath,
    pub legs: [LegConversion; 3],
    pub prices: [PairPrice; 3],
    /// Cross-rate profit at mid prices, percent
    pub theoretical_profit_pct: Decimal,
    /// Profit after crossing the spread, fees and slippage buffer, percent
    pub realistic_profit_pct: Decimal,
    /// Realistic profit on the reference size, in start asset
    pub profit_amount: Decimal,
    /// Size `profit_amount` was computed for
    pub reference_size: Decimal,
    pub estimated_slippage_pct: Decimal,
    pub is_executable: bool,
    pub detected_at: DateTime<Utc>,
}

impl TriangularOpportunity {
    pub fn key(&self) -> TriangleKey {
        TriangleKey::new(self.exchange, &self.path)
    }

    pub fn age_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.detected_at).num_milliseconds()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriangularStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TriangularStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TriangularStatus::Completed | TriangularStatus::Failed | TriangularStatus::Cancelled
        )
    }
}

impl fmt::Display for TriangularStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriangularStatus::Pending => "pending",
            TriangularStatus::Executing => "executing",
            TriangularStatus::Completed => "completed",
            TriangularStatus::Failed => "failed",
            TriangularStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegExecutionStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    /// Not attempted because an earlier leg failed
    Skipped,
}

/// Execution record of one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLeg {
    pub leg_number: u8,
    pub symbol: String,
    pub side: OrderSide,
    pub from_asset: String,
    pub to_asset: String,
    pub status: LegExecutionStatus,
    /// Amount of `from_asset` this leg spends
    pub input_amount: Decimal,
    /// Amount of `to_asset` actually received, net of fees
    pub output_amount: Decimal,
    /// Base quantity ordered
    pub target_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub estimated_price: Decimal,
    pub actual_price: Decimal,
    /// (actual - estimated) / estimated
    pub slippage: Decimal,
    pub fee: Decimal,
    pub fee_asset: Option<String>,
    pub order_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub error: Option<String>,
}

impl ExecutionLeg {
    pub fn new(leg_number: u8, conversion: &LegConversion, estimated_price: Decimal) -> Self {
        Self {
            leg_number,
            symbol: conversion.symbol.clone(),
            side: conversion.side,
            from_asset: conversion.from_asset.clone(),
            to_asset: conversion.to_asset.clone(),
            status: LegExecutionStatus::Pending,
            input_amount: Decimal::ZERO,
            output_amount: Decimal::ZERO,
            target_quantity: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            estimated_price,
            actual_price: Decimal::ZERO,
            slippage: Decimal::ZERO,
            fee: Decimal::ZERO,
            fee_asset: None,
            order_id: None,
            started_at: None,
            completed_at: None,
            execution_time_ms: None,
            error: None,
        }
    }
}

/// Three-leg execution of one opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangularPosition {
    pub id: Uuid,
    pub opportunity_id: Uuid,
    pub exchange: Venue,
    pub path: TrianglePath,
    pub legs: [ExecutionLeg; 3],
    pub status: TriangularStatus,
    /// Amount of start asset committed
    pub initial_amount: Decimal,
    /// Amount of start asset recovered after leg 3
    pub final_amount: Decimal,
    pub expected_profit_pct: Decimal,
    pub expected_profit: Decimal,
    pub actual_profit: Decimal,
    pub actual_profit_pct: Decimal,
    /// Leg number that failed, if any
    pub error_leg: Option<u8>,
    pub error: Option<String>,
    /// Asset and amount held when execution stopped early
    pub stranded_asset: Option<(String, Decimal)>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TriangularPosition {
    pub fn from_opportunity(opportunity: &TriangularOpportunity, initial_amount: Decimal) -> Self {
        let now = Utc::now();
        let legs = [0usize, 1, 2].map(|i| {
            let conversion = &opportunity.legs[i];
            let price = &opportunity.prices[i];
            let estimated = match conversion.side {
                OrderSide::Buy => price.ask,
                OrderSide::Sell => price.bid,
            };
            ExecutionLeg::new(i as u8 + 1, conversion, estimated)
        });
        let expected_profit = initial_amount * opportunity.realistic_profit_pct / Decimal::ONE_HUNDRED;

        Self {
            id: Uuid::new_v4(),
            opportunity_id: opportunity.id,
            exchange: opportunity.exchange,
            path: opportunity.path.clone(),
            legs,
            status: TriangularStatus::Pending,
            initial_amount,
            final_amount: Decimal::ZERO,
            expected_profit_pct: opportunity.realistic_profit_pct,
            expected_profit,
            actual_profit: Decimal::ZERO,
            actual_profit_pct: Decimal::ZERO,
            error_leg: None,
            error: None,
            stranded_asset: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Mark leg `number` (1-based) as executing.
    ///
    /// Refused unless every earlier leg has completed and the position is
    /// executing.
    pub fn begin_leg(&mut self, number: u8) -> Result<&mut ExecutionLeg> {
        let idx = leg_index(number)?;
        if self.status != TriangularStatus::Executing {
            return Err(ArbError::InvalidTransition {
                from: self.status.to_string(),
                to: format!("leg {number} executing"),
            });
        }
        if let Some(prev) = self.legs[..idx]
            .iter()
            .find(|l| l.status != LegExecutionStatus::Completed)
        {
            return Err(ArbError::InvalidTransition {
                from: format!("leg {} {:?}", prev.leg_number, prev.status),
                to: format!("leg {number} executing"),
            });
        }
        let leg = &mut self.legs[idx];
        if leg.status != LegExecutionStatus::Pending {
            return Err(ArbError::InvalidTransition {
                from: format!("leg {number} {:?}", leg.status),
                to: format!("leg {number} executing"),
            });
        }
        leg.status = LegExecutionStatus::Executing;
        leg.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
        Ok(&mut self.legs[idx])
    }

    /// Fail leg `number`, skip the legs after it, fail the position.
    pub fn fail_leg(&mut self, number: u8, error: String) {
        let Ok(idx) = leg_index(number) else {
            return;
        };
        let now = Utc::now();
        {
            let leg = &mut self.legs[idx];
            leg.status = LegExecutionStatus::Failed;
            leg.error = Some(error.clone());
            leg.completed_at = Some(now);
            leg.execution_time_ms = leg.started_at.map(|s| (now - s).num_milliseconds());
        }
        for leg in self.legs[idx + 1..].iter_mut() {
            leg.status = LegExecutionStatus::Skipped;
        }

        // What we hold now is whatever the last completed leg delivered
        self.stranded_asset = match idx {
            0 => None,
            _ => {
                let prev = &self.legs[idx - 1];
                Some((prev.to_asset.clone(), prev.output_amount))
            }
        };
        self.error_leg = Some(number);
        self.error = Some(error);
        self.status = TriangularStatus::Failed;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Stop before the next leg: pending legs are skipped and whatever the
    /// last completed leg delivered is recorded as held.
    pub fn cancel_remaining(&mut self) {
        let now = Utc::now();
        for leg in self.legs.iter_mut() {
            if leg.status == LegExecutionStatus::Pending {
                leg.status = LegExecutionStatus::Skipped;
            }
        }
        self.stranded_asset = self
            .legs
            .iter()
            .rev()
            .find(|l| l.status == LegExecutionStatus::Completed)
            .map(|l| (l.to_asset.clone(), l.output_amount));
        self.status = TriangularStatus::Cancelled;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    /// Leg currently executing, if any.
    pub fn executing_leg(&self) -> Option<&ExecutionLeg> {
        self.legs
            .iter()
            .find(|l| l.status == LegExecutionStatus::Executing)
    }

    /// Every leg after a non-completed leg is idle.
    pub fn legs_are_sequential(&self) -> bool {
        self.legs.windows(2).all(|pair| {
            pair[1].status == LegExecutionStatus::Pending
                || pair[1].status == LegExecutionStatus::Skipped
                || pair[0].status == LegExecutionStatus::Completed
        })
    }
}

fn leg_index(number: u8) -> Result<usize> {
    match number {
        1..=3 => Ok(number as usize - 1),
        _ => Err(ArbError::Validation(format!("leg number {number} out of range"))),
    }
}
