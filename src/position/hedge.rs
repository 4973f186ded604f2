//! Graduated-entry hedge position and its lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ArbError, Result};
use crate::exchange::{PositionSide, Venue};

/// Lifecycle of a hedge position.
///
/// `Initializing -> Executing -> Active -> {Completed | Liquidated | Error}`,
/// with `Error` and `Cancelled` reachable while opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HedgeStatus {
    Initializing,
    Executing,
    Active,
    Completed,
    Liquidated,
    Error,
    Cancelled,
}

impl HedgeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            HedgeStatus::Completed
                | HedgeStatus::Liquidated
                | HedgeStatus::Error
                | HedgeStatus::Cancelled
        )
    }

    pub fn can_transition_to(self, next: HedgeStatus) -> bool {
        use HedgeStatus::*;
        matches!(
            (self, next),
            (Initializing, Executing | Error | Cancelled)
                | (Executing, Active | Error | Cancelled)
                | (Active, Completed | Liquidated | Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HedgeStatus::Initializing => "INITIALIZING",
            HedgeStatus::Executing => "EXECUTING",
            HedgeStatus::Active => "ACTIVE",
            HedgeStatus::Completed => "COMPLETED",
            HedgeStatus::Liquidated => "LIQUIDATED",
            HedgeStatus::Error => "ERROR",
            HedgeStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for HedgeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the hedge a leg is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegRole {
    Primary,
    Hedge,
}

impl fmt::Display for LegRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LegRole::Primary => write!(f, "primary"),
            LegRole::Hedge => write!(f, "hedge"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LegStatus {
    Pending,
    Opening,
    Open,
    Closed,
    Failed,
}

/// One exchange side of a hedge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgeLeg {
    pub role: LegRole,
    pub exchange: Venue,
    pub side: PositionSide,
    pub leverage: u32,
    pub target_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub order_ids: Vec<String>,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub status: LegStatus,
    pub error: Option<String>,

    // Monitor-maintained
    pub unrealized_pnl: Decimal,
    pub funding_accrued: Decimal,
    pub trading_fees: Decimal,
    pub liquidation_price: Decimal,
    /// 0 at entry price, 1 at liquidation price
    pub liquidation_proximity: Decimal,
}

impl HedgeLeg {
    pub fn new(role: LegRole, exchange: Venue, side: PositionSide, leverage: u32) -> Self {
        Self {
            role,
            exchange,
            side,
            leverage,
            target_quantity: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            order_ids: Vec::new(),
            entry_price: Decimal::ZERO,
            current_price: Decimal::ZERO,
            status: LegStatus::Pending,
            error: None,
            unrealized_pnl: Decimal::ZERO,
            funding_accrued: Decimal::ZERO,
            trading_fees: Decimal::ZERO,
            liquidation_price: Decimal::ZERO,
            liquidation_proximity: Decimal::ZERO,
        }
    }

    /// Fold one slice fill into the leg, keeping a volume-weighted entry.
    pub fn record_fill(&mut self, order_id: String, quantity: Decimal, price: Decimal, fee: Decimal) {
        let new_qty = self.filled_quantity + quantity;
        if new_qty > Decimal::ZERO {
            self.entry_price = (self.entry_price * self.filled_quantity + price * quantity) / new_qty;
        }
        self.filled_quantity = new_qty;
        self.order_ids.push(order_id);
        self.trading_fees += fee;
        self.current_price = price;
    }
}

/// A two-exchange hedge opened by graduated entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HedgePosition {
    pub id: Uuid,
    /// Canonical symbol (`BASE/QUOTE`)
    pub symbol: String,
    pub primary: HedgeLeg,
    pub hedge: HedgeLeg,
    pub status: HedgeStatus,

    /// Reconciled total quantity shared by both legs
    pub quantity: Decimal,
    pub per_part_quantity: Decimal,
    pub parts: u32,
    pub delay_ms: u64,
    /// Slices dispatched so far
    pub current_part: u32,

    pub funding_accrued: Decimal,
    pub trading_fees: Decimal,
    pub unrealized_pnl: Decimal,

    pub monitoring_enabled: bool,
    pub monitoring_status: Option<String>,
    pub last_check_at: Option<DateTime<Utc>>,
    /// Leg found closed while the other stayed open
    pub liquidated_leg: Option<LegRole>,

    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl HedgePosition {
    pub fn new(
        symbol: impl Into<String>,
        primary: HedgeLeg,
        hedge: HedgeLeg,
        quantity: Decimal,
        per_part_quantity: Decimal,
        parts: u32,
        delay_ms: u64,
    ) -> Self {
        let now = Utc::now();
        let mut position = Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            primary,
            hedge,
            status: HedgeStatus::Initializing,
            quantity,
            per_part_quantity,
            parts,
            delay_ms,
            current_part: 0,
            funding_accrued: Decimal::ZERO,
            trading_fees: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            monitoring_enabled: false,
            monitoring_status: None,
            last_check_at: None,
            liquidated_leg: None,
            error: None,
            created_at: now,
            updated_at: now,
            activated_at: None,
            closed_at: None,
        };
        position.primary.target_quantity = quantity;
        position.hedge.target_quantity = quantity;
        position
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: HedgeStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ArbError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        match next {
            HedgeStatus::Active => self.activated_at = Some(now),
            s if s.is_terminal() => self.closed_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    pub fn leg(&self, role: LegRole) -> &HedgeLeg {
        match role {
            LegRole::Primary => &self.primary,
            LegRole::Hedge => &self.hedge,
        }
    }

    pub fn leg_mut(&mut self, role: LegRole) -> &mut HedgeLeg {
        match role {
            LegRole::Primary => &mut self.primary,
            LegRole::Hedge => &mut self.hedge,
        }
    }

    pub fn legs(&self) -> [&HedgeLeg; 2] {
        [&self.primary, &self.hedge]
    }

    /// Recompute aggregate counters from the legs.
    pub fn refresh_totals(&mut self) {
        self.funding_accrued = self.primary.funding_accrued + self.hedge.funding_accrued;
        self.trading_fees = self.primary.trading_fees + self.hedge.trading_fees;
        self.unrealized_pnl = self.primary.unrealized_pnl + self.hedge.unrealized_pnl;
        self.updated_at = Utc::now();
    }

    /// Net result so far: price PnL plus funding minus fees.
    pub fn net_pnl(&self) -> Decimal {
        self.unrealized_pnl + self.funding_accrued - self.trading_fees
    }

    /// Both legs hold the same filled size.
    pub fn is_balanced(&self) -> bool {
        self.primary.filled_quantity == self.hedge.filled_quantity
    }
}
