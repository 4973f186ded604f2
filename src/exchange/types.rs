//! Venue-neutral request and response types shared by all gateways.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Direction of a derivatives position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Order side that opens (or adds to) a position on this side.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// +1 for long, -1 for short. Used for PnL sign.
    pub fn sign(self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "long"),
            PositionSide::Short => write!(f, "short"),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
}

/// Order status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// New order request.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRequest {
    /// Canonical symbol (`BASE/QUOTE`); gateways translate to their own format
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    /// Quantity in base asset
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    /// Derivatives position this order belongs to (hedge mode)
    pub position_side: Option<PositionSide>,
    pub reduce_only: bool,
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// Market order for `quantity` base units.
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            position_side: None,
            reduce_only: false,
            client_order_id: None,
        }
    }

    pub fn with_position_side(mut self, side: PositionSide) -> Self {
        self.position_side = Some(side);
        self
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Exchange acknowledgement of an order, with whatever fill it reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    /// Filled quantity in base asset
    pub filled_qty: Decimal,
    /// Average fill price (zero when unfilled)
    pub avg_price: Decimal,
    /// Fee charged for this order
    pub fee: Decimal,
    /// Asset the fee was charged in
    pub fee_asset: String,
    pub timestamp: DateTime<Utc>,
}

impl OrderFill {
    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled && self.filled_qty > Decimal::ZERO
    }

    /// Fee expressed in the quote asset, given the symbol's base asset.
    pub fn fee_in_quote(&self, base: Option<&str>) -> Decimal {
        if base == Some(self.fee_asset.as_str()) {
            self.fee * self.avg_price
        } else {
            self.fee
        }
    }
}

/// A derivatives position as the exchange reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute size in base asset (zero = closed)
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub liquidation_price: Decimal,
    pub unrealized_pnl: Decimal,
    /// Funding received (positive) or paid (negative) since open
    pub accumulated_funding: Decimal,
    pub leverage: u32,
}

impl ExchangePosition {
    pub fn is_open(&self) -> bool {
        self.size > Decimal::ZERO
    }
}

/// Trading rules for one instrument on one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub qty_step: Decimal,
    pub price_precision: u32,
    pub qty_precision: u32,
}

/// Top-of-book snapshot for one trading pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairPrice {
    /// Canonical symbol (`BASE/QUOTE`)
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PairPrice {
    /// Mid price, falling back to last trade when the book is one-sided.
    pub fn mid(&self) -> Decimal {
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            (self.bid + self.ask) / Decimal::TWO
        } else {
            self.last
        }
    }

    /// Relative spread (ask - bid) / mid, zero when undefined.
    pub fn relative_spread(&self) -> Decimal {
        let mid = self.mid();
        if mid <= Decimal::ZERO || self.ask < self.bid {
            return Decimal::ZERO;
        }
        (self.ask - self.bid) / mid
    }

    pub fn is_quoted(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO
    }
}
