//! Venue-agnostic gateway interface.
//!
//! The core only ever talks to an exchange through [`ExchangeGateway`].
//! Each venue (Bybit, BingX, MEXC, ...) supplies its own implementation;
//! request signing and REST/WebSocket formatting live behind it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{
    ExchangePosition, InstrumentRules, OrderFill, OrderRequest, PairPrice, PositionSide,
};
use crate::error::GatewayError;

/// Venue identifier for multi-venue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Venue {
    Binance,
    Bybit,
    Bingx,
    Mexc,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Binance => write!(f, "Binance"),
            Venue::Bybit => write!(f, "Bybit"),
            Venue::Bingx => write!(f, "BingX"),
            Venue::Mexc => write!(f, "MEXC"),
        }
    }
}

impl FromStr for Venue {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Venue::Binance),
            "bybit" => Ok(Venue::Bybit),
            "bingx" => Ok(Venue::Bingx),
            "mexc" => Ok(Venue::Mexc),
            other => Err(format!("unknown venue: {other}")),
        }
    }
}

impl Venue {
    pub const ALL: [Venue; 4] = [Venue::Binance, Venue::Bybit, Venue::Bingx, Venue::Mexc];

    /// Short code for display (2-3 chars).
    pub fn short_code(&self) -> &'static str {
        match self {
            Venue::Binance => "BN",
            Venue::Bybit => "BB",
            Venue::Bingx => "BX",
            Venue::Mexc => "MX",
        }
    }

    /// Render a canonical `BASE/QUOTE` symbol in this venue's native format.
    pub fn format_symbol(&self, canonical: &str) -> String {
        let Some((base, quote)) = split_symbol(canonical) else {
            return canonical.to_ascii_uppercase();
        };
        match self {
            Venue::Binance | Venue::Bybit => format!("{base}{quote}"),
            Venue::Bingx => format!("{base}-{quote}"),
            Venue::Mexc => format!("{base}_{quote}"),
        }
    }
}

/// Quote assets recognised when a symbol carries no separator.
const KNOWN_QUOTES: [&str; 6] = ["USDT", "USDC", "BUSD", "BTC", "ETH", "BNB"];

/// Split a symbol into `(BASE, QUOTE)`.
///
/// Accepts `BTC/USDT`, `BTC-USDT`, `BTC_USDT`, `BTC:USDT` and concatenated
/// `BTCUSDT` (matched against known quote assets).
pub fn split_symbol(symbol: &str) -> Option<(String, String)> {
    let upper = symbol.trim().to_ascii_uppercase();
    if let Some((base, quote)) = upper.split_once(['/', '-', '_', ':']) {
        if base.is_empty() || quote.is_empty() {
            return None;
        }
        return Some((base.to_string(), quote.to_string()));
    }
    KNOWN_QUOTES.iter().find_map(|quote| {
        upper
            .strip_suffix(quote)
            .filter(|base| !base.is_empty())
            .map(|base| (base.to_string(), quote.to_string()))
    })
}

/// Canonical `BASE/QUOTE` form of any accepted symbol spelling.
pub fn canonical_symbol(symbol: &str) -> Option<String> {
    split_symbol(symbol).map(|(base, quote)| format!("{base}/{quote}"))
}

/// Handle to exactly one price subscription.
///
/// Dropping the handle or calling [`PriceStream::unsubscribe`] ends this
/// subscription only; other streams on the same connection are untouched.
#[derive(Debug)]
pub struct PriceStream {
    pub symbol: String,
    receiver: mpsc::UnboundedReceiver<PairPrice>,
    token: CancellationToken,
}

impl PriceStream {
    pub fn new(
        symbol: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<PairPrice>,
        token: CancellationToken,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            receiver,
            token,
        }
    }

    /// Next price update, `None` once the subscription has ended.
    pub async fn recv(&mut self) -> Option<PairPrice> {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::select! {
            _ = self.token.cancelled() => None,
            price = self.receiver.recv() => price,
        }
    }

    /// Token the producer side watches to drop this subscriber.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for PriceStream {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Uniform capability surface of one exchange account.
///
/// All calls are scoped to the credential the gateway was built with.
/// Symbols are passed in canonical `BASE/QUOTE` form.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Returns the venue identifier.
    fn venue(&self) -> Venue;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), GatewayError>;

    /// Close the whole position on one side with a reduce-only market order.
    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<OrderFill>, GatewayError>;

    /// Open positions, optionally restricted to one symbol.
    async fn get_positions(&self, symbol: Option<&str>)
        -> Result<Vec<ExchangePosition>, GatewayError>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError>;

    async fn get_market_price(&self, symbol: &str) -> Result<PairPrice, GatewayError>;

    async fn subscribe_price_stream(&self, symbol: &str) -> Result<PriceStream, GatewayError>;

    async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, GatewayError>;
}

/// Gateways available to the process, one per venue.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<Venue, Arc<dyn ExchangeGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, gateway: Arc<dyn ExchangeGateway>) -> Self {
        self.insert(gateway);
        self
    }

    pub fn insert(&mut self, gateway: Arc<dyn ExchangeGateway>) {
        self.gateways.insert(gateway.venue(), gateway);
    }

    pub fn get(&self, venue: Venue) -> Option<Arc<dyn ExchangeGateway>> {
        self.gateways.get(&venue).cloned()
    }

    pub fn venues(&self) -> Vec<Venue> {
        let mut venues: Vec<Venue> = self.gateways.keys().copied().collect();
        venues.sort();
        venues
    }
}

impl fmt::Debug for GatewayRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRegistry")
            .field("venues", &self.venues())
            .finish()
    }
}
