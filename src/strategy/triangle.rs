//! Price graph and triangle profitability math.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use uuid::Uuid;

use crate::config::TriangularConfig;
use crate::exchange::{split_symbol, OrderSide, PairPrice, Venue};
use crate::position::{Direction, LegConversion, TrianglePath, TriangularOpportunity};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Thresholds used to score triangles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TriangleParams {
    /// Taker fee per leg as a fraction
    pub fee_rate: Decimal,
    /// Minimum slippage assumed per leg, percent
    pub slippage_buffer_pct: Decimal,
    pub max_slippage_pct: Decimal,
    pub min_profit_threshold_pct: Decimal,
    /// Size in start asset used for `profit_amount`
    pub reference_size: Decimal,
}

impl From<&TriangularConfig> for TriangleParams {
    fn from(config: &TriangularConfig) -> Self {
        Self {
            fee_rate: config.fee_rate,
            slippage_buffer_pct: config.slippage_buffer_pct,
            max_slippage_pct: config.max_slippage_pct,
            min_profit_threshold_pct: config.min_profit_threshold_pct,
            reference_size: config.default_position_size,
        }
    }
}

/// A path together with the pair traded on each hop.
#[derive(Debug, Clone, PartialEq)]
pub struct TriangleRoute {
    pub path: TrianglePath,
    pub legs: [LegConversion; 3],
}

impl TriangleRoute {
    pub fn uses(&self, symbol: &str) -> bool {
        self.legs.iter().any(|l| l.symbol == symbol)
    }
}

/// Latest prices of one exchange's symbol universe.
#[derive(Debug, Default, Clone)]
pub struct PriceGraph {
    prices: HashMap<String, PairPrice>,
    /// (base, quote) -> canonical symbol
    pairs: HashMap<(String, String), String>,
}

impl PriceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a symbol without a price yet.
    pub fn add_symbol(&mut self, symbol: &str) -> bool {
        let Some((base, quote)) = split_symbol(symbol) else {
            return false;
        };
        let canonical = format!("{base}/{quote}");
        self.pairs.insert((base, quote), canonical);
        true
    }

    /// Store a price update. Returns false for unparseable symbols.
    pub fn update(&mut self, price: PairPrice) -> bool {
        if !self.add_symbol(&price.symbol) {
            return false;
        }
        self.prices.insert(price.symbol.clone(), price);
        true
    }

    pub fn price(&self, symbol: &str) -> Option<&PairPrice> {
        self.prices.get(symbol)
    }

    pub fn symbol_count(&self) -> usize {
        self.pairs.len()
    }

    /// Pair and side that turn `from` into `to`.
    pub fn conversion(&self, from: &str, to: &str) -> Option<LegConversion> {
        let (symbol, side) = if let Some(s) = self.pairs.get(&(to.to_string(), from.to_string())) {
            (s, OrderSide::Buy)
        } else {
            (self.pairs.get(&(from.to_string(), to.to_string()))?, OrderSide::Sell)
        };
        Some(LegConversion {
            symbol: symbol.clone(),
            from_asset: from.to_string(),
            to_asset: to.to_string(),
            side,
        })
    }

    fn neighbours(&self, asset: &str) -> BTreeSet<&str> {
        self.pairs
            .keys()
            .filter_map(|(base, quote)| {
                if base == asset {
                    Some(quote.as_str())
                } else if quote == asset {
                    Some(base.as_str())
                } else {
                    None
                }
            })
            .collect()
    }

    /// Every cycle starting at `start`, both directions.
    pub fn routes_from(&self, start: &str) -> Vec<TriangleRoute> {
        let neighbours: Vec<&str> = self.neighbours(start).into_iter().collect();
        let mut routes = Vec::new();
        for (i, b) in neighbours.iter().enumerate() {
            for c in &neighbours[i + 1..] {
                if self.conversion(b, c).is_none() {
                    continue;
                }
                for direction in [Direction::Forward, Direction::Reverse] {
                    let path = TrianglePath {
                        asset_a: start.to_string(),
                        asset_b: b.to_string(),
                        asset_c: c.to_string(),
                        direction,
                    };
                    if let Some(route) = self.route(path) {
                        routes.push(route);
                    }
                }
            }
        }
        routes
    }

    pub fn route(&self, path: TrianglePath) -> Option<TriangleRoute> {
        let [h1, h2, h3] = path.hops();
        let legs = [
            self.conversion(h1.0, h1.1)?,
            self.conversion(h2.0, h2.1)?,
            self.conversion(h3.0, h3.1)?,
        ];
        Some(TriangleRoute { path, legs })
    }
}

/// Apply one conversion to `amount` at `rate` (price of base in quote).
pub fn convert(amount: Decimal, side: OrderSide, rate: Decimal) -> Decimal {
    if rate <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    match side {
        OrderSide::Buy => amount / rate,
        OrderSide::Sell => amount * rate,
    }
}

/// Score a route at the graph's current prices.
///
/// Returns `None` while any leg lacks a usable price.
pub fn evaluate(
    exchange: Venue,
    route: &TriangleRoute,
    graph: &PriceGraph,
    params: &TriangleParams,
    now: DateTime<Utc>,
) -> Option<TriangularOpportunity> {
    let prices = [
        graph.price(&route.legs[0].symbol)?.clone(),
        graph.price(&route.legs[1].symbol)?.clone(),
        graph.price(&route.legs[2].symbol)?.clone(),
    ];
    if prices.iter().any(|p| !p.is_quoted()) {
        return None;
    }

    let mut at_mid = Decimal::ONE;
    let mut crossing = Decimal::ONE;
    let mut slippage = Decimal::ZERO;
    for (leg, price) in route.legs.iter().zip(&prices) {
        at_mid = convert(at_mid, leg.side, price.mid());
        let executable = match leg.side {
            OrderSide::Buy => price.ask,
            OrderSide::Sell => price.bid,
        };
        crossing = convert(crossing, leg.side, executable);
        slippage += params
            .slippage_buffer_pct
            .max(price.relative_spread() * HUNDRED / Decimal::TWO);
    }

    let theoretical = (at_mid - Decimal::ONE) * HUNDRED;
    let fees = Decimal::from(3) * params.fee_rate * HUNDRED;
    let realistic = (crossing - Decimal::ONE) * HUNDRED - fees - slippage;
    let is_executable = realistic > Decimal::ZERO
        && slippage <= params.max_slippage_pct
        && realistic >= params.min_profit_threshold_pct;

    Some(TriangularOpportunity {
        id: Uuid::new_v4(),
        exchange,
        path: route.path.clone(),
        legs: route.legs.clone(),
        prices,
        theoretical_profit_pct: theoretical.round_dp(6),
        realistic_profit_pct: realistic.round_dp(6),
        profit_amount: (params.reference_size * realistic / HUNDRED).round_dp(8),
        reference_size: params.reference_size,
        estimated_slippage_pct: slippage.round_dp(6),
        is_executable,
        detected_at: now,
    })
}
