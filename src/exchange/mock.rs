//! Paper-trading gateway: an in-memory simulated exchange.
//!
//! Market orders fill immediately at the quoted side of the book. Orders
//! carrying a `position_side` open or reduce derivatives positions; orders
//! without one are spot trades. Faults can be injected for tests.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::traits::{split_symbol, ExchangeGateway, PriceStream, Venue};
use super::types::*;
use crate::error::GatewayError;

/// Maintenance margin rate used for simulated liquidation prices.
const MAINTENANCE_MARGIN_RATE: Decimal = dec!(0.005);

/// Simulated derivatives position.
#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub symbol: String,
    pub side: PositionSide,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
    pub accumulated_funding: Decimal,
}

/// One order as the paper exchange received it.
#[derive(Debug, Clone)]
pub struct PaperOrderRecord {
    pub request: OrderRequest,
    pub submitted_at: Instant,
    pub result: Result<OrderFill, GatewayError>,
}

struct Subscriber {
    token: CancellationToken,
    tx: mpsc::UnboundedSender<PairPrice>,
}

#[derive(Default)]
struct PaperState {
    prices: HashMap<String, PairPrice>,
    rules: HashMap<String, InstrumentRules>,
    leverage: HashMap<String, u32>,
    positions: HashMap<(String, PositionSide), PaperPosition>,
    subscribers: HashMap<String, Vec<Subscriber>>,
    orders: Vec<PaperOrderRecord>,
    order_faults: VecDeque<GatewayError>,
    symbol_faults: HashMap<String, GatewayError>,
    position_faults: VecDeque<GatewayError>,
}

/// Paper exchange that implements [`ExchangeGateway`].
pub struct PaperGateway {
    venue: Venue,
    state: Arc<RwLock<PaperState>>,
    order_id_counter: AtomicU64,
    /// Taker fee rate (0.1% default)
    fee_rate: Decimal,
    /// Artificial latency applied to every order
    order_latency: RwLock<Duration>,
    /// Artificial latency applied to every quote request
    quote_latency: RwLock<Duration>,
}

impl PaperGateway {
    pub fn new(venue: Venue) -> Self {
        Self {
            venue,
            state: Arc::new(RwLock::new(PaperState::default())),
            order_id_counter: AtomicU64::new(1),
            fee_rate: dec!(0.001),
            order_latency: RwLock::new(Duration::ZERO),
            quote_latency: RwLock::new(Duration::ZERO),
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// List a symbol with its trading rules.
    pub async fn list_symbol(&self, symbol: &str, rules: InstrumentRules) {
        self.state.write().await.rules.insert(symbol.to_string(), rules);
    }

    /// Update the book for a symbol and push the tick to its subscribers.
    pub async fn set_price(&self, symbol: &str, bid: Decimal, ask: Decimal, last: Decimal) {
        let price = PairPrice {
            symbol: symbol.to_string(),
            bid,
            ask,
            last,
            timestamp: Utc::now(),
        };

        let mut state = self.state.write().await;
        state.prices.insert(symbol.to_string(), price.clone());
        if let Some(subs) = state.subscribers.get_mut(symbol) {
            subs.retain(|sub| !sub.token.is_cancelled() && sub.tx.send(price.clone()).is_ok());
        }
    }

    /// Convenience: a flat book where bid = ask = last.
    pub async fn set_flat_price(&self, symbol: &str, price: Decimal) {
        self.set_price(symbol, price, price, price).await;
    }

    /// The next `place_order` calls fail with these errors, in order.
    pub async fn inject_order_faults(&self, faults: impl IntoIterator<Item = GatewayError>) {
        self.state.write().await.order_faults.extend(faults);
    }

    /// Every order on `symbol` fails with `fault` until cleared.
    pub async fn inject_symbol_fault(&self, symbol: &str, fault: GatewayError) {
        self.state.write().await.symbol_faults.insert(symbol.to_string(), fault);
    }

    /// The next `get_positions` calls fail with these errors, in order.
    pub async fn inject_position_faults(&self, faults: impl IntoIterator<Item = GatewayError>) {
        self.state.write().await.position_faults.extend(faults);
    }

    pub async fn set_order_latency(&self, latency: Duration) {
        *self.order_latency.write().await = latency;
    }

    pub async fn set_quote_latency(&self, latency: Duration) {
        *self.quote_latency.write().await = latency;
    }

    /// Simulate a dropped market data connection: every stream ends.
    pub async fn disconnect_streams(&self) {
        let dropped: usize = {
            let mut state = self.state.write().await;
            state.subscribers.drain().map(|(_, subs)| subs.len()).sum()
        };
        info!(venue = %self.venue, streams = dropped, "Paper market data disconnected");
    }

    /// Simulate an exchange-side liquidation: the position disappears.
    pub async fn force_liquidate(&self, symbol: &str, side: PositionSide) -> bool {
        let removed = self
            .state
            .write()
            .await
            .positions
            .remove(&(symbol.to_string(), side))
            .is_some();
        if removed {
            info!(venue = %self.venue, %symbol, %side, "Paper position liquidated");
        }
        removed
    }

    /// Credit a funding payment to an open position.
    pub async fn apply_funding(&self, symbol: &str, rate: Decimal) {
        let mut state = self.state.write().await;
        let mark = state.prices.get(symbol).map(|p| p.mid()).unwrap_or_default();
        for ((sym, side), position) in state.positions.iter_mut() {
            if sym == symbol {
                // Longs pay positive funding, shorts receive it
                position.accumulated_funding -= side.sign() * position.size * mark * rate;
            }
        }
    }

    pub async fn orders(&self) -> Vec<PaperOrderRecord> {
        self.state.read().await.orders.clone()
    }

    pub async fn subscriber_count(&self, symbol: &str) -> usize {
        let mut state = self.state.write().await;
        match state.subscribers.get_mut(symbol) {
            Some(subs) => {
                subs.retain(|s| !s.token.is_cancelled());
                subs.len()
            }
            None => 0,
        }
    }

    fn next_order_id(&self) -> String {
        format!(
            "{}-{}",
            self.venue.short_code(),
            self.order_id_counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    fn liquidation_price(side: PositionSide, entry: Decimal, leverage: u32) -> Decimal {
        let leverage = Decimal::from(leverage.max(1));
        match side {
            PositionSide::Long => entry * (Decimal::ONE - Decimal::ONE / leverage + MAINTENANCE_MARGIN_RATE),
            PositionSide::Short => entry * (Decimal::ONE + Decimal::ONE / leverage - MAINTENANCE_MARGIN_RATE),
        }
    }

    fn fill(&self, state: &mut PaperState, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
        if let Some(fault) = state.order_faults.pop_front() {
            return Err(fault);
        }
        if let Some(fault) = state.symbol_faults.get(&order.symbol) {
            return Err(fault.clone());
        }
        let rules = state
            .rules
            .get(&order.symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(order.symbol.clone()))?;
        if order.quantity <= Decimal::ZERO || order.quantity < rules.min_qty {
            return Err(GatewayError::Rejected {
                code: Some("QTY_TOO_SMALL".into()),
                message: format!("quantity {} below minimum {}", order.quantity, rules.min_qty),
            });
        }
        if order.quantity > rules.max_qty {
            return Err(GatewayError::Rejected {
                code: Some("QTY_TOO_LARGE".into()),
                message: format!("quantity {} above maximum {}", order.quantity, rules.max_qty),
            });
        }
        let quote = state
            .prices
            .get(&order.symbol)
            .cloned()
            .ok_or_else(|| GatewayError::Transient(format!("no market data for {}", order.symbol)))?;

        let price = match (order.side, quote.is_quoted()) {
            (OrderSide::Buy, true) => quote.ask,
            (OrderSide::Sell, true) => quote.bid,
            _ => quote.last,
        };
        if price <= Decimal::ZERO {
            return Err(GatewayError::Rejected {
                code: None,
                message: format!("no liquidity for {}", order.symbol),
            });
        }

        let (base, quote_asset) = split_symbol(&order.symbol)
            .unwrap_or_else(|| (order.symbol.clone(), "USDT".to_string()));

        let mut quantity = order.quantity;
        let (fee, fee_asset) = match order.position_side {
            Some(position_side) => {
                let leverage = state.leverage.get(&order.symbol).copied().unwrap_or(1);
                let key = (order.symbol.clone(), position_side);
                let opening = order.side == position_side.entry_order_side();
                if opening {
                    let position = state.positions.entry(key).or_insert_with(|| PaperPosition {
                        symbol: order.symbol.clone(),
                        side: position_side,
                        size: Decimal::ZERO,
                        entry_price: price,
                        leverage,
                        accumulated_funding: Decimal::ZERO,
                    });
                    let new_size = position.size + quantity;
                    position.entry_price =
                        (position.entry_price * position.size + price * quantity) / new_size;
                    position.size = new_size;
                    position.leverage = leverage;
                } else {
                    let Some(position) = state.positions.get_mut(&key) else {
                        return Err(GatewayError::Rejected {
                            code: Some("NO_POSITION".into()),
                            message: format!("no {position_side} position on {}", order.symbol),
                        });
                    };
                    quantity = quantity.min(position.size);
                    position.size -= quantity;
                    if position.size.is_zero() {
                        state.positions.remove(&key);
                    }
                }
                (quantity * price * self.fee_rate, quote_asset.clone())
            }
            // Spot: fee is taken from what the trade delivers
            None => match order.side {
                OrderSide::Buy => (quantity * self.fee_rate, base.clone()),
                OrderSide::Sell => (quantity * price * self.fee_rate, quote_asset.clone()),
            },
        };

        Ok(OrderFill {
            order_id: self.next_order_id(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            filled_qty: quantity,
            avg_price: price,
            fee,
            fee_asset,
            timestamp: Utc::now(),
        })
    }
}

#[async_trait]
impl ExchangeGateway for PaperGateway {
    fn venue(&self) -> Venue {
        self.venue
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderFill, GatewayError> {
        let submitted_at = Instant::now();
        let latency = *self.order_latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write().await;
        let result = self.fill(&mut state, order);
        state.orders.push(PaperOrderRecord {
            request: order.clone(),
            submitted_at,
            result: result.clone(),
        });

        match &result {
            Ok(fill) => debug!(
                venue = %self.venue,
                order_id = %fill.order_id,
                symbol = %self.venue.format_symbol(&fill.symbol),
                side = %fill.side,
                quantity = %fill.filled_qty,
                price = %fill.avg_price,
                fee = %fill.fee,
                "Paper order filled"
            ),
            Err(e) => debug!(venue = %self.venue, symbol = %order.symbol, error = %e, "Paper order failed"),
        }
        result
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> Result<(), GatewayError> {
        // Market orders fill on arrival; nothing is ever resting
        Err(GatewayError::Rejected {
            code: Some("ORDER_NOT_FOUND".into()),
            message: format!("order {order_id} is not open"),
        })
    }

    async fn close_position(
        &self,
        symbol: &str,
        side: PositionSide,
    ) -> Result<Option<OrderFill>, GatewayError> {
        let size = {
            let state = self.state.read().await;
            state
                .positions
                .get(&(symbol.to_string(), side))
                .map(|p| p.size)
                .unwrap_or_default()
        };
        if size.is_zero() {
            return Ok(None);
        }
        let mut order = OrderRequest::market(symbol, side.entry_order_side().opposite(), size)
            .with_position_side(side);
        order.reduce_only = true;
        self.place_order(&order).await.map(Some)
    }

    async fn get_positions(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExchangePosition>, GatewayError> {
        let mut state = self.state.write().await;
        if let Some(fault) = state.position_faults.pop_front() {
            return Err(fault);
        }
        Ok(state
            .positions
            .values()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .map(|p| {
                let mark = state
                    .prices
                    .get(&p.symbol)
                    .map(|q| q.mid())
                    .unwrap_or(p.entry_price);
                ExchangePosition {
                    symbol: p.symbol.clone(),
                    side: p.side,
                    size: p.size,
                    entry_price: p.entry_price,
                    mark_price: mark,
                    liquidation_price: Self::liquidation_price(p.side, p.entry_price, p.leverage),
                    unrealized_pnl: p.side.sign() * (mark - p.entry_price) * p.size,
                    accumulated_funding: p.accumulated_funding,
                    leverage: p.leverage,
                }
            })
            .collect())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        if !state.rules.contains_key(symbol) {
            return Err(GatewayError::UnknownSymbol(symbol.to_string()));
        }
        if state.leverage.get(symbol) == Some(&leverage) {
            return Err(GatewayError::Rejected {
                code: Some("110043".into()),
                message: "leverage not modified".into(),
            });
        }
        state.leverage.insert(symbol.to_string(), leverage);
        Ok(())
    }

    async fn get_market_price(&self, symbol: &str) -> Result<PairPrice, GatewayError> {
        let latency = *self.quote_latency.read().await;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.state
            .read()
            .await
            .prices
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    async fn subscribe_price_stream(&self, symbol: &str) -> Result<PriceStream, GatewayError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        self.state
            .write()
            .await
            .subscribers
            .entry(symbol.to_string())
            .or_default()
            .push(Subscriber {
                token: token.clone(),
                tx,
            });
        Ok(PriceStream::new(symbol, rx, token))
    }

    async fn get_instrument_rules(&self, symbol: &str) -> Result<InstrumentRules, GatewayError> {
        self.state
            .read()
            .await
            .rules
            .get(symbol)
            .copied()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(step: Decimal) -> InstrumentRules {
        InstrumentRules {
            min_qty: step,
            max_qty: dec!(1000),
            qty_step: step,
            price_precision: 2,
            qty_precision: step.scale(),
        }
    }

    async fn gateway() -> PaperGateway {
        let gw = PaperGateway::new(Venue::Bybit);
        gw.list_symbol("BTC/USDT", rules(dec!(0.001))).await;
        gw.set_price("BTC/USDT", dec!(49990), dec!(50010), dec!(50000)).await;
        gw
    }

    #[tokio::test]
    async fn test_derivative_order_opens_position() {
        let gw = gateway().await;
        let order = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(0.5))
            .with_position_side(PositionSide::Long);
        let fill = gw.place_order(&order).await.unwrap();

        assert_eq!(fill.avg_price, dec!(50010));
        assert_eq!(fill.fee_asset, "USDT");

        let positions = gw.get_positions(Some("BTC/USDT")).await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].size, dec!(0.5));
        assert_eq!(positions[0].side, PositionSide::Long);
    }

    #[tokio::test]
    async fn test_close_position_flattens() {
        let gw = gateway().await;
        let order = OrderRequest::market("BTC/USDT", OrderSide::Sell, dec!(0.2))
            .with_position_side(PositionSide::Short);
        gw.place_order(&order).await.unwrap();

        let fill = gw.close_position("BTC/USDT", PositionSide::Short).await.unwrap();
        assert_eq!(fill.map(|f| f.filled_qty), Some(dec!(0.2)));
        assert!(gw.get_positions(None).await.unwrap().is_empty());

        // Nothing left to close
        assert!(gw.close_position("BTC/USDT", PositionSide::Short).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spot_buy_charges_fee_in_base() {
        let gw = gateway().await;
        let fill = gw
            .place_order(&OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(1)))
            .await
            .unwrap();
        assert_eq!(fill.fee_asset, "BTC");
        assert_eq!(fill.fee, dec!(0.001));
        assert!(gw.get_positions(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_fault_is_returned_once() {
        let gw = gateway().await;
        gw.inject_order_faults([GatewayError::Transient("boom".into())]).await;
        let order = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(0.1));

        assert!(gw.place_order(&order).await.is_err());
        assert!(gw.place_order(&order).await.is_ok());
        assert_eq!(gw.orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_set_same_leverage_is_not_modified() {
        let gw = gateway().await;
        gw.set_leverage("BTC/USDT", 5).await.unwrap();
        let err = gw.set_leverage("BTC/USDT", 5).await.unwrap_err();
        assert!(err.is_leverage_not_modified());
    }

    #[tokio::test]
    async fn test_unsubscribe_only_drops_one_stream() {
        let gw = gateway().await;
        let first = gw.subscribe_price_stream("BTC/USDT").await.unwrap();
        let mut second = gw.subscribe_price_stream("BTC/USDT").await.unwrap();

        first.unsubscribe();
        gw.set_flat_price("BTC/USDT", dec!(51000)).await;

        assert_eq!(gw.subscriber_count("BTC/USDT").await, 1);
        let tick = second.recv().await.unwrap();
        assert_eq!(tick.last, dec!(51000));
    }

    #[tokio::test]
    async fn test_disconnect_ends_every_stream() {
        let gw = gateway().await;
        let mut stream = gw.subscribe_price_stream("BTC/USDT").await.unwrap();

        gw.disconnect_streams().await;
        gw.set_flat_price("BTC/USDT", dec!(51000)).await;

        assert!(stream.recv().await.is_none());
        assert_eq!(gw.subscriber_count("BTC/USDT").await, 0);
    }

    #[tokio::test]
    async fn test_force_liquidate_removes_position() {
        let gw = gateway().await;
        let order = OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(0.1))
            .with_position_side(PositionSide::Long);
        gw.place_order(&order).await.unwrap();

        assert!(gw.force_liquidate("BTC/USDT", PositionSide::Long).await);
        assert!(gw.get_positions(Some("BTC/USDT")).await.unwrap().is_empty());
    }
}
