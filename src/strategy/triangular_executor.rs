//! Triangular execution engine.
//!
//! Executes the three legs of an accepted opportunity strictly in order.
//! Each leg trades exactly what the previous leg delivered. A failed leg
//! stops the cycle and the asset held at that point is recorded on the
//! position instead of being converted back.

use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::normalizer::QuantityNormalizer;
use super::opportunity_book::OpportunityBook;
use crate::config::TriangularConfig;
use crate::error::{ArbError, GatewayError, Result};
use crate::events::EventBroadcaster;
use crate::exchange::{
    call_with_retry, ExchangeGateway, GatewayRegistry, OrderFill, OrderRequest, OrderSide,
    RetryPolicy,
};
use crate::persistence::PositionStore;
use crate::position::{LegExecutionStatus, TriangularPosition, TriangularStatus};
use crate::utils::decimal::{round_down_to_lot, safe_div};

/// Request to execute a detected opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteOpportunityRequest {
    pub opportunity_id: Uuid,
    /// Amount of start asset to commit; the configured default when absent
    #[serde(default)]
    pub position_size: Option<Decimal>,
}

#[derive(Clone)]
pub struct TriangularExecutor {
    registry: GatewayRegistry,
    normalizer: Arc<QuantityNormalizer>,
    store: Arc<dyn PositionStore>,
    events: EventBroadcaster,
    book: Arc<OpportunityBook>,
    config: TriangularConfig,
    policy: RetryPolicy,
    running: Arc<DashMap<Uuid, CancellationToken>>,
}

impl TriangularExecutor {
    pub fn new(
        registry: GatewayRegistry,
        normalizer: Arc<QuantityNormalizer>,
        store: Arc<dyn PositionStore>,
        events: EventBroadcaster,
        book: Arc<OpportunityBook>,
        config: TriangularConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            normalizer,
            store,
            events,
            book,
            config,
            policy,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Re-validate the opportunity and run all three legs.
    ///
    /// Refusals (unknown, stale or non-executable opportunity) are returned
    /// as errors before anything is traded. Once accepted, the outcome is
    /// carried by the returned position: a failed leg yields `Ok` with
    /// status `failed`.
    #[instrument(skip_all, fields(opportunity_id = %request.opportunity_id))]
    pub async fn execute(&self, request: ExecuteOpportunityRequest) -> Result<TriangularPosition> {
        let id = request.opportunity_id;
        let opportunity = self
            .book
            .get(id)
            .ok_or_else(|| ArbError::NotFound(format!("opportunity {id}")))?;

        let size = request
            .position_size
            .unwrap_or(self.config.default_position_size);
        if size <= Decimal::ZERO {
            return Err(ArbError::Validation(format!(
                "position size must be positive, got {size}"
            )));
        }
        let age_ms = opportunity.age_ms(Utc::now());
        if age_ms > self.config.opportunity_ttl_ms as i64 {
            return Err(ArbError::StaleOpportunity {
                id: id.to_string(),
                age_ms,
                ttl_ms: self.config.opportunity_ttl_ms,
            });
        }
        if !opportunity.is_executable {
            return Err(ArbError::Validation(format!(
                "opportunity {id} is not executable (realistic profit {}%, slippage {}%)",
                opportunity.realistic_profit_pct, opportunity.estimated_slippage_pct
            )));
        }
        let gateway = self.registry.get(opportunity.exchange).ok_or_else(|| {
            ArbError::Validation(format!("no gateway configured for {}", opportunity.exchange))
        })?;

        // Claim it; a concurrent request for the same id loses here
        let opportunity = self
            .book
            .take(id)
            .ok_or_else(|| ArbError::NotFound(format!("opportunity {id}")))?;

        let mut position = TriangularPosition::from_opportunity(&opportunity, size);
        self.store.create_triangular(&position).await?;
        let token = CancellationToken::new();
        self.running.insert(position.id, token.clone());
        info!(
            position_id = %position.id,
            exchange = %position.exchange,
            path = %position.path,
            size = %size,
            expected_profit_pct = %position.expected_profit_pct,
            "Triangular position accepted"
        );
        self.events.triangular_position(&position);

        position.status = TriangularStatus::Executing;
        position.updated_at = Utc::now();
        self.save(&position).await;

        self.run_legs(&mut position, gateway.as_ref(), &token).await;
        self.running.remove(&position.id);
        Ok(position)
    }

    /// Stop an execution before its next leg.
    ///
    /// A leg already at the exchange is allowed to finish; what it delivered
    /// is recorded as held.
    pub async fn cancel(&self, position_id: Uuid) -> Result<TriangularPosition> {
        if let Some(token) = self.running.get(&position_id).map(|t| t.clone()) {
            token.cancel();
            info!(%position_id, "Triangular cancellation requested");
            return self.load(position_id).await;
        }

        let mut position = self.load(position_id).await?;
        if position.status.is_terminal() {
            return Err(ArbError::InvalidTransition {
                from: position.status.to_string(),
                to: TriangularStatus::Cancelled.to_string(),
            });
        }
        // Not driven by this process any more
        position.cancel_remaining();
        self.save(&position).await;
        Ok(position)
    }

    /// Remove a finished position from the store.
    pub async fn delete(&self, position_id: Uuid) -> Result<()> {
        if self.running.contains_key(&position_id) {
            return Err(ArbError::Busy(format!(
                "triangular position {position_id} is executing"
            )));
        }
        let position = self.load(position_id).await?;
        if !position.status.is_terminal() {
            return Err(ArbError::InvalidTransition {
                from: position.status.to_string(),
                to: "deleted".to_string(),
            });
        }
        self.store.delete_triangular(position_id).await?;
        info!(%position_id, "Triangular position deleted");
        Ok(())
    }

    pub fn is_executing(&self, position_id: Uuid) -> bool {
        self.running.contains_key(&position_id)
    }

    async fn load(&self, position_id: Uuid) -> Result<TriangularPosition> {
        self.store
            .get_triangular(position_id)
            .await?
            .ok_or_else(|| ArbError::NotFound(format!("triangular position {position_id}")))
    }

    async fn run_legs(
        &self,
        position: &mut TriangularPosition,
        gateway: &dyn ExchangeGateway,
        token: &CancellationToken,
    ) {
        let mut amount = position.initial_amount;
        for number in 1..=3u8 {
            if token.is_cancelled() {
                position.cancel_remaining();
                info!(
                    position_id = %position.id,
                    next_leg = number,
                    held = ?position.stranded_asset,
                    "Triangular execution cancelled"
                );
                self.save(position).await;
                return;
            }

            match self.run_leg(position, gateway, number, amount).await {
                Ok(output) => amount = output,
                Err(err) => {
                    let err = if number > 1 {
                        ArbError::PartialExecution(format!("leg {number}: {err}"))
                    } else {
                        err
                    };
                    position.fail_leg(number, err.to_string());
                    error!(
                        position_id = %position.id,
                        leg = number,
                        held = ?position.stranded_asset,
                        error = %err,
                        "Triangular leg failed"
                    );
                    self.save(position).await;
                    self.events.error(&err, Some(position.id.to_string()));
                    return;
                }
            }
            self.save(position).await;
        }

        let now = Utc::now();
        position.final_amount = amount;
        position.actual_profit = amount - position.initial_amount;
        position.actual_profit_pct =
            (safe_div(position.actual_profit, position.initial_amount) * Decimal::ONE_HUNDRED)
                .round_dp(6);
        position.status = TriangularStatus::Completed;
        position.updated_at = now;
        position.completed_at = Some(now);
        info!(
            position_id = %position.id,
            initial = %position.initial_amount,
            final_amount = %position.final_amount,
            expected_pct = %position.expected_profit_pct,
            actual_pct = %position.actual_profit_pct,
            "Triangular position completed"
        );
        self.save(position).await;
    }

    /// Execute one leg with `amount` of its source asset. Returns the net
    /// amount of the target asset received.
    async fn run_leg(
        &self,
        position: &mut TriangularPosition,
        gateway: &dyn ExchangeGateway,
        number: u8,
        amount: Decimal,
    ) -> Result<Decimal> {
        let exchange = position.exchange;
        let position_id = position.id;
        let leg = position.begin_leg(number)?;
        leg.input_amount = amount;
        let symbol = leg.symbol.clone();
        let side = leg.side;

        let rules = self.normalizer.normalize(exchange, &symbol).await?;
        let quantity = match side {
            OrderSide::Buy => {
                // Size against the book now, not at detection, so the order
                // never spends more than the previous leg delivered
                let quote = call_with_retry(&self.policy, "get_market_price", || {
                    gateway.get_market_price(&symbol)
                })
                .await
                .map_err(|e| ArbError::exchange(exchange, "get_market_price", e))?;
                let ask = if quote.is_quoted() { quote.ask } else { quote.last };
                if ask <= Decimal::ZERO {
                    return Err(ArbError::Validation(format!("no ask quoted for {symbol}")));
                }
                round_down_to_lot(amount / ask, rules.qty_step)
            }
            OrderSide::Sell => round_down_to_lot(amount, rules.qty_step),
        };
        let leg = &mut position.legs[number as usize - 1];
        leg.target_quantity = quantity;
        if quantity <= Decimal::ZERO || quantity < rules.min_qty {
            return Err(ArbError::Validation(format!(
                "{amount} {} converts to {quantity} {symbol}, below minimum {}",
                leg.from_asset, rules.min_qty
            )));
        }

        let short_id = position_id.simple().to_string();
        let order = OrderRequest::market(symbol.clone(), side, quantity)
            .with_client_order_id(format!("tri-{}-{number}", &short_id[..12]));
        debug!(%position_id, leg = number, %symbol, %side, %quantity, "Placing leg order");

        let fill = call_with_retry(&self.policy, "place_order", || gateway.place_order(&order))
            .await
            .map_err(|e| {
                if matches!(e, GatewayError::Rejected { .. } | GatewayError::UnknownSymbol(_)) {
                    // Rules may have changed under us; refetch next time
                    self.normalizer.invalidate(exchange, &symbol);
                }
                ArbError::exchange(exchange, "place_order", e)
            })?;
        if fill.filled_qty <= Decimal::ZERO {
            return Err(ArbError::exchange(
                exchange,
                "place_order",
                GatewayError::Rejected {
                    code: None,
                    message: format!("order {} was not filled ({:?})", fill.order_id, fill.status),
                },
            ));
        }

        if side == OrderSide::Buy && fill.filled_qty * fill.avg_price > amount {
            warn!(
                %position_id,
                leg = number,
                spent = %(fill.filled_qty * fill.avg_price),
                held = %amount,
                "Leg spent more than the previous leg delivered"
            );
        }

        let leg = &mut position.legs[number as usize - 1];
        let output = net_output(&fill, side, &leg.to_asset);
        let now = Utc::now();
        leg.filled_quantity = fill.filled_qty;
        leg.actual_price = fill.avg_price;
        leg.slippage = safe_div(fill.avg_price - leg.estimated_price, leg.estimated_price).round_dp(8);
        leg.fee = fill.fee;
        leg.fee_asset = Some(fill.fee_asset.clone());
        leg.order_id = Some(fill.order_id.clone());
        leg.output_amount = output;
        leg.status = LegExecutionStatus::Completed;
        leg.completed_at = Some(now);
        leg.execution_time_ms = leg.started_at.map(|s| (now - s).num_milliseconds());
        if leg.slippage.abs() * Decimal::ONE_HUNDRED > self.config.max_slippage_pct {
            warn!(
                %position_id,
                leg = number,
                estimated = %leg.estimated_price,
                actual = %leg.actual_price,
                "Leg filled beyond slippage tolerance"
            );
        }
        info!(
            %position_id,
            leg = number,
            %symbol,
            filled = %fill.filled_qty,
            price = %fill.avg_price,
            output = %output,
            to_asset = %leg.to_asset,
            "Leg completed"
        );
        position.updated_at = now;
        Ok(output)
    }

    async fn save(&self, position: &TriangularPosition) {
        if let Err(e) = self.store.update_triangular(position).await {
            error!(position_id = %position.id, error = %e, "Failed to persist triangular position");
        }
        self.events.triangular_position(position);
    }
}

/// Amount of the target asset a fill delivers after fees charged in it.
fn net_output(fill: &OrderFill, side: OrderSide, to_asset: &str) -> Decimal {
    let gross = match side {
        OrderSide::Buy => fill.filled_qty,
        OrderSide::Sell => fill.filled_qty * fill.avg_price,
    };
    if fill.fee_asset == to_asset {
        gross - fill.fee
    } else {
        gross
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::events::{EventData, EventKind};
    use crate::exchange::{InstrumentRules, PaperGateway, Venue};
    use crate::persistence::{MemoryPositionStore, TriangularFilter};
    use crate::position::TriangularOpportunity;
    use crate::strategy::triangle::{evaluate, PriceGraph, TriangleParams};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct Harness {
        gateway: Arc<PaperGateway>,
        store: Arc<MemoryPositionStore>,
        events: EventBroadcaster,
        book: Arc<OpportunityBook>,
        executor: TriangularExecutor,
    }

    fn rules(step: Decimal) -> InstrumentRules {
        InstrumentRules {
            min_qty: step,
            max_qty: dec!(10000),
            qty_step: step,
            price_precision: 8,
            qty_precision: step.scale(),
        }
    }

    async fn harness() -> Harness {
        let gateway = Arc::new(PaperGateway::new(Venue::Binance));
        gateway.list_symbol("BTC/USDT", rules(dec!(0.00001))).await;
        gateway.list_symbol("ETH/BTC", rules(dec!(0.0001))).await;
        gateway.list_symbol("ETH/USDT", rules(dec!(0.0001))).await;
        gateway.set_flat_price("BTC/USDT", dec!(50000)).await;
        gateway.set_flat_price("ETH/BTC", dec!(0.05)).await;
        gateway.set_flat_price("ETH/USDT", dec!(2550)).await;

        let policy = RetryPolicy::from_config(&GatewayConfig {
            timeout_ms: 1_000,
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
        });
        let registry = GatewayRegistry::new().with(gateway.clone());
        let store = Arc::new(MemoryPositionStore::new());
        let events = EventBroadcaster::new(256);
        let book = Arc::new(OpportunityBook::new());
        let executor = TriangularExecutor::new(
            registry.clone(),
            Arc::new(QuantityNormalizer::new(registry, policy)),
            store.clone(),
            events.clone(),
            book.clone(),
            TriangularConfig::default(),
            policy,
        );
        Harness {
            gateway,
            store,
            events,
            book,
            executor,
        }
    }

    /// USDT -> BTC -> ETH -> USDT at the harness prices, detected at `at`.
    fn detect(at: chrono::DateTime<Utc>) -> TriangularOpportunity {
        let mut graph = PriceGraph::new();
        for (symbol, price) in [
            ("BTC/USDT", dec!(50000)),
            ("ETH/BTC", dec!(0.05)),
            ("ETH/USDT", dec!(2550)),
        ] {
            graph.update(crate::exchange::PairPrice {
                symbol: symbol.into(),
                bid: price,
                ask: price,
                last: price,
                timestamp: at,
            });
        }
        let route = graph
            .routes_from("USDT")
            .into_iter()
            .find(|r| r.path.asset_b == "BTC" && r.legs[0].symbol == "BTC/USDT")
            .unwrap();
        let params = TriangleParams::from(&TriangularConfig::default());
        evaluate(Venue::Binance, &route, &graph, &params, at).unwrap()
    }

    fn request(opportunity: &TriangularOpportunity) -> ExecuteOpportunityRequest {
        ExecuteOpportunityRequest {
            opportunity_id: opportunity.id,
            position_size: Some(dec!(100)),
        }
    }

    #[tokio::test]
    async fn test_each_leg_trades_the_previous_output() {
        let h = harness().await;
        let opp = detect(Utc::now());
        assert!(opp.is_executable);
        h.book.record(opp.clone());

        let position = h.executor.execute(request(&opp)).await.unwrap();

        assert_eq!(position.status, TriangularStatus::Completed);
        let [l1, l2, l3] = &position.legs;
        // 100 USDT at 50000, 0.1% fee taken in BTC
        assert_eq!(l1.target_quantity, dec!(0.002));
        assert_eq!(l1.output_amount, dec!(0.001998));
        // 0.001998 / 0.05 = 0.03996, rounded down to the 0.0001 step
        assert_eq!(l2.input_amount, dec!(0.001998));
        assert_eq!(l2.target_quantity, dec!(0.0399));
        assert_eq!(l2.output_amount, dec!(0.0398601));
        assert_eq!(l3.target_quantity, dec!(0.0398));
        assert_eq!(l3.to_asset, "USDT");
        assert!(position.legs.iter().all(|l| l.status == LegExecutionStatus::Completed));
        assert!(position.legs.iter().all(|l| l.slippage.is_zero()));

        // 0.0398 * 2550 = 101.49, less 0.1% fee
        assert_eq!(position.final_amount, dec!(101.38851));
        assert_eq!(position.actual_profit, dec!(1.38851));
        assert_eq!(position.actual_profit_pct, dec!(1.38851));
        assert!(position.stranded_asset.is_none());
        assert_eq!(h.gateway.orders().await.len(), 3);
        assert!(!h.executor.is_executing(position.id));

        let stored = h.store.get_triangular(position.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TriangularStatus::Completed);
    }

    #[tokio::test]
    async fn test_buy_leg_is_sized_at_the_current_ask() {
        let h = harness().await;
        let opp = detect(Utc::now());
        h.book.record(opp.clone());
        // ETH/BTC moves up between detection and execution
        h.gateway.set_flat_price("ETH/BTC", dec!(0.051)).await;

        let position = h.executor.execute(request(&opp)).await.unwrap();

        assert_eq!(position.status, TriangularStatus::Completed);
        let l2 = &position.legs[1];
        assert_eq!(l2.input_amount, dec!(0.001998));
        // 0.001998 / 0.051 = 0.039176..., rounded down to the 0.0001 step
        assert_eq!(l2.target_quantity, dec!(0.0391));
        assert!(l2.filled_quantity * l2.actual_price <= l2.input_amount);
        assert_eq!(l2.estimated_price, dec!(0.05));
        assert_eq!(l2.slippage, dec!(0.02));
        assert_eq!(position.legs[2].input_amount, l2.output_amount);
    }

    #[tokio::test]
    async fn test_stale_opportunity_is_refused() {
        let h = harness().await;
        let opp = detect(Utc::now() - ChronoDuration::seconds(30));
        h.book.record(opp.clone());

        let err = h.executor.execute(request(&opp)).await.unwrap_err();
        assert!(matches!(err, ArbError::StaleOpportunity { .. }));
        assert!(h.gateway.orders().await.is_empty());
        // Still in the book; it is only claimed on acceptance
        assert!(h.book.get(opp.id).is_some());
    }

    #[tokio::test]
    async fn test_failed_second_leg_leaves_intermediate_asset() {
        let h = harness().await;
        h.gateway
            .inject_symbol_fault(
                "ETH/BTC",
                GatewayError::Rejected {
                    code: Some("MARKET_CLOSED".into()),
                    message: "trading halted".into(),
                },
            )
            .await;
        let opp = detect(Utc::now());
        h.book.record(opp.clone());
        let mut events = h.events.subscribe();

        let position = h.executor.execute(request(&opp)).await.unwrap();

        assert_eq!(position.status, TriangularStatus::Failed);
        assert_eq!(position.error_leg, Some(2));
        assert_eq!(position.legs[0].status, LegExecutionStatus::Completed);
        assert_eq!(position.legs[1].status, LegExecutionStatus::Failed);
        assert_eq!(position.legs[2].status, LegExecutionStatus::Skipped);
        assert_eq!(position.stranded_asset, Some(("BTC".to_string(), dec!(0.001998))));
        assert!(position.legs_are_sequential());
        // Leg 3 was never attempted
        let orders = h.gateway.orders().await;
        assert!(orders.iter().all(|o| o.request.symbol != "ETH/USDT"));

        let mut saw_error = false;
        while let Some(event) = events.try_recv() {
            if let EventData::Error(report) = &event.data {
                assert_eq!(event.kind, EventKind::Error);
                assert_eq!(report.entity_id.as_deref(), Some(position.id.to_string().as_str()));
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_opportunity_executes_at_most_once() {
        let h = harness().await;
        let opp = detect(Utc::now());
        h.book.record(opp.clone());

        h.executor.execute(request(&opp)).await.unwrap();
        let err = h.executor.execute(request(&opp)).await.unwrap_err();
        assert!(matches!(err, ArbError::NotFound(_)));
        assert_eq!(h.gateway.orders().await.len(), 3);
    }

    #[tokio::test]
    async fn test_non_executable_or_unknown_is_refused() {
        let h = harness().await;
        let mut opp = detect(Utc::now());
        opp.is_executable = false;
        h.book.record(opp.clone());
        assert!(matches!(
            h.executor.execute(request(&opp)).await,
            Err(ArbError::Validation(_))
        ));

        let unknown = ExecuteOpportunityRequest {
            opportunity_id: Uuid::new_v4(),
            position_size: None,
        };
        assert!(matches!(
            h.executor.execute(unknown).await,
            Err(ArbError::NotFound(_))
        ));
        assert!(h.gateway.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_between_legs() {
        let h = harness().await;
        h.gateway.set_order_latency(Duration::from_millis(200)).await;
        let opp = detect(Utc::now());
        h.book.record(opp.clone());

        let executor = h.executor.clone();
        let task = tokio::spawn(async move { executor.execute(request(&opp)).await });
        tokio::time::sleep(Duration::from_millis(80)).await;

        let running = h
            .store
            .find_triangular(&TriangularFilter::default())
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        h.executor.cancel(running[0].id).await.unwrap();

        let position = task.await.unwrap().unwrap();
        assert_eq!(position.status, TriangularStatus::Cancelled);
        assert_eq!(position.legs[0].status, LegExecutionStatus::Completed);
        assert_eq!(position.legs[1].status, LegExecutionStatus::Skipped);
        assert_eq!(position.stranded_asset, Some(("BTC".to_string(), dec!(0.001998))));
        assert_eq!(h.gateway.orders().await.len(), 1);

        assert!(matches!(
            h.executor.cancel(position.id).await,
            Err(ArbError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_only_finished_positions() {
        let h = harness().await;
        let opp = detect(Utc::now());
        h.book.record(opp.clone());
        let position = h.executor.execute(request(&opp)).await.unwrap();

        h.executor.delete(position.id).await.unwrap();
        assert!(h.store.get_triangular(position.id).await.unwrap().is_none());
        assert!(matches!(
            h.executor.delete(position.id).await,
            Err(ArbError::NotFound(_))
        ));
    }
}
