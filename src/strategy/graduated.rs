//! Graduated-entry hedge executor.
//!
//! Opens a long on one exchange and an equal short on another by splitting
//! the size into `parts` slices. Both legs of a slice are dispatched
//! together; slices follow each other after `delay_ms`. A leg that still
//! fails after local retries stops the entry with the fills so far kept as
//! they are.

use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::normalizer::{reconcile_quantity, QuantityNormalizer};
use crate::config::GraduatedConfig;
use crate::error::{ArbError, GatewayError, Result};
use crate::events::EventBroadcaster;
use crate::exchange::{
    call_with_retry, canonical_symbol, split_symbol, ExchangeGateway, ExchangePosition,
    GatewayRegistry, OrderFill, OrderRequest, PositionSide, RetryPolicy, Venue,
};
use crate::persistence::PositionStore;
use crate::position::{
    HedgeLeg, HedgePosition, HedgeStatus, LegRole, LegStatus, PositionGuard, PositionLocks,
};

/// Request to open a hedge by graduated entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraduatedEntryRequest {
    pub symbol: String,
    pub primary_exchange: Venue,
    pub hedge_exchange: Venue,
    /// Side of the primary leg; the hedge leg takes the opposite side
    pub primary_side: PositionSide,
    pub leverage: u32,
    /// Total size in base asset, identical on both legs
    pub quantity: Decimal,
    pub parts: u32,
    pub delay_ms: u64,
}

/// Drives hedge positions from `INITIALIZING` to `ACTIVE`.
#[derive(Clone)]
pub struct GraduatedEntryExecutor {
    registry: GatewayRegistry,
    normalizer: Arc<QuantityNormalizer>,
    store: Arc<dyn PositionStore>,
    events: EventBroadcaster,
    locks: PositionLocks,
    config: GraduatedConfig,
    policy: RetryPolicy,
    cancellations: Arc<DashMap<Uuid, CancellationToken>>,
}

impl GraduatedEntryExecutor {
    pub fn new(
        registry: GatewayRegistry,
        normalizer: Arc<QuantityNormalizer>,
        store: Arc<dyn PositionStore>,
        events: EventBroadcaster,
        locks: PositionLocks,
        config: GraduatedConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            normalizer,
            store,
            events,
            locks,
            config,
            policy,
            cancellations: Arc::new(DashMap::new()),
        }
    }

    /// Validate, create the position and run the entry in the background.
    ///
    /// Returns the freshly created `INITIALIZING` position. Progress is
    /// reported through the store and the event stream.
    #[instrument(skip_all, fields(symbol = %request.symbol))]
    pub async fn start(&self, request: GraduatedEntryRequest) -> Result<HedgePosition> {
        let (position, guard, token) = self.prepare(&request).await?;
        let snapshot = position.clone();
        let executor = self.clone();
        tokio::spawn(async move {
            executor.run(position, guard, token).await;
        });
        Ok(snapshot)
    }

    /// Like [`GraduatedEntryExecutor::start`], but waits for the entry to
    /// finish and returns the final position.
    #[instrument(skip_all, fields(symbol = %request.symbol))]
    pub async fn execute(&self, request: GraduatedEntryRequest) -> Result<HedgePosition> {
        let (position, guard, token) = self.prepare(&request).await?;
        Ok(self.run(position, guard, token).await)
    }

    /// Stop scheduling further slices of an entry in progress.
    ///
    /// The position becomes `CANCELLED` at the next slice boundary. Orders
    /// already placed stay in place.
    pub async fn cancel(&self, id: Uuid) -> Result<HedgePosition> {
        let token = self.cancellations.get(&id).map(|t| t.clone());
        match token {
            Some(token) => {
                token.cancel();
                info!(position_id = %id, "Graduated entry cancellation requested");
            }
            None => {
                let position = self
                    .store
                    .get_hedge(id)
                    .await?
                    .ok_or_else(|| ArbError::NotFound(format!("hedge position {id}")))?;
                return Err(ArbError::InvalidTransition {
                    from: position.status.to_string(),
                    to: HedgeStatus::Cancelled.to_string(),
                });
            }
        }
        self.store
            .get_hedge(id)
            .await?
            .ok_or_else(|| ArbError::NotFound(format!("hedge position {id}")))
    }

    /// Whether an entry for `id` is still running.
    pub fn is_executing(&self, id: Uuid) -> bool {
        self.cancellations.contains_key(&id)
    }

    fn validate(&self, request: &GraduatedEntryRequest) -> Result<String> {
        let symbol = canonical_symbol(&request.symbol)
            .ok_or_else(|| ArbError::Validation(format!("unrecognised symbol: {}", request.symbol)))?;
        if request.primary_exchange == request.hedge_exchange {
            return Err(ArbError::Validation(
                "primary and hedge legs must be on different exchanges".to_string(),
            ));
        }
        for venue in [request.primary_exchange, request.hedge_exchange] {
            if self.registry.get(venue).is_none() {
                return Err(ArbError::Validation(format!("no gateway configured for {venue}")));
            }
        }

        let c = &self.config;
        if !(c.min_leverage..=c.max_leverage).contains(&request.leverage) {
            return Err(ArbError::Validation(format!(
                "leverage {} outside [{}, {}]",
                request.leverage, c.min_leverage, c.max_leverage
            )));
        }
        if !(c.min_parts..=c.max_parts).contains(&request.parts) {
            return Err(ArbError::Validation(format!(
                "parts {} outside [{}, {}]",
                request.parts, c.min_parts, c.max_parts
            )));
        }
        if !(c.min_delay_ms..=c.max_delay_ms).contains(&request.delay_ms) {
            return Err(ArbError::Validation(format!(
                "delay {}ms outside [{}ms, {}ms]",
                request.delay_ms, c.min_delay_ms, c.max_delay_ms
            )));
        }
        if request.quantity <= Decimal::ZERO {
            return Err(ArbError::Validation(format!(
                "quantity must be positive, got {}",
                request.quantity
            )));
        }
        Ok(symbol)
    }

    /// Everything that can fail before the first exchange side effect.
    async fn prepare(
        &self,
        request: &GraduatedEntryRequest,
    ) -> Result<(HedgePosition, PositionGuard, CancellationToken)> {
        let symbol = self.validate(request)?;
        let (primary_rules, hedge_rules) = tokio::try_join!(
            self.normalizer.normalize(request.primary_exchange, &symbol),
            self.normalizer.normalize(request.hedge_exchange, &symbol),
        )?;
        let reconciled =
            reconcile_quantity(&primary_rules, &hedge_rules, request.quantity, request.parts)?;

        let position = HedgePosition::new(
            symbol,
            HedgeLeg::new(
                LegRole::Primary,
                request.primary_exchange,
                request.primary_side,
                request.leverage,
            ),
            HedgeLeg::new(
                LegRole::Hedge,
                request.hedge_exchange,
                request.primary_side.opposite(),
                request.leverage,
            ),
            reconciled.quantity,
            reconciled.per_part_quantity,
            reconciled.parts,
            request.delay_ms,
        );
        let guard = self.locks.try_acquire(position.id, "graduated entry")?;
        self.store.create_hedge(&position).await?;

        let token = CancellationToken::new();
        self.cancellations.insert(position.id, token.clone());

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            primary = %position.primary.exchange,
            hedge = %position.hedge.exchange,
            quantity = %position.quantity,
            parts = position.parts,
            per_part = %position.per_part_quantity,
            "Hedge position created"
        );
        self.events.hedge_position(&position);
        Ok((position, guard, token))
    }

    async fn run(
        &self,
        mut position: HedgePosition,
        _guard: PositionGuard,
        token: CancellationToken,
    ) -> HedgePosition {
        self.drive(&mut position, &token).await;
        self.cancellations.remove(&position.id);
        position
    }

    async fn drive(&self, position: &mut HedgePosition, token: &CancellationToken) {
        let gateways = (
            self.registry.get(position.primary.exchange),
            self.registry.get(position.hedge.exchange),
        );
        let (Some(primary_gw), Some(hedge_gw)) = gateways else {
            self.fail(position, ArbError::Validation("gateway disappeared".into()))
                .await;
            return;
        };

        // Leverage first; nothing has been traded if this fails
        let (primary_lev, hedge_lev) = tokio::join!(
            self.apply_leverage(primary_gw.as_ref(), &position.symbol, position.primary.leverage),
            self.apply_leverage(hedge_gw.as_ref(), &position.symbol, position.hedge.leverage),
        );
        let mut failure = None;
        for (role, result) in [(LegRole::Primary, primary_lev), (LegRole::Hedge, hedge_lev)] {
            if let Err(e) = result {
                position.leg_mut(role).error = Some(e.to_string());
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            self.fail(position, e).await;
            return;
        }

        if self.transition(position, HedgeStatus::Executing).await.is_err() {
            return;
        }

        let base = split_symbol(&position.symbol).map(|(base, _)| base);
        for part in 1..=position.parts {
            if token.is_cancelled() {
                self.finish_cancelled(position).await;
                return;
            }

            let primary_order = slice_order(position, LegRole::Primary, part);
            let hedge_order = slice_order(position, LegRole::Hedge, part);
            position.primary.status = LegStatus::Opening;
            position.hedge.status = LegStatus::Opening;

            debug!(position_id = %position.id, part, parts = position.parts, "Dispatching slice");
            let (primary_fill, hedge_fill) = tokio::join!(
                place_with_retry(&self.policy, primary_gw.as_ref(), &primary_order),
                place_with_retry(&self.policy, hedge_gw.as_ref(), &hedge_order),
            );
            position.current_part = part;

            let mut failed: Vec<ArbError> = Vec::new();
            for (role, result) in [(LegRole::Primary, primary_fill), (LegRole::Hedge, hedge_fill)] {
                let leg = position.leg_mut(role);
                let outcome = match result {
                    Ok(fill) if fill.filled_qty > Decimal::ZERO => {
                        let fee = fill.fee_in_quote(base.as_deref());
                        leg.record_fill(fill.order_id, fill.filled_qty, fill.avg_price, fee);
                        continue;
                    }
                    Ok(fill) => GatewayError::Rejected {
                        code: None,
                        message: format!("order {} was not filled ({:?})", fill.order_id, fill.status),
                    },
                    Err(e) => e,
                };
                let err = ArbError::exchange(leg.exchange, "place_order", outcome);
                leg.status = LegStatus::Failed;
                leg.error = Some(err.to_string());
                failed.push(err);
            }

            if !failed.is_empty() {
                let any_filled = position.legs().iter().any(|l| l.filled_quantity > Decimal::ZERO);
                let err = if any_filled || failed.len() > 1 {
                    let detail: Vec<String> = failed.iter().map(|e| e.to_string()).collect();
                    ArbError::PartialExecution(format!(
                        "slice {part}/{}: {}",
                        position.parts,
                        detail.join("; ")
                    ))
                } else {
                    failed.remove(0)
                };
                self.fail(position, err).await;
                return;
            }

            info!(
                position_id = %position.id,
                part,
                parts = position.parts,
                primary_filled = %position.primary.filled_quantity,
                hedge_filled = %position.hedge.filled_quantity,
                "Slice filled on both legs"
            );
            self.save(position).await;

            if part < position.parts {
                tokio::select! {
                    _ = token.cancelled() => {
                        self.finish_cancelled(position).await;
                        return;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(position.delay_ms)) => {}
                }
            }
        }

        self.activate(position, primary_gw.as_ref(), hedge_gw.as_ref())
            .await;
    }

    async fn apply_leverage(
        &self,
        gateway: &dyn ExchangeGateway,
        symbol: &str,
        leverage: u32,
    ) -> Result<()> {
        match call_with_retry(&self.policy, "set_leverage", || gateway.set_leverage(symbol, leverage))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_leverage_not_modified() => {
                debug!(venue = %gateway.venue(), %symbol, leverage, "Leverage already set");
                Ok(())
            }
            Err(e) => Err(ArbError::exchange(gateway.venue(), "set_leverage", e)),
        }
    }

    /// Snapshot both legs from the exchanges and go `ACTIVE` if both hold
    /// a position.
    async fn activate(
        &self,
        position: &mut HedgePosition,
        primary_gw: &dyn ExchangeGateway,
        hedge_gw: &dyn ExchangeGateway,
    ) {
        let (primary, hedge) = tokio::join!(
            self.fetch_leg(primary_gw, &position.symbol, position.primary.side),
            self.fetch_leg(hedge_gw, &position.symbol, position.hedge.side),
        );

        for (role, snapshot) in [(LegRole::Primary, primary), (LegRole::Hedge, hedge)] {
            let leg = position.leg_mut(role);
            match snapshot {
                Ok(Some(p)) => {
                    leg.filled_quantity = p.size;
                    leg.entry_price = p.entry_price;
                    leg.current_price = p.mark_price;
                    leg.liquidation_price = p.liquidation_price;
                    leg.unrealized_pnl = p.unrealized_pnl;
                }
                Ok(None) => leg.filled_quantity = Decimal::ZERO,
                Err(e) => warn!(
                    exchange = %leg.exchange,
                    error = %e,
                    "Position snapshot failed, keeping fill-derived values"
                ),
            }
            leg.status = if leg.filled_quantity > Decimal::ZERO {
                LegStatus::Open
            } else {
                LegStatus::Failed
            };
        }

        let closed: Vec<String> = position
            .legs()
            .iter()
            .filter(|l| l.status != LegStatus::Open)
            .map(|l| format!("{} leg on {}", l.role, l.exchange))
            .collect();
        if !closed.is_empty() {
            let err = ArbError::PartialExecution(format!(
                "{} reports no open position after entry",
                closed.join(" and ")
            ));
            self.fail(position, err).await;
            return;
        }

        position.monitoring_enabled = self.config.monitor_on_activate;
        position.monitoring_status = Some(
            if position.monitoring_enabled { "monitoring" } else { "monitoring disabled" }.to_string(),
        );
        position.refresh_totals();
        if self.transition(position, HedgeStatus::Active).await.is_ok() {
            info!(
                position_id = %position.id,
                primary_entry = %position.primary.entry_price,
                hedge_entry = %position.hedge.entry_price,
                quantity = %position.primary.filled_quantity,
                "Hedge position active"
            );
        }
    }

    async fn fetch_leg(
        &self,
        gateway: &dyn ExchangeGateway,
        symbol: &str,
        side: PositionSide,
    ) -> std::result::Result<Option<ExchangePosition>, GatewayError> {
        let positions = call_with_retry(&self.policy, "get_positions", || {
            gateway.get_positions(Some(symbol))
        })
        .await?;
        Ok(positions.into_iter().find(|p| p.side == side && p.is_open()))
    }

    async fn finish_cancelled(&self, position: &mut HedgePosition) {
        for leg in [&mut position.primary, &mut position.hedge] {
            leg.status = if leg.filled_quantity > Decimal::ZERO {
                LegStatus::Open
            } else {
                LegStatus::Pending
            };
        }
        if self.transition(position, HedgeStatus::Cancelled).await.is_ok() {
            info!(
                position_id = %position.id,
                completed_parts = position.current_part,
                parts = position.parts,
                "Graduated entry cancelled"
            );
        }
    }

    async fn fail(&self, position: &mut HedgePosition, err: ArbError) {
        error!(position_id = %position.id, code = err.code(), error = %err, "Graduated entry failed");
        position.error = Some(err.to_string());
        if self.transition(position, HedgeStatus::Error).await.is_ok() {
            self.events.error(&err, Some(position.id.to_string()));
        }
    }

    async fn transition(&self, position: &mut HedgePosition, next: HedgeStatus) -> Result<()> {
        if let Err(e) = position.transition(next) {
            error!(position_id = %position.id, error = %e, "Refused status transition");
            return Err(e);
        }
        if next != HedgeStatus::Executing {
            self.cancellations.remove(&position.id);
        }
        self.save(position).await;
        Ok(())
    }

    async fn save(&self, position: &HedgePosition) {
        if let Err(e) = self.store.update_hedge(position).await {
            error!(position_id = %position.id, error = %e, "Failed to persist hedge position");
        }
        self.events.hedge_position(position);
    }
}

fn slice_order(position: &HedgePosition, role: LegRole, part: u32) -> OrderRequest {
    let leg = position.leg(role);
    let id = position.id.simple().to_string();
    OrderRequest::market(
        position.symbol.clone(),
        leg.side.entry_order_side(),
        position.per_part_quantity,
    )
    .with_position_side(leg.side)
    .with_client_order_id(format!("ge-{}-{role}-{part}", &id[..12]))
}

async fn place_with_retry(
    policy: &RetryPolicy,
    gateway: &dyn ExchangeGateway,
    order: &OrderRequest,
) -> std::result::Result<OrderFill, GatewayError> {
    call_with_retry(policy, "place_order", || gateway.place_order(order)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::events::{EventData, PositionSnapshot};
    use crate::exchange::{InstrumentRules, PaperGateway};
    use crate::persistence::MemoryPositionStore;
    use rust_decimal_macros::dec;
    use std::time::Instant;

    struct Harness {
        primary: Arc<PaperGateway>,
        hedge: Arc<PaperGateway>,
        store: Arc<MemoryPositionStore>,
        events: EventBroadcaster,
        executor: GraduatedEntryExecutor,
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::from_config(&GatewayConfig {
            timeout_ms: 500,
            max_attempts: 3,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
        })
    }

    async fn harness() -> Harness {
        let rules = InstrumentRules {
            min_qty: dec!(0.001),
            max_qty: dec!(100),
            qty_step: dec!(0.001),
            price_precision: 1,
            qty_precision: 3,
        };
        let primary = Arc::new(PaperGateway::new(Venue::Bybit));
        let hedge = Arc::new(PaperGateway::new(Venue::Bingx));
        for gw in [&primary, &hedge] {
            gw.list_symbol("BTC/USDT", rules).await;
            gw.set_price("BTC/USDT", dec!(50000), dec!(50010), dec!(50005)).await;
        }

        let registry = GatewayRegistry::new()
            .with(primary.clone())
            .with(hedge.clone());
        let store = Arc::new(MemoryPositionStore::new());
        let events = EventBroadcaster::new(256);
        let executor = GraduatedEntryExecutor::new(
            registry.clone(),
            Arc::new(QuantityNormalizer::new(registry, fast_policy())),
            store.clone(),
            events.clone(),
            PositionLocks::new(),
            GraduatedConfig::default(),
            fast_policy(),
        );
        Harness {
            primary,
            hedge,
            store,
            events,
            executor,
        }
    }

    fn request(quantity: Decimal, parts: u32, delay_ms: u64) -> GraduatedEntryRequest {
        GraduatedEntryRequest {
            symbol: "BTCUSDT".into(),
            primary_exchange: Venue::Bybit,
            hedge_exchange: Venue::Bingx,
            primary_side: PositionSide::Long,
            leverage: 5,
            quantity,
            parts,
            delay_ms,
        }
    }

    async fn wait_for_terminal(store: &MemoryPositionStore, id: Uuid) -> HedgePosition {
        for _ in 0..200 {
            if let Some(p) = store.get_hedge(id).await.unwrap() {
                if p.status.is_terminal() || p.status == HedgeStatus::Active {
                    return p;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("position {id} never settled");
    }

    #[tokio::test]
    async fn test_five_slices_dispatched_in_pairs() {
        let h = harness().await;
        let started = Instant::now();
        let position = h.executor.execute(request(dec!(0.5), 5, 100)).await.unwrap();

        assert_eq!(position.status, HedgeStatus::Active);
        assert_eq!(position.current_part, 5);
        assert_eq!(position.primary.filled_quantity, dec!(0.5));
        assert_eq!(position.hedge.filled_quantity, dec!(0.5));
        assert_eq!(position.primary.entry_price, dec!(50010));
        assert_eq!(position.hedge.entry_price, dec!(50000));
        assert!(position.monitoring_enabled);
        assert!(started.elapsed() >= Duration::from_millis(400));

        let primary_orders = h.primary.orders().await;
        let hedge_orders = h.hedge.orders().await;
        assert_eq!(primary_orders.len(), 5);
        assert_eq!(hedge_orders.len(), 5);

        for (p, q) in primary_orders.iter().zip(&hedge_orders) {
            let skew = if p.submitted_at > q.submitted_at {
                p.submitted_at - q.submitted_at
            } else {
                q.submitted_at - p.submitted_at
            };
            assert!(skew < Duration::from_millis(50));
            assert_eq!(p.request.quantity, dec!(0.1));
        }
        for pair in primary_orders.windows(2) {
            assert!(pair[1].submitted_at - pair[0].submitted_at >= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_rejected_quantity_places_no_orders() {
        let h = harness().await;
        let err = h
            .executor
            .execute(request(dec!(0.1003), 2, 100))
            .await
            .unwrap_err();

        assert!(matches!(err, ArbError::QuantityRejected { .. }));
        assert!(h.primary.orders().await.is_empty());
        assert!(h.hedge.orders().await.is_empty());
        assert!(h
            .store
            .find_hedges(&Default::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_inputs_are_validation_errors() {
        let h = harness().await;
        let mut bad = request(dec!(1), 2, 100);
        bad.leverage = 126;
        assert!(matches!(h.executor.execute(bad).await, Err(ArbError::Validation(_))));

        let bad = request(dec!(1), 21, 100);
        assert!(matches!(h.executor.execute(bad).await, Err(ArbError::Validation(_))));

        let bad = request(dec!(1), 2, 50);
        assert!(matches!(h.executor.execute(bad).await, Err(ArbError::Validation(_))));

        let mut bad = request(dec!(1), 2, 100);
        bad.hedge_exchange = Venue::Bybit;
        assert!(matches!(h.executor.execute(bad).await, Err(ArbError::Validation(_))));

        assert!(h.primary.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejected_leg_keeps_partial_fills() {
        let h = harness().await;
        h.hedge
            .inject_order_faults([GatewayError::Rejected {
                code: None,
                message: "insufficient margin".into(),
            }])
            .await;

        let position = h.executor.execute(request(dec!(0.3), 3, 100)).await.unwrap();

        assert_eq!(position.status, HedgeStatus::Error);
        assert_eq!(position.primary.filled_quantity, dec!(0.1));
        assert_eq!(position.hedge.filled_quantity, dec!(0));
        assert_eq!(position.hedge.status, LegStatus::Failed);
        assert!(position.error.as_deref().unwrap_or("").contains("partial execution"));

        // No further slices and no unwind of the filled leg
        assert_eq!(h.primary.orders().await.len(), 1);
        assert_eq!(h.primary.get_positions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_only_the_failed_leg() {
        let h = harness().await;
        h.hedge
            .inject_order_faults([GatewayError::Transient("502 bad gateway".into())])
            .await;

        let position = h.executor.execute(request(dec!(0.2), 2, 100)).await.unwrap();

        assert_eq!(position.status, HedgeStatus::Active);
        assert_eq!(h.primary.orders().await.len(), 2);
        assert_eq!(h.hedge.orders().await.len(), 3);
        assert!(position.is_balanced());
    }

    #[tokio::test]
    async fn test_leverage_not_modified_counts_as_success() {
        let h = harness().await;
        h.primary.set_leverage("BTC/USDT", 5).await.unwrap();
        h.hedge.set_leverage("BTC/USDT", 5).await.unwrap();

        let position = h.executor.execute(request(dec!(0.1), 1, 100)).await.unwrap();
        assert_eq!(position.status, HedgeStatus::Active);
    }

    #[tokio::test]
    async fn test_cancel_stops_at_slice_boundary() {
        let h = harness().await;
        let created = h.executor.start(request(dec!(0.5), 5, 2_000)).await.unwrap();
        assert_eq!(created.status, HedgeStatus::Initializing);

        tokio::time::sleep(Duration::from_millis(100)).await;
        h.executor.cancel(created.id).await.unwrap();

        let position = wait_for_terminal(&h.store, created.id).await;
        assert_eq!(position.status, HedgeStatus::Cancelled);
        assert_eq!(position.current_part, 1);
        assert_eq!(position.primary.status, LegStatus::Open);
        assert_eq!(h.primary.orders().await.len(), 1);
        assert!(!h.executor.is_executing(created.id));

        let err = h.executor.cancel(created.id).await.unwrap_err();
        assert!(matches!(err, ArbError::InvalidTransition { .. }));
        assert!(matches!(
            h.executor.cancel(Uuid::new_v4()).await,
            Err(ArbError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_every_transition_is_broadcast() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        h.executor.execute(request(dec!(0.2), 2, 100)).await.unwrap();

        let mut statuses = Vec::new();
        while let Some(event) = events.try_recv() {
            if let EventData::Position(PositionSnapshot::Hedge(p)) = event.data {
                if statuses.last() != Some(&p.status) {
                    statuses.push(p.status);
                }
            }
        }
        assert_eq!(
            statuses,
            vec![
                HedgeStatus::Initializing,
                HedgeStatus::Executing,
                HedgeStatus::Active
            ]
        );
    }
}
