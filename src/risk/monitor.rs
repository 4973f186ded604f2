//! Periodic reconciliation of hedge positions against exchange state.
//!
//! One tick fetches the open positions of every venue involved (one call
//! per venue), refreshes each monitored hedge from what the exchanges
//! report and applies the consistency rule: a hedge with exactly one leg
//! still open was broken on the exchange side and becomes `LIQUIDATED`.

use chrono::Utc;
use futures_util::future::join_all;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::liquidation::{liquidation_distance_pct, liquidation_proximity};
use crate::config::MonitorConfig;
use crate::error::{ArbError, GatewayError, Result};
use crate::events::EventBroadcaster;
use crate::exchange::{
    call_with_retry, split_symbol, ExchangePosition, GatewayRegistry, RetryPolicy, Venue,
};
use crate::persistence::{HedgeFilter, PositionStore};
use crate::position::{HedgePosition, HedgeStatus, LegRole, LegStatus, PositionLocks};

type Snapshots = HashMap<Venue, std::result::Result<Vec<ExchangePosition>, GatewayError>>;

/// Counters for one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub checked: usize,
    /// Positions owned by another operation during this tick
    pub skipped_busy: usize,
    pub liquidated: usize,
    pub warnings: usize,
    /// Positions whose exchange state could not be read
    pub unavailable: usize,
    /// Positions that could not be re-read from the store
    pub store_errors: usize,
}

/// What a single reconciliation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Healthy,
    Warning,
    Liquidated,
    BothClosed,
    Unavailable,
}

pub struct PositionMonitor {
    registry: GatewayRegistry,
    store: Arc<dyn PositionStore>,
    events: EventBroadcaster,
    locks: PositionLocks,
    config: MonitorConfig,
    policy: RetryPolicy,
}

impl PositionMonitor {
    pub fn new(
        registry: GatewayRegistry,
        store: Arc<dyn PositionStore>,
        events: EventBroadcaster,
        locks: PositionLocks,
        config: MonitorConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            store,
            events,
            locks,
            config,
            policy,
        }
    }

    /// Tick every `interval_secs` until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval_secs, "Position monitor started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick().await {
                Ok(summary) if summary.checked > 0 || summary.skipped_busy > 0 => info!(
                    checked = summary.checked,
                    busy = summary.skipped_busy,
                    liquidated = summary.liquidated,
                    warnings = summary.warnings,
                    unavailable = summary.unavailable,
                    "Reconciliation tick"
                ),
                Ok(_) => debug!("Reconciliation tick: nothing monitored"),
                Err(e) => error!(error = %e, "Reconciliation tick failed"),
            }
        }
        info!("Position monitor stopped");
    }

    /// Reconcile every active, monitored hedge once.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<TickSummary> {
        let positions = self.store.find_hedges(&HedgeFilter::monitored()).await?;
        let mut summary = TickSummary::default();
        if positions.is_empty() {
            return Ok(summary);
        }

        let venues: BTreeSet<Venue> = positions
            .iter()
            .flat_map(|p| [p.primary.exchange, p.hedge.exchange])
            .collect();
        let snapshots = self.fetch_snapshots(venues, None).await;

        for stale in positions {
            let Ok(_guard) = self.locks.try_acquire(stale.id, "reconciliation") else {
                debug!(position_id = %stale.id, "Position busy, skipped this tick");
                summary.skipped_busy += 1;
                continue;
            };
            // Re-read under the lock; another operation may have just finished
            let mut position = match self.store.get_hedge(stale.id).await {
                Ok(Some(position)) => position,
                Ok(None) => continue,
                Err(e) => {
                    error!(position_id = %stale.id, error = %e, "Failed to load position, skipped this tick");
                    summary.store_errors += 1;
                    continue;
                }
            };
            if position.status != HedgeStatus::Active || !position.monitoring_enabled {
                continue;
            }

            summary.checked += 1;
            match self.reconcile(&mut position, &snapshots).await {
                Verdict::Liquidated => summary.liquidated += 1,
                Verdict::Warning => summary.warnings += 1,
                Verdict::Unavailable => summary.unavailable += 1,
                Verdict::Healthy | Verdict::BothClosed => {}
            }
        }
        Ok(summary)
    }

    /// Reconcile one position now, regardless of its monitoring flag.
    pub async fn reconcile_now(&self, id: Uuid) -> Result<HedgePosition> {
        let _guard = self.locks.try_acquire(id, "reconciliation")?;
        let mut position = self.load(id).await?;
        if position.status != HedgeStatus::Active {
            return Err(ArbError::InvalidTransition {
                from: position.status.to_string(),
                to: "reconciled".to_string(),
            });
        }

        let venues = BTreeSet::from([position.primary.exchange, position.hedge.exchange]);
        let snapshots = self.fetch_snapshots(venues, Some(&position.symbol)).await;
        self.reconcile(&mut position, &snapshots).await;
        Ok(position)
    }

    /// Turn monitoring on or off. Execution of the position is unaffected.
    pub async fn set_monitoring(&self, id: Uuid, enabled: bool) -> Result<HedgePosition> {
        let _guard = self.locks.try_acquire(id, "monitoring toggle")?;
        let mut position = self.load(id).await?;
        if position.status.is_terminal() {
            return Err(ArbError::InvalidTransition {
                from: position.status.to_string(),
                to: if enabled { "monitoring" } else { "monitoring disabled" }.to_string(),
            });
        }

        position.monitoring_enabled = enabled;
        position.monitoring_status =
            Some(if enabled { "monitoring" } else { "monitoring disabled" }.to_string());
        position.updated_at = Utc::now();
        self.store.update_hedge(&position).await?;
        self.events.hedge_position(&position);
        info!(position_id = %id, enabled, "Monitoring toggled");
        Ok(position)
    }

    /// Close both legs of an active hedge in parallel.
    ///
    /// Both closed gives `COMPLETED`. If either close fails the position
    /// goes to `ERROR` with what did close recorded; nothing is reopened.
    #[instrument(skip(self))]
    pub async fn close_position(&self, id: Uuid) -> Result<HedgePosition> {
        let _guard = self.locks.try_acquire(id, "close")?;
        let mut position = self.load(id).await?;
        if position.status != HedgeStatus::Active {
            return Err(ArbError::InvalidTransition {
                from: position.status.to_string(),
                to: HedgeStatus::Completed.to_string(),
            });
        }
        let (Some(primary_gw), Some(hedge_gw)) = (
            self.registry.get(position.primary.exchange),
            self.registry.get(position.hedge.exchange),
        ) else {
            return Err(ArbError::Validation(format!(
                "no gateway configured for {} or {}",
                position.primary.exchange, position.hedge.exchange
            )));
        };

        let symbol = position.symbol.clone();
        let (primary, hedge) = tokio::join!(
            call_with_retry(&self.policy, "close_position", || {
                primary_gw.close_position(&symbol, position.primary.side)
            }),
            call_with_retry(&self.policy, "close_position", || {
                hedge_gw.close_position(&symbol, position.hedge.side)
            }),
        );

        let base = split_symbol(&symbol).map(|(base, _)| base);
        let mut failed = Vec::new();
        for (role, result) in [(LegRole::Primary, primary), (LegRole::Hedge, hedge)] {
            let leg = position.leg_mut(role);
            match result {
                Ok(fill) => {
                    if let Some(fill) = fill {
                        leg.trading_fees += fill.fee_in_quote(base.as_deref());
                        leg.current_price = fill.avg_price;
                        leg.order_ids.push(fill.order_id);
                    }
                    leg.status = LegStatus::Closed;
                    leg.unrealized_pnl = Decimal::ZERO;
                }
                Err(e) => {
                    let err = ArbError::exchange(leg.exchange, "close_position", e);
                    leg.error = Some(err.to_string());
                    failed.push(err);
                }
            }
        }
        position.refresh_totals();
        position.monitoring_enabled = false;

        if failed.is_empty() {
            position.monitoring_status = Some("closed".to_string());
            position.transition(HedgeStatus::Completed)?;
            info!(position_id = %id, fees = %position.trading_fees, "Hedge position closed");
        } else {
            let detail: Vec<String> = failed.iter().map(|e| e.to_string()).collect();
            let err = ArbError::PartialExecution(format!("close: {}", detail.join("; ")));
            error!(position_id = %id, error = %err, "Hedge close failed");
            position.error = Some(err.to_string());
            position.monitoring_status = Some("close failed".to_string());
            position.transition(HedgeStatus::Error)?;
            self.events.error(&err, Some(id.to_string()));
        }
        self.store.update_hedge(&position).await?;
        self.events.hedge_position(&position);
        Ok(position)
    }

    async fn load(&self, id: Uuid) -> Result<HedgePosition> {
        self.store
            .get_hedge(id)
            .await?
            .ok_or_else(|| ArbError::NotFound(format!("hedge position {id}")))
    }

    /// Open positions per venue, fetched concurrently.
    async fn fetch_snapshots(&self, venues: BTreeSet<Venue>, symbol: Option<&str>) -> Snapshots {
        let fetches = venues.into_iter().map(|venue| async move {
            let result = match self.registry.get(venue) {
                Some(gateway) => {
                    call_with_retry(&self.policy, "get_positions", || gateway.get_positions(symbol))
                        .await
                }
                None => Err(GatewayError::Transient(format!("no gateway for {venue}"))),
            };
            if let Err(e) = &result {
                warn!(%venue, error = %e, "Position snapshot unavailable");
            }
            (venue, result)
        });
        join_all(fetches).await.into_iter().collect()
    }

    /// Apply exchange truth to one position and persist the outcome.
    async fn reconcile(&self, position: &mut HedgePosition, snapshots: &Snapshots) -> Verdict {
        let now = Utc::now();
        position.last_check_at = Some(now);

        let mut open = [false; 2];
        let mut unavailable = false;
        for (i, role) in [LegRole::Primary, LegRole::Hedge].into_iter().enumerate() {
            let symbol = position.symbol.clone();
            let leg = position.leg_mut(role);
            let reported = match snapshots.get(&leg.exchange) {
                Some(Ok(list)) => list
                    .iter()
                    .find(|p| p.symbol == symbol && p.side == leg.side && p.is_open()),
                _ => {
                    unavailable = true;
                    continue;
                }
            };
            if let Some(p) = reported {
                open[i] = true;
                leg.filled_quantity = p.size;
                leg.current_price = p.mark_price;
                leg.unrealized_pnl = p.unrealized_pnl;
                leg.funding_accrued = p.accumulated_funding;
                leg.liquidation_price = p.liquidation_price;
                leg.liquidation_proximity =
                    liquidation_proximity(leg.entry_price, p.mark_price, p.liquidation_price);
            }
        }

        let verdict = if unavailable {
            position.monitoring_status = Some("exchange state unavailable".to_string());
            Verdict::Unavailable
        } else {
            match open {
                [true, true] => self.check_proximity(position),
                [false, false] => {
                    // Closed elsewhere; not ours to conclude
                    warn!(position_id = %position.id, "Both legs report no position");
                    position.monitoring_status = Some("both legs closed on exchange".to_string());
                    Verdict::BothClosed
                }
                [primary_open, _] => {
                    let closed = if primary_open { LegRole::Hedge } else { LegRole::Primary };
                    self.mark_liquidated(position, closed);
                    Verdict::Liquidated
                }
            }
        };

        position.refresh_totals();
        if let Err(e) = self.store.update_hedge(position).await {
            error!(position_id = %position.id, error = %e, "Failed to persist reconciliation");
        }
        self.events.hedge_position(position);
        verdict
    }

    fn check_proximity(&self, position: &mut HedgePosition) -> Verdict {
        let threshold = self.config.liquidation_warning_ratio;
        let at_risk: Vec<String> = position
            .legs()
            .iter()
            .filter(|l| l.liquidation_proximity >= threshold)
            .map(|l| format!("{} {}", l.role, l.liquidation_proximity))
            .collect();

        if at_risk.is_empty() {
            position.monitoring_status = Some("monitoring".to_string());
            return Verdict::Healthy;
        }
        for leg in position.legs() {
            if leg.liquidation_proximity >= threshold {
                warn!(
                    position_id = %position.id,
                    role = %leg.role,
                    exchange = %leg.exchange,
                    proximity = %leg.liquidation_proximity,
                    distance_pct = ?liquidation_distance_pct(leg.current_price, leg.liquidation_price),
                    "Leg approaching liquidation"
                );
            }
        }
        position.monitoring_status = Some(format!("liquidation warning: {}", at_risk.join(", ")));
        Verdict::Warning
    }

    fn mark_liquidated(&self, position: &mut HedgePosition, closed: LegRole) {
        {
            let leg = position.leg_mut(closed);
            leg.status = LegStatus::Closed;
            leg.filled_quantity = Decimal::ZERO;
            leg.unrealized_pnl = Decimal::ZERO;
        }
        position.liquidated_leg = Some(closed);
        position.monitoring_enabled = false;
        position.monitoring_status = Some(format!("{closed} leg closed on exchange"));
        if let Err(e) = position.transition(HedgeStatus::Liquidated) {
            error!(position_id = %position.id, error = %e, "Refused liquidation transition");
            return;
        }
        warn!(
            position_id = %position.id,
            symbol = %position.symbol,
            closed_leg = %closed,
            exchange = %position.leg(closed).exchange,
            "Hedge broken: one leg liquidated"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, GraduatedConfig};
    use crate::events::{EventData, PositionSnapshot};
    use crate::exchange::{ExchangeGateway, InstrumentRules, PaperGateway, PositionSide};
    use crate::persistence::{MemoryPositionStore, TriangularFilter};
    use crate::position::TriangularPosition;
    use async_trait::async_trait;
    use crate::strategy::{GraduatedEntryExecutor, GraduatedEntryRequest, QuantityNormalizer};
    use rust_decimal_macros::dec;

    struct Harness {
        primary: Arc<PaperGateway>,
        hedge: Arc<PaperGateway>,
        store: Arc<MemoryPositionStore>,
        events: EventBroadcaster,
        locks: PositionLocks,
        monitor: PositionMonitor,
        position: HedgePosition,
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::from_config(&GatewayConfig {
            timeout_ms: 500,
            max_attempts: 2,
            base_backoff_ms: 1,
            max_backoff_ms: 5,
        })
    }

    /// An active BTC hedge: long on Bybit, short on BingX.
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
            gw.set_flat_price("BTC/USDT", dec!(50000)).await;
        }
        let registry = GatewayRegistry::new()
            .with(primary.clone())
            .with(hedge.clone());
        let store = Arc::new(MemoryPositionStore::new());
        let events = EventBroadcaster::new(256);
        let locks = PositionLocks::new();

        let executor = GraduatedEntryExecutor::new(
            registry.clone(),
            Arc::new(QuantityNormalizer::new(registry.clone(), policy())),
            store.clone(),
            events.clone(),
            locks.clone(),
            GraduatedConfig::default(),
            policy(),
        );
        let position = executor
            .execute(GraduatedEntryRequest {
                symbol: "BTC/USDT".into(),
                primary_exchange: Venue::Bybit,
                hedge_exchange: Venue::Bingx,
                primary_side: PositionSide::Long,
                leverage: 5,
                quantity: dec!(0.2),
                parts: 1,
                delay_ms: 100,
            })
            .await
            .unwrap();
        assert_eq!(position.status, HedgeStatus::Active);

        let monitor = PositionMonitor::new(
            registry,
            store.clone(),
            events.clone(),
            locks.clone(),
            MonitorConfig::default(),
            policy(),
        );
        Harness {
            primary,
            hedge,
            store,
            events,
            locks,
            monitor,
            position,
        }
    }

    /// Store whose reads of one hedge always fail.
    struct BrokenRead {
        inner: Arc<MemoryPositionStore>,
        broken: Uuid,
    }

    #[async_trait]
    impl PositionStore for BrokenRead {
        async fn create_hedge(&self, position: &HedgePosition) -> Result<()> {
            self.inner.create_hedge(position).await
        }
        async fn update_hedge(&self, position: &HedgePosition) -> Result<()> {
            self.inner.update_hedge(position).await
        }
        async fn get_hedge(&self, id: Uuid) -> Result<Option<HedgePosition>> {
            if id == self.broken {
                return Err(ArbError::Store(anyhow::anyhow!("disk I/O error")));
            }
            self.inner.get_hedge(id).await
        }
        async fn find_hedges(&self, filter: &HedgeFilter) -> Result<Vec<HedgePosition>> {
            self.inner.find_hedges(filter).await
        }
        async fn create_triangular(&self, position: &TriangularPosition) -> Result<()> {
            self.inner.create_triangular(position).await
        }
        async fn update_triangular(&self, position: &TriangularPosition) -> Result<()> {
            self.inner.update_triangular(position).await
        }
        async fn get_triangular(&self, id: Uuid) -> Result<Option<TriangularPosition>> {
            self.inner.get_triangular(id).await
        }
        async fn find_triangular(&self, filter: &TriangularFilter) -> Result<Vec<TriangularPosition>> {
            self.inner.find_triangular(filter).await
        }
        async fn delete_triangular(&self, id: Uuid) -> Result<bool> {
            self.inner.delete_triangular(id).await
        }
    }

    #[tokio::test]
    async fn test_unreadable_position_does_not_abort_tick() {
        let h = harness().await;
        let mut other = h.position.clone();
        other.id = Uuid::new_v4();
        h.store.create_hedge(&other).await.unwrap();

        let registry = GatewayRegistry::new()
            .with(h.primary.clone())
            .with(h.hedge.clone());
        let monitor = PositionMonitor::new(
            registry,
            Arc::new(BrokenRead {
                inner: h.store.clone(),
                broken: h.position.id,
            }),
            h.events.clone(),
            h.locks.clone(),
            MonitorConfig::default(),
            policy(),
        );
        h.primary.set_flat_price("BTC/USDT", dec!(51000)).await;

        let summary = monitor.tick().await.unwrap();
        assert_eq!(summary.store_errors, 1);
        assert_eq!(summary.checked, 1);
        let refreshed = h.store.get_hedge(other.id).await.unwrap().unwrap();
        assert_eq!(refreshed.primary.current_price, dec!(51000));
    }

    #[tokio::test]
    async fn test_tick_refreshes_pnl_and_funding() {
        let h = harness().await;
        h.primary.set_flat_price("BTC/USDT", dec!(51000)).await;
        h.hedge.set_flat_price("BTC/USDT", dec!(51000)).await;
        h.hedge.apply_funding("BTC/USDT", dec!(0.0001)).await;

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.checked, 1);
        assert_eq!(summary.liquidated, 0);

        let p = h.store.get_hedge(h.position.id).await.unwrap().unwrap();
        assert_eq!(p.status, HedgeStatus::Active);
        assert_eq!(p.primary.unrealized_pnl, dec!(200));
        assert_eq!(p.hedge.unrealized_pnl, dec!(-200));
        assert_eq!(p.unrealized_pnl, dec!(0));
        // Short receives 0.2 * 51000 * 0.0001
        assert_eq!(p.hedge.funding_accrued, dec!(1.02));
        assert_eq!(p.funding_accrued, dec!(1.02));
        assert!(p.last_check_at.is_some());
        assert_eq!(p.primary.current_price, dec!(51000));
    }

    #[tokio::test]
    async fn test_one_leg_closed_liquidates_exactly_once() {
        let h = harness().await;
        let mut events = h.events.subscribe();
        assert!(h.hedge.force_liquidate("BTC/USDT", PositionSide::Short).await);

        let first = h.monitor.tick().await.unwrap();
        assert_eq!(first.liquidated, 1);
        let p = h.store.get_hedge(h.position.id).await.unwrap().unwrap();
        assert_eq!(p.status, HedgeStatus::Liquidated);
        assert_eq!(p.liquidated_leg, Some(LegRole::Hedge));
        assert_eq!(p.hedge.status, LegStatus::Closed);
        assert!(!p.monitoring_enabled);

        let second = h.monitor.tick().await.unwrap();
        assert_eq!(second, TickSummary::default());

        let mut liquidations = 0;
        while let Some(event) = events.try_recv() {
            if let EventData::Position(PositionSnapshot::Hedge(p)) = event.data {
                if p.status == HedgeStatus::Liquidated {
                    liquidations += 1;
                }
            }
        }
        assert_eq!(liquidations, 1);
        // The surviving leg is left alone
        assert_eq!(h.primary.get_positions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_both_legs_closed_keeps_status() {
        let h = harness().await;
        h.primary.force_liquidate("BTC/USDT", PositionSide::Long).await;
        h.hedge.force_liquidate("BTC/USDT", PositionSide::Short).await;

        h.monitor.tick().await.unwrap();
        let p = h.store.get_hedge(h.position.id).await.unwrap().unwrap();
        assert_eq!(p.status, HedgeStatus::Active);
        assert_eq!(p.monitoring_status.as_deref(), Some("both legs closed on exchange"));
    }

    #[tokio::test]
    async fn test_unreadable_exchange_is_not_a_liquidation() {
        let h = harness().await;
        h.hedge
            .inject_position_faults([
                GatewayError::Transient("503".into()),
                GatewayError::Transient("503".into()),
            ])
            .await;

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.unavailable, 1);
        let p = h.store.get_hedge(h.position.id).await.unwrap().unwrap();
        assert_eq!(p.status, HedgeStatus::Active);
    }

    #[tokio::test]
    async fn test_busy_and_unmonitored_positions_are_skipped() {
        let h = harness().await;
        {
            let _guard = h.locks.try_acquire(h.position.id, "test").unwrap();
            let summary = h.monitor.tick().await.unwrap();
            assert_eq!(summary.skipped_busy, 1);
            assert_eq!(summary.checked, 0);
            assert!(matches!(
                h.monitor.reconcile_now(h.position.id).await,
                Err(ArbError::Busy(_))
            ));
        }

        let p = h.monitor.set_monitoring(h.position.id, false).await.unwrap();
        assert!(!p.monitoring_enabled);
        h.hedge.force_liquidate("BTC/USDT", PositionSide::Short).await;
        assert_eq!(h.monitor.tick().await.unwrap().checked, 0);

        // An explicit reconciliation still applies the rule
        let p = h.monitor.reconcile_now(h.position.id).await.unwrap();
        assert_eq!(p.status, HedgeStatus::Liquidated);
        assert!(matches!(
            h.monitor.set_monitoring(h.position.id, true).await,
            Err(ArbError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_warning_near_liquidation() {
        let h = harness().await;
        // Long 5x from 50000 liquidates near 40250
        h.primary.set_flat_price("BTC/USDT", dec!(41000)).await;

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.warnings, 1);
        let p = h.store.get_hedge(h.position.id).await.unwrap().unwrap();
        assert!(p.primary.liquidation_proximity > dec!(0.9));
        assert_eq!(p.hedge.liquidation_proximity, dec!(0));
        assert!(p
            .monitoring_status
            .as_deref()
            .unwrap_or("")
            .starts_with("liquidation warning"));
    }

    #[tokio::test]
    async fn test_close_position_completes() {
        let h = harness().await;
        let p = h.monitor.close_position(h.position.id).await.unwrap();

        assert_eq!(p.status, HedgeStatus::Completed);
        assert!(p.legs().iter().all(|l| l.status == LegStatus::Closed));
        assert!(h.primary.get_positions(None).await.unwrap().is_empty());
        assert!(h.hedge.get_positions(None).await.unwrap().is_empty());
        // Entry and exit fees on both legs: 4 x 0.2 x 50000 x 0.1%
        assert_eq!(p.trading_fees, dec!(40));
    }

    #[tokio::test]
    async fn test_failed_close_records_partial_state() {
        let h = harness().await;
        h.hedge
            .inject_order_faults([GatewayError::Rejected {
                code: None,
                message: "reduce-only rejected".into(),
            }])
            .await;

        let p = h.monitor.close_position(h.position.id).await.unwrap();
        assert_eq!(p.status, HedgeStatus::Error);
        assert_eq!(p.primary.status, LegStatus::Closed);
        assert!(p.hedge.error.is_some());
        assert_eq!(h.hedge.get_positions(None).await.unwrap().len(), 1);

        assert!(matches!(
            h.monitor.close_position(h.position.id).await,
            Err(ArbError::InvalidTransition { .. })
        ));
    }
}
