//! Control surface exposed to callers (HTTP layer, CLI, tests).
//!
//! Owns one instance of every component, wired to the same gateways,
//! store, lock table and event stream. Every operation returns the
//! resulting entity or a structured [`ArbError`].

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ArbError, Result};
use crate::events::{EventBroadcaster, EventStats, EventSubscriber};
use crate::exchange::{CredentialProvider, CredentialRef, GatewayRegistry, RetryPolicy, Venue};
use crate::persistence::{HedgeFilter, PositionStore, TriangularFilter};
use crate::position::{HedgePosition, PositionLocks, TriangularOpportunity, TriangularPosition};
use crate::risk::{PositionMonitor, TickSummary};
use crate::strategy::{
    ExecuteOpportunityRequest, GraduatedEntryExecutor, GraduatedEntryRequest, OpportunityBook,
    QuantityNormalizer, ScannerInfo, ScannerManager, TriangularExecutor,
};

#[derive(Clone)]
pub struct Controller {
    store: Arc<dyn PositionStore>,
    events: EventBroadcaster,
    graduated: GraduatedEntryExecutor,
    scanners: Arc<ScannerManager>,
    triangular: TriangularExecutor,
    monitor: Arc<PositionMonitor>,
    shutdown: CancellationToken,
}

impl Controller {
    pub fn new(
        config: &Config,
        registry: GatewayRegistry,
        store: Arc<dyn PositionStore>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config.gateway);
        let events = EventBroadcaster::new(config.events.capacity);
        let locks = PositionLocks::new();
        let normalizer = Arc::new(QuantityNormalizer::new(registry.clone(), policy));
        let book = Arc::new(OpportunityBook::new());

        let graduated = GraduatedEntryExecutor::new(
            registry.clone(),
            normalizer.clone(),
            store.clone(),
            events.clone(),
            locks.clone(),
            config.graduated.clone(),
            policy,
        );
        let scanners = Arc::new(ScannerManager::new(
            registry.clone(),
            credentials,
            events.clone(),
            book.clone(),
            config.triangular.clone(),
            policy,
        ));
        let triangular = TriangularExecutor::new(
            registry.clone(),
            normalizer,
            store.clone(),
            events.clone(),
            book,
            config.triangular.clone(),
            policy,
        );
        let monitor = Arc::new(PositionMonitor::new(
            registry,
            store.clone(),
            events.clone(),
            locks,
            config.monitor.clone(),
            policy,
        ));

        Self {
            store,
            events,
            graduated,
            scanners,
            triangular,
            monitor,
            shutdown: CancellationToken::new(),
        }
    }

    // Hedge positions

    /// Start a graduated-entry hedge; returns the `INITIALIZING` position.
    pub async fn start_hedge(&self, request: GraduatedEntryRequest) -> Result<HedgePosition> {
        self.graduated.start(request).await
    }

    pub async fn cancel_hedge(&self, id: Uuid) -> Result<HedgePosition> {
        self.graduated.cancel(id).await
    }

    pub async fn close_hedge(&self, id: Uuid) -> Result<HedgePosition> {
        self.monitor.close_position(id).await
    }

    pub async fn set_monitoring(&self, id: Uuid, enabled: bool) -> Result<HedgePosition> {
        self.monitor.set_monitoring(id, enabled).await
    }

    pub async fn reconcile_hedge(&self, id: Uuid) -> Result<HedgePosition> {
        self.monitor.reconcile_now(id).await
    }

    pub async fn hedge(&self, id: Uuid) -> Result<HedgePosition> {
        self.store
            .get_hedge(id)
            .await?
            .ok_or_else(|| ArbError::NotFound(format!("hedge position {id}")))
    }

    pub async fn hedges(&self, filter: &HedgeFilter) -> Result<Vec<HedgePosition>> {
        self.store.find_hedges(filter).await
    }

    // Triangular arbitrage

    pub async fn start_scanner(&self, exchange: Venue, user_id: &str) -> Result<ScannerInfo> {
        self.scanners
            .start(exchange, &CredentialRef::new(user_id, exchange))
            .await
    }

    pub async fn stop_scanner(&self, exchange: Venue) -> Result<ScannerInfo> {
        self.scanners.stop(exchange).await
    }

    pub fn scanners(&self) -> Vec<ScannerInfo> {
        self.scanners.list()
    }

    /// Current opportunities, best first.
    pub fn opportunities(&self, exchange: Option<Venue>) -> Vec<TriangularOpportunity> {
        self.scanners.book().ranked(exchange)
    }

    pub async fn execute_opportunity(
        &self,
        request: ExecuteOpportunityRequest,
    ) -> Result<TriangularPosition> {
        self.triangular.execute(request).await
    }

    pub async fn cancel_triangular(&self, id: Uuid) -> Result<TriangularPosition> {
        self.triangular.cancel(id).await
    }

    pub async fn delete_triangular(&self, id: Uuid) -> Result<()> {
        self.triangular.delete(id).await
    }

    pub async fn triangular_position(&self, id: Uuid) -> Result<TriangularPosition> {
        self.store
            .get_triangular(id)
            .await?
            .ok_or_else(|| ArbError::NotFound(format!("triangular position {id}")))
    }

    pub async fn triangular_positions(
        &self,
        filter: &TriangularFilter,
    ) -> Result<Vec<TriangularPosition>> {
        self.store.find_triangular(filter).await
    }

    // Events and lifecycle

    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    pub fn event_stats(&self) -> EventStats {
        self.events.stats()
    }

    /// Run one reconciliation tick now.
    pub async fn reconcile_all(&self) -> Result<TickSummary> {
        self.monitor.tick().await
    }

    /// Start the periodic monitor; it stops on [`Controller::shutdown`].
    pub fn spawn_monitor(&self) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let token = self.shutdown.child_token();
        tokio::spawn(async move { monitor.run(token).await })
    }

    pub async fn shutdown(&self) {
        info!("Shutting down controller");
        self.shutdown.cancel();
        self.scanners.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, EventKind};
    use crate::exchange::{
        Credentials, InstrumentRules, PaperGateway, PositionSide, StaticCredentialProvider,
    };
    use crate::persistence::MemoryPositionStore;
    use crate::position::{HedgeStatus, TriangularStatus};
    use crate::strategy::ScannerStatus;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    async fn controller() -> (Controller, Arc<PaperGateway>, Arc<PaperGateway>) {
        let spot_rules = |step| InstrumentRules {
            min_qty: step,
            max_qty: dec!(10000),
            qty_step: step,
            price_precision: 8,
            qty_precision: 5,
        };
        let binance = Arc::new(PaperGateway::new(Venue::Binance));
        binance.list_symbol("BTC/USDT", spot_rules(dec!(0.00001))).await;
        binance.list_symbol("ETH/BTC", spot_rules(dec!(0.0001))).await;
        binance.list_symbol("ETH/USDT", spot_rules(dec!(0.0001))).await;
        binance.set_flat_price("BTC/USDT", dec!(50000)).await;
        binance.set_flat_price("ETH/BTC", dec!(0.05)).await;
        binance.set_flat_price("ETH/USDT", dec!(2550)).await;

        let bybit = Arc::new(PaperGateway::new(Venue::Bybit));
        bybit.list_symbol("BTC/USDT", spot_rules(dec!(0.001))).await;
        bybit.set_flat_price("BTC/USDT", dec!(50000)).await;

        let credentials = StaticCredentialProvider::new().with(
            CredentialRef::new("ops", Venue::Binance),
            Credentials {
                api_key: "key".into(),
                api_secret: "secret".into(),
                passphrase: None,
                active: true,
            },
        );
        let registry = GatewayRegistry::new()
            .with(binance.clone())
            .with(bybit.clone());
        let mut config = Config::default();
        config.triangular.symbols = vec!["BTC/USDT".into(), "ETH/BTC".into(), "ETH/USDT".into()];
        let controller = Controller::new(
            &config,
            registry,
            Arc::new(MemoryPositionStore::new()),
            Arc::new(credentials),
        );
        (controller, binance, bybit)
    }

    #[tokio::test]
    async fn test_scan_then_execute_best_opportunity() {
        let (controller, _binance, _) = controller().await;
        let mut events = controller.subscribe();

        let info = controller.start_scanner(Venue::Binance, "ops").await.unwrap();
        assert_eq!(info.status, ScannerStatus::Scanning);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let best = controller
            .opportunities(Some(Venue::Binance))
            .into_iter()
            .next()
            .unwrap();
        let position = controller
            .execute_opportunity(ExecuteOpportunityRequest {
                opportunity_id: best.id,
                position_size: None,
            })
            .await
            .unwrap();
        assert_eq!(position.status, TriangularStatus::Completed);
        assert_eq!(
            controller.triangular_position(position.id).await.unwrap().status,
            TriangularStatus::Completed
        );

        controller.stop_scanner(Venue::Binance).await.unwrap();
        assert_eq!(controller.scanners()[0].status, ScannerStatus::Stopped);

        let mut kinds = Vec::new();
        while let Some(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&EventKind::Scanner));
        assert!(kinds.contains(&EventKind::Opportunity));
        assert!(kinds.contains(&EventKind::Position));
    }

    #[tokio::test]
    async fn test_scanner_needs_credentials() {
        let (controller, _, _) = controller().await;
        let err = controller
            .start_scanner(Venue::Binance, "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, ArbError::Validation(_)));
        assert!(controller.scanners().is_empty());
    }

    #[tokio::test]
    async fn test_hedge_lifecycle_through_controller() {
        let (controller, _, _) = controller().await;
        let created = controller
            .start_hedge(GraduatedEntryRequest {
                symbol: "BTCUSDT".into(),
                primary_exchange: Venue::Binance,
                hedge_exchange: Venue::Bybit,
                primary_side: PositionSide::Short,
                leverage: 3,
                quantity: dec!(0.01),
                parts: 1,
                delay_ms: 100,
            })
            .await
            .unwrap();
        assert_eq!(created.status, HedgeStatus::Initializing);

        let mut active = None;
        for _ in 0..100 {
            let p = controller.hedge(created.id).await.unwrap();
            if p.status == HedgeStatus::Active {
                active = Some(p);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let active = active.unwrap();
        assert!(active.monitoring_enabled);

        let summary = controller.reconcile_all().await.unwrap();
        assert_eq!(summary.checked, 1);

        let toggled = controller.set_monitoring(active.id, false).await.unwrap();
        assert!(!toggled.monitoring_enabled);
        assert_eq!(toggled.status, HedgeStatus::Active);

        let closed = controller.close_hedge(active.id).await.unwrap();
        assert_eq!(closed.status, HedgeStatus::Completed);
        assert_eq!(
            controller
                .hedges(&HedgeFilter::status(HedgeStatus::Completed))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_errors_are_published() {
        let (controller, _, bybit) = controller().await;
        let mut events = controller.subscribe();
        bybit
            .inject_order_faults([crate::error::GatewayError::Rejected {
                code: None,
                message: "account suspended".into(),
            }])
            .await;

        let created = controller
            .start_hedge(GraduatedEntryRequest {
                symbol: "BTC/USDT".into(),
                primary_exchange: Venue::Binance,
                hedge_exchange: Venue::Bybit,
                primary_side: PositionSide::Long,
                leverage: 2,
                quantity: dec!(0.01),
                parts: 1,
                delay_ms: 100,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let p = controller.hedge(created.id).await.unwrap();
        assert_eq!(p.status, HedgeStatus::Error);
        let mut saw_error = false;
        while let Some(event) = events.try_recv() {
            if let EventData::Error(report) = event.data {
                assert_eq!(report.code, "PARTIAL_EXECUTION");
                saw_error = true;
            }
        }
        assert!(saw_error);
        controller.shutdown().await;
    }
}
