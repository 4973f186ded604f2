//! Triangular opportunity scanner.
//!
//! One scanner per exchange keeps a live price graph of the configured
//! symbol universe and rescores every triangle touched by a price tick.
//! Each scanner runs as its own task with its own cancellation token, so
//! stopping one exchange never disturbs another.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use dashmap::mapref::entry::Entry;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::opportunity_book::OpportunityBook;
use super::triangle::{evaluate, PriceGraph, TriangleParams, TriangleRoute};
use crate::config::TriangularConfig;
use crate::error::{ArbError, GatewayError, Result};
use crate::events::EventBroadcaster;
use crate::exchange::{
    call_with_retry, canonical_symbol, CredentialProvider, CredentialRef, ExchangeGateway,
    GatewayRegistry, PairPrice, PriceStream, RetryPolicy, Venue,
};
use crate::position::{TriangleKey, TriangularOpportunity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScannerStatus {
    Stopped,
    Scanning,
    Error,
}

impl fmt::Display for ScannerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScannerStatus::Stopped => write!(f, "stopped"),
            ScannerStatus::Scanning => write!(f, "scanning"),
            ScannerStatus::Error => write!(f, "error"),
        }
    }
}

/// Observable state of one exchange's scanner.
#[derive(Debug, Clone, Serialize)]
pub struct ScannerInfo {
    pub exchange: Venue,
    pub status: ScannerStatus,
    pub user_id: String,
    pub symbols: usize,
    pub triangles: usize,
    pub ticks: u64,
    pub opportunities: u64,
    pub started_at: DateTime<Utc>,
    pub last_tick_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Outcome of rescoring the triangles touched by one tick.
#[derive(Debug, Default)]
pub struct Rescore {
    /// Still profitable, best first
    pub found: Vec<TriangularOpportunity>,
    /// No longer profitable or no longer priced
    pub closed: Vec<TriangleKey>,
}

/// Price graph plus scoring for one exchange. Pure state, no I/O.
pub struct TriangularScanner {
    exchange: Venue,
    params: TriangleParams,
    graph: PriceGraph,
    routes: Vec<TriangleRoute>,
}

impl TriangularScanner {
    pub fn new(exchange: Venue, params: TriangleParams) -> Self {
        Self {
            exchange,
            params,
            graph: PriceGraph::new(),
            routes: Vec::new(),
        }
    }

    /// Seed the graph and enumerate cycles from `start_asset`.
    pub fn seed(&mut self, prices: impl IntoIterator<Item = PairPrice>, start_asset: &str) {
        for price in prices {
            self.graph.update(price);
        }
        self.routes = self.graph.routes_from(start_asset);
    }

    pub fn triangles(&self) -> usize {
        self.routes.len()
    }

    pub fn symbols(&self) -> usize {
        self.graph.symbol_count()
    }

    /// Score every triangle. Only profitable ones are returned.
    pub fn scan_all(&self, now: DateTime<Utc>) -> Vec<TriangularOpportunity> {
        self.score(self.routes.iter(), now).found
    }

    /// Apply one tick and rescore the triangles that trade its symbol.
    pub fn on_price(&mut self, price: PairPrice, now: DateTime<Utc>) -> Rescore {
        let symbol = price.symbol.clone();
        if !self.graph.update(price) {
            return Rescore::default();
        }
        self.score(self.routes.iter().filter(|r| r.uses(&symbol)), now)
    }

    fn score<'a>(
        &self,
        routes: impl Iterator<Item = &'a TriangleRoute>,
        now: DateTime<Utc>,
    ) -> Rescore {
        let mut rescore = Rescore::default();
        for route in routes {
            match evaluate(self.exchange, route, &self.graph, &self.params, now) {
                Some(o) if o.realistic_profit_pct > Decimal::ZERO => rescore.found.push(o),
                _ => rescore.closed.push(TriangleKey::new(self.exchange, &route.path)),
            }
        }
        rescore
            .found
            .sort_by(|a, b| b.realistic_profit_pct.cmp(&a.realistic_profit_pct));
        rescore
    }
}

struct ScannerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Per-exchange slot, claimed before the first await of a start.
enum ScannerSlot {
    Starting,
    Running(ScannerHandle),
}

/// Starts, stops and tracks scanners, one per exchange.
pub struct ScannerManager {
    registry: GatewayRegistry,
    credentials: Arc<dyn CredentialProvider>,
    events: EventBroadcaster,
    book: Arc<OpportunityBook>,
    config: TriangularConfig,
    policy: RetryPolicy,
    handles: DashMap<Venue, ScannerSlot>,
    info: Arc<DashMap<Venue, ScannerInfo>>,
}

impl ScannerManager {
    pub fn new(
        registry: GatewayRegistry,
        credentials: Arc<dyn CredentialProvider>,
        events: EventBroadcaster,
        book: Arc<OpportunityBook>,
        config: TriangularConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            credentials,
            events,
            book,
            config,
            policy,
            handles: DashMap::new(),
            info: Arc::new(DashMap::new()),
        }
    }

    /// Start scanning `exchange` with the given credential.
    pub async fn start(&self, exchange: Venue, credential: &CredentialRef) -> Result<ScannerInfo> {
        if credential.venue != exchange {
            return Err(ArbError::Validation(format!(
                "credential is for {}, not {exchange}",
                credential.venue
            )));
        }
        match self.handles.entry(exchange) {
            Entry::Occupied(_) => {
                return Err(ArbError::Busy(format!("{exchange} scanner already running")))
            }
            Entry::Vacant(slot) => {
                slot.insert(ScannerSlot::Starting);
            }
        }

        let launched = self.launch(exchange, credential).await;
        if launched.is_err() {
            self.handles
                .remove_if(&exchange, |_, slot| matches!(slot, ScannerSlot::Starting));
        }
        launched
    }

    async fn launch(&self, exchange: Venue, credential: &CredentialRef) -> Result<ScannerInfo> {
        match self.credentials.resolve(credential).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(ArbError::Validation(format!(
                    "no active {exchange} credentials for user {}",
                    credential.user_id
                )))
            }
            Err(e) => {
                return Err(ArbError::Validation(format!("credential lookup failed: {e:#}")))
            }
        }
        let gateway = self
            .registry
            .get(exchange)
            .ok_or_else(|| ArbError::Validation(format!("no gateway configured for {exchange}")))?;

        let (scanner, streams) = self.prepare(exchange, gateway.as_ref()).await?;

        let info = ScannerInfo {
            exchange,
            status: ScannerStatus::Scanning,
            user_id: credential.user_id.clone(),
            symbols: scanner.symbols(),
            triangles: scanner.triangles(),
            ticks: 0,
            opportunities: 0,
            started_at: Utc::now(),
            last_tick_at: None,
            error: None,
        };
        self.info.insert(exchange, info.clone());

        let token = CancellationToken::new();
        let task = tokio::spawn(scan_loop(
            scanner,
            streams,
            token.clone(),
            Duration::from_millis(self.config.opportunity_ttl_ms.max(1)),
            self.info.clone(),
            self.book.clone(),
            self.events.clone(),
        ));
        self.handles
            .insert(exchange, ScannerSlot::Running(ScannerHandle { token, task }));

        info!(%exchange, symbols = info.symbols, triangles = info.triangles, "Scanner started");
        self.events.scanner(exchange, ScannerStatus::Scanning, None);
        Ok(info)
    }

    /// Stop `exchange`'s scanner and forget its opportunities.
    pub async fn stop(&self, exchange: Venue) -> Result<ScannerInfo> {
        let handle = match self
            .handles
            .remove_if(&exchange, |_, slot| matches!(slot, ScannerSlot::Running(_)))
        {
            Some((_, ScannerSlot::Running(handle))) => handle,
            _ if self.handles.contains_key(&exchange) => {
                return Err(ArbError::Busy(format!("{exchange} scanner is still starting")))
            }
            _ => return Err(ArbError::NotFound(format!("{exchange} scanner"))),
        };
        handle.token.cancel();
        if let Err(e) = handle.task.await {
            warn!(%exchange, error = %e, "Scanner task ended abnormally");
        }

        self.book.clear_exchange(exchange);
        let info = match self.info.get_mut(&exchange) {
            Some(mut info) => {
                info.status = ScannerStatus::Stopped;
                info.clone()
            }
            None => return Err(ArbError::NotFound(format!("{exchange} scanner"))),
        };
        info!(%exchange, ticks = info.ticks, opportunities = info.opportunities, "Scanner stopped");
        self.events.scanner(exchange, ScannerStatus::Stopped, None);
        Ok(info)
    }

    pub async fn stop_all(&self) {
        let running: Vec<Venue> = self.handles.iter().map(|h| *h.key()).collect();
        for exchange in running {
            if let Err(e) = self.stop(exchange).await {
                warn!(%exchange, error = %e, "Failed to stop scanner");
            }
        }
    }

    pub fn status(&self, exchange: Venue) -> Option<ScannerInfo> {
        self.info.get(&exchange).map(|i| i.clone())
    }

    pub fn list(&self) -> Vec<ScannerInfo> {
        let mut all: Vec<ScannerInfo> = self.info.iter().map(|i| i.clone()).collect();
        all.sort_by_key(|i| i.exchange);
        all
    }

    pub fn book(&self) -> &Arc<OpportunityBook> {
        &self.book
    }

    /// Seed prices and open one stream per symbol.
    async fn prepare(
        &self,
        exchange: Venue,
        gateway: &dyn ExchangeGateway,
    ) -> Result<(TriangularScanner, Vec<PriceStream>)> {
        let mut prices = Vec::new();
        for raw in &self.config.symbols {
            let Some(symbol) = canonical_symbol(raw) else {
                warn!(%exchange, symbol = %raw, "Skipping unparseable symbol");
                continue;
            };
            match call_with_retry(&self.policy, "get_market_price", || {
                gateway.get_market_price(&symbol)
            })
            .await
            {
                Ok(price) => prices.push(price),
                Err(GatewayError::UnknownSymbol(_)) => {
                    debug!(%exchange, %symbol, "Symbol not listed, skipping")
                }
                Err(e) => return Err(ArbError::exchange(exchange, "get_market_price", e)),
            }
        }

        let mut scanner = TriangularScanner::new(exchange, TriangleParams::from(&self.config));
        let symbols: Vec<String> = prices.iter().map(|p| p.symbol.clone()).collect();
        scanner.seed(prices, &self.config.start_asset);
        if scanner.triangles() == 0 {
            return Err(ArbError::Validation(format!(
                "no {} triangles available on {exchange}",
                self.config.start_asset
            )));
        }

        let mut streams = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let stream = gateway
                .subscribe_price_stream(symbol)
                .await
                .map_err(|e| ArbError::exchange(exchange, "subscribe_price_stream", e))?;
            streams.push(stream);
        }
        Ok((scanner, streams))
    }
}

async fn scan_loop(
    mut scanner: TriangularScanner,
    streams: Vec<PriceStream>,
    token: CancellationToken,
    ttl: Duration,
    info: Arc<DashMap<Venue, ScannerInfo>>,
    book: Arc<OpportunityBook>,
    events: EventBroadcaster,
) {
    let exchange = scanner.exchange;
    let publish = |found: Vec<TriangularOpportunity>| {
        let count = found.len() as u64;
        for opportunity in found {
            events.opportunity(&opportunity);
            book.record(opportunity);
        }
        count
    };

    let initial = publish(scanner.scan_all(Utc::now()));
    if let Some(mut i) = info.get_mut(&exchange) {
        i.opportunities += initial;
    }

    // Fan all subscriptions into one channel
    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscriptions: Vec<CancellationToken> = streams.iter().map(|s| s.token()).collect();
    for mut stream in streams {
        let tx = tx.clone();
        let token = token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    price = stream.recv() => match price {
                        Some(price) => {
                            if tx.send(price).is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }
    drop(tx);

    let mut prune = tokio::time::interval(ttl);
    prune.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = prune.tick() => {
                let max_age = chrono::Duration::milliseconds(ttl.as_millis() as i64);
                let expired = book.prune_exchange(exchange, max_age, Utc::now());
                if expired > 0 {
                    debug!(%exchange, expired, "Pruned expired opportunities");
                }
            }
            price = rx.recv() => {
                let Some(price) = price else {
                    let message = "all price streams closed".to_string();
                    error!(%exchange, "Scanner lost its price feed");
                    if let Some(mut i) = info.get_mut(&exchange) {
                        i.status = ScannerStatus::Error;
                        i.error = Some(message.clone());
                    }
                    events.scanner(exchange, ScannerStatus::Error, Some(message));
                    break;
                };
                let now = Utc::now();
                let rescore = scanner.on_price(price, now);
                for key in &rescore.closed {
                    if book.forget(key).is_some() {
                        debug!(%exchange, ?key, "Opportunity closed");
                    }
                }
                let found = publish(rescore.found);
                if let Some(mut i) = info.get_mut(&exchange) {
                    i.ticks += 1;
                    i.opportunities += found;
                    i.last_tick_at = Some(now);
                }
            }
        }
    }
    for subscription in subscriptions {
        subscription.cancel();
    }
    debug!(%exchange, "Scanner loop exited");
}
