//! Arb Engine - Main Entry Point
//!
//! Paper-trading session, stored position status and an offline quantity
//! reconciliation helper.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use arb_engine::config::Config;
use arb_engine::events::EventData;
use arb_engine::exchange::{
    canonical_symbol, CredentialProvider, CredentialRef, Credentials, EnvCredentialProvider,
    GatewayRegistry, InstrumentRules, PaperGateway, PositionSide, StaticCredentialProvider, Venue,
};
use arb_engine::persistence::{
    HedgeFilter, PositionStore, SqlitePositionStore, TriangularFilter,
};
use arb_engine::strategy::{reconcile_quantity, ExecuteOpportunityRequest, GraduatedEntryRequest};
use arb_engine::{ArbError, Controller};

const PAPER_USER: &str = "paper";

/// Arb Engine CLI
#[derive(Parser)]
#[command(name = "arb-engine")]
#[command(version, about = "Cross-exchange hedge and triangular arbitrage engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paper-trading session against simulated exchanges
    Run {
        /// Stop after this many seconds (0 = until Ctrl-C)
        #[arg(short, long, default_value = "0")]
        duration: u64,

        /// Open a graduated-entry BTC hedge of this size on start
        #[arg(long)]
        hedge_qty: Option<Decimal>,

        /// Slices for the hedge entry
        #[arg(long, default_value = "5")]
        parts: u32,

        /// Execute the best executable triangle whenever one appears
        #[arg(long)]
        auto_execute: bool,

        /// Resolve API keys from `{VENUE}_API_KEY` / `{VENUE}_API_SECRET`
        #[arg(long)]
        env_credentials: bool,
    },

    /// Show stored positions
    Status {
        /// Path to SQLite database (defaults to the configured path)
        #[arg(short, long)]
        db: Option<String>,

        /// Show per-leg details
        #[arg(short, long)]
        verbose: bool,
    },

    /// Check whether a hedge size is tradeable on two exchanges
    CheckQuantity {
        /// Requested total size in base asset
        #[arg(short, long)]
        quantity: Decimal,

        #[arg(short, long, default_value = "1")]
        parts: u32,

        /// Quantity step on the first exchange
        #[arg(long)]
        step_a: Decimal,

        /// Quantity step on the second exchange
        #[arg(long)]
        step_b: Decimal,

        #[arg(long, default_value = "0")]
        min_a: Decimal,

        #[arg(long, default_value = "0")]
        min_b: Decimal,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::CheckQuantity {
            quantity,
            parts,
            step_a,
            step_b,
            min_a,
            min_b,
        } => check_quantity(quantity, parts, (step_a, min_a), (step_b, min_b)),
        Commands::Status { db, verbose } => {
            let config = Config::load()?;
            show_status(db.as_deref().unwrap_or(&config.persistence.db_path), verbose).await
        }
        Commands::Run {
            duration,
            hedge_qty,
            parts,
            auto_execute,
            env_credentials,
        } => {
            init_logging()?;
            let config = Config::load()?;
            config.validate()?;
            let options = RunOptions {
                duration,
                hedge_qty,
                parts,
                auto_execute,
                env_credentials,
            };
            run_paper(config, options).await
        }
    }
}

struct RunOptions {
    duration: u64,
    hedge_qty: Option<Decimal>,
    parts: u32,
    auto_execute: bool,
    env_credentials: bool,
}

async fn run_paper(config: Config, options: RunOptions) -> Result<()> {
    let RunOptions {
        duration,
        hedge_qty,
        parts,
        auto_execute,
        env_credentials,
    } = options;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %config.persistence.db_path,
        symbols = config.triangular.symbols.len(),
        "Arb engine paper session starting"
    );

    let store = SqlitePositionStore::open(&config.persistence.db_path)
        .context("Failed to open position store")?;

    let venues = [Venue::Binance, Venue::Bybit, Venue::Bingx];
    let mut registry = GatewayRegistry::new();
    let mut credentials = StaticCredentialProvider::new();
    let mut gateways = Vec::new();
    for venue in venues {
        let gateway = Arc::new(PaperGateway::new(venue).with_fee_rate(config.triangular.fee_rate));
        seed_market(&gateway, &config.triangular.symbols).await;
        registry.insert(gateway.clone());
        credentials = credentials.with(
            CredentialRef::new(PAPER_USER, venue),
            Credentials {
                api_key: format!("paper-{venue}"),
                api_secret: "paper".to_string(),
                passphrase: None,
                active: true,
            },
        );
        gateways.push(gateway);
    }

    let provider: Arc<dyn CredentialProvider> = if env_credentials {
        info!("Resolving API credentials from the environment");
        Arc::new(EnvCredentialProvider)
    } else {
        Arc::new(credentials)
    };
    let controller = Controller::new(&config, registry, Arc::new(store), provider);
    let shutdown = CancellationToken::new();

    let monitor = controller.spawn_monitor();
    let feed = tokio::spawn(price_feed(gateways, shutdown.child_token()));
    let logger = tokio::spawn(log_events(controller.clone(), shutdown.child_token()));

    controller
        .start_scanner(Venue::Binance, PAPER_USER)
        .await
        .context("Failed to start scanner")?;

    if let Some(quantity) = hedge_qty {
        let position = controller
            .start_hedge(GraduatedEntryRequest {
                symbol: "BTC/USDT".to_string(),
                primary_exchange: Venue::Bybit,
                hedge_exchange: Venue::Bingx,
                primary_side: PositionSide::Long,
                leverage: 5,
                quantity,
                parts,
                delay_ms: 1_000,
            })
            .await;
        match position {
            Ok(p) => info!(position_id = %p.id, "Hedge entry started"),
            Err(ArbError::QuantityRejected { reason, suggestions, .. }) => {
                warn!(%reason, ?suggestions, "Hedge size rejected")
            }
            Err(e) => error!(error = %e, "Hedge entry refused"),
        }
    }

    let trader = auto_execute.then(|| tokio::spawn(auto_trade(controller.clone(), shutdown.child_token())));

    let ctrl_c = tokio::signal::ctrl_c();
    if duration > 0 {
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl-C"),
            _ = tokio::time::sleep(Duration::from_secs(duration)) => info!("Session duration reached"),
        }
    } else {
        ctrl_c.await.ok();
        info!("Received Ctrl-C");
    }

    shutdown.cancel();
    controller.shutdown().await;
    for task in [Some(monitor), Some(feed), Some(logger), trader].into_iter().flatten() {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    let stats = controller.event_stats();
    info!(
        opportunities = stats.opportunity,
        positions = stats.position,
        errors = stats.error,
        "Arb engine shutdown complete"
    );
    Ok(())
}

/// Reference prices for the paper market.
fn reference_price(symbol: &str) -> Option<Decimal> {
    Some(match symbol {
        "BTC/USDT" => dec!(50000),
        "ETH/USDT" => dec!(2500),
        "ETH/BTC" => dec!(0.05),
        "BNB/USDT" => dec!(600),
        "BNB/BTC" => dec!(0.012),
        "BNB/ETH" => dec!(0.24),
        "SOL/USDT" => dec!(150),
        "SOL/BTC" => dec!(0.003),
        "SOL/ETH" => dec!(0.06),
        _ => return None,
    })
}

fn paper_rules(price: Decimal) -> InstrumentRules {
    let step = if price >= dec!(1000) {
        dec!(0.00001)
    } else if price >= Decimal::ONE {
        dec!(0.001)
    } else {
        dec!(0.0001)
    };
    InstrumentRules {
        min_qty: step,
        max_qty: dec!(1000000),
        qty_step: step,
        price_precision: 8,
        qty_precision: step.scale(),
    }
}

async fn seed_market(gateway: &PaperGateway, symbols: &[String]) {
    for symbol in symbols {
        let Some(canonical) = canonical_symbol(symbol) else {
            warn!(%symbol, "Skipping unparseable symbol");
            continue;
        };
        let Some(price) = reference_price(&canonical) else {
            warn!(symbol = %canonical, "No paper reference price, symbol not listed");
            continue;
        };
        gateway.list_symbol(&canonical, paper_rules(price)).await;
        set_quote(gateway, &canonical, price).await;
    }
}

async fn set_quote(gateway: &PaperGateway, symbol: &str, mid: Decimal) {
    let half_spread = mid * dec!(0.00005);
    gateway
        .set_price(symbol, mid - half_spread, mid + half_spread, mid)
        .await;
}

/// Deterministic drift so that triangles occasionally misprice.
async fn price_feed(gateways: Vec<Arc<PaperGateway>>, token: CancellationToken) {
    // Basis-point offsets cycled per symbol
    const DRIFT_BPS: [i64; 8] = [0, 12, 35, 8, -20, -45, -10, 5];
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    let mut step: usize = 0;
    let symbols = ["ETH/USDT", "BNB/USDT", "SOL/USDT", "BTC/USDT"];

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        step = step.wrapping_add(1);
        for (i, symbol) in symbols.iter().enumerate() {
            let Some(base) = reference_price(symbol) else { continue };
            let bps = DRIFT_BPS[(step + i * 3) % DRIFT_BPS.len()];
            let mid = base * (Decimal::ONE + Decimal::new(bps, 4));
            for gateway in &gateways {
                set_quote(gateway, symbol, mid).await;
            }
        }
        if step % 16 == 0 {
            for gateway in &gateways {
                gateway.apply_funding("BTC/USDT", dec!(0.0001)).await;
            }
        }
    }
    debug!("Price feed stopped");
}

async fn log_events(controller: Controller, token: CancellationToken) {
    let mut events = controller.subscribe();
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        match &event.data {
            EventData::Error(report) => {
                warn!(code = %report.code, entity = ?report.entity_id, "{}", report.message)
            }
            _ => debug!(event = %event.to_json(), "Event"),
        }
    }
}

async fn auto_trade(controller: Controller, token: CancellationToken) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(best) = controller
            .opportunities(None)
            .into_iter()
            .find(|o| o.is_executable)
        else {
            continue;
        };
        match controller
            .execute_opportunity(ExecuteOpportunityRequest {
                opportunity_id: best.id,
                position_size: None,
            })
            .await
        {
            Ok(p) => info!(
                position_id = %p.id,
                path = %p.path,
                status = %p.status,
                profit = %p.actual_profit,
                "Auto-executed triangle"
            ),
            Err(e) => debug!(error = %e, "Opportunity not executed"),
        }
    }
}

fn check_quantity(
    quantity: Decimal,
    parts: u32,
    (step_a, min_a): (Decimal, Decimal),
    (step_b, min_b): (Decimal, Decimal),
) -> Result<()> {
    let rules = |step: Decimal, min: Decimal| InstrumentRules {
        min_qty: min,
        max_qty: Decimal::MAX,
        qty_step: step,
        price_precision: 8,
        qty_precision: step.scale(),
    };
    match reconcile_quantity(&rules(step_a, min_a), &rules(step_b, min_b), quantity, parts) {
        Ok(r) => {
            println!("✅ {} is tradeable on both exchanges", r.quantity);
            println!("   ├─ Parts:        {}", r.parts);
            println!("   ├─ Per part:     {}", r.per_part_quantity);
            println!("   └─ Common step:  {}", r.step);
        }
        Err(ArbError::QuantityRejected {
            reason,
            suggestions,
            ..
        }) => {
            println!("❌ {quantity} rejected: {reason}");
            for s in suggestions {
                println!("   ├─ Try: {s}");
            }
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

async fn show_status(db_path: &str, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              ARB ENGINE STATUS                             ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    if !Path::new(db_path).exists() {
        println!("\n❌ Database not found: {}", db_path);
        println!("   No session has run yet, or the database path is incorrect.");
        return Ok(());
    }
    let store = SqlitePositionStore::open(db_path)?;

    let hedges = store.find_hedges(&HedgeFilter::default()).await?;
    println!("\n🔀 Hedge Positions ({})", hedges.len());
    for p in &hedges {
        println!("   ┌─ {} {} [{}]", p.id, p.symbol, p.status);
        println!(
            "   ├─ {} {} {} / {} {} {}",
            p.primary.exchange,
            p.primary.side,
            p.primary.filled_quantity,
            p.hedge.exchange,
            p.hedge.side,
            p.hedge.filled_quantity
        );
        println!(
            "   ├─ PnL ${:.4}  Funding ${:.4}  Fees ${:.4}  Net ${:.4}",
            p.unrealized_pnl,
            p.funding_accrued,
            p.trading_fees,
            p.net_pnl()
        );
        if let Some(leg) = p.liquidated_leg {
            println!("   ├─ Liquidated leg: {}", leg);
        }
        if let Some(err) = &p.error {
            println!("   ├─ Error: {}", err);
        }
        println!("   └─ Parts {}/{}", p.current_part, p.parts);
        if verbose {
            for leg in p.legs() {
                println!(
                    "       {} @ {}: entry {} mark {} liq {} (proximity {})",
                    leg.role,
                    leg.exchange,
                    leg.entry_price,
                    leg.current_price,
                    leg.liquidation_price,
                    leg.liquidation_proximity
                );
            }
        }
    }

    let triangles = store.find_triangular(&TriangularFilter::default()).await?;
    println!("\n🔺 Triangular Positions ({})", triangles.len());
    for p in &triangles {
        println!("   ┌─ {} {} on {} [{}]", p.id, p.path, p.exchange, p.status);
        println!(
            "   ├─ {} -> {} (expected {:+.4}%, actual {:+.4}%)",
            p.initial_amount, p.final_amount, p.expected_profit_pct, p.actual_profit_pct
        );
        if let Some((asset, amount)) = &p.stranded_asset {
            println!("   ├─ Holding {} {}", amount, asset);
        }
        println!("   └─ Created {}", p.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        if verbose {
            for leg in &p.legs {
                println!(
                    "       leg {} {} {} {:?}: qty {} @ {} (slippage {}, fee {} {})",
                    leg.leg_number,
                    leg.side,
                    leg.symbol,
                    leg.status,
                    leg.filled_quantity,
                    leg.actual_price,
                    leg.slippage,
                    leg.fee,
                    leg.fee_asset.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}

/// Initialize logging with file and console output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "arb-engine.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Keep the writer guard alive for the program duration
    Box::leak(Box::new(guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("arb_engine=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    Ok(())
}
