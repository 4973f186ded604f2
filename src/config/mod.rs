//! Configuration management for the arbitrage engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Timeouts and retry budget for exchange calls
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Graduated-entry hedge limits
    #[serde(default)]
    pub graduated: GraduatedConfig,
    /// Triangular scanner and execution parameters
    #[serde(default)]
    pub triangular: TriangularConfig,
    /// Position monitor schedule and thresholds
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Event broadcaster settings
    #[serde(default)]
    pub events: EventsConfig,
    /// Position store location
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Deadline per gateway call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay; doubles on every retry
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraduatedConfig {
    #[serde(default = "default_min_leverage")]
    pub min_leverage: u32,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
    #[serde(default = "default_min_parts")]
    pub min_parts: u32,
    #[serde(default = "default_max_parts")]
    pub max_parts: u32,
    /// Minimum delay between slices in milliseconds
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Maximum delay between slices in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Enable monitoring automatically once a position becomes active
    #[serde(default = "default_true")]
    pub monitor_on_activate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangularConfig {
    /// Asset every cycle starts and ends in
    #[serde(default = "default_start_asset")]
    pub start_asset: String,
    /// Taker fee per leg as a fraction (0.001 = 0.1%)
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Slippage buffer per leg, in percent
    #[serde(default = "default_slippage_buffer_pct")]
    pub slippage_buffer_pct: Decimal,
    /// Opportunities with more estimated slippage are not executable (percent)
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
    /// Minimum realistic profit for an executable opportunity (percent)
    #[serde(default = "default_min_profit_threshold_pct")]
    pub min_profit_threshold_pct: Decimal,
    /// Opportunities older than this are refused at execution time
    #[serde(default = "default_opportunity_ttl_ms")]
    pub opportunity_ttl_ms: u64,
    /// Position size in start asset when a request does not give one
    #[serde(default = "default_position_size")]
    pub default_position_size: Decimal,
    /// Symbol universe in canonical `BASE/QUOTE` form
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between reconciliation ticks
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
    /// Liquidation proximity (0-1) above which a warning is raised
    #[serde(default = "default_liquidation_warning_ratio")]
    pub liquidation_warning_ratio: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Events buffered per subscriber before the slowest one starts skipping
    #[serde(default = "default_event_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

fn default_min_leverage() -> u32 {
    1
}

fn default_max_leverage() -> u32 {
    125
}

fn default_min_parts() -> u32 {
    1
}

fn default_max_parts() -> u32 {
    20
}

fn default_min_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_start_asset() -> String {
    "USDT".to_string()
}

fn default_fee_rate() -> Decimal {
    Decimal::new(1, 3) // 0.001 (0.1% taker)
}

fn default_slippage_buffer_pct() -> Decimal {
    Decimal::new(2, 2) // 0.02% per leg
}

fn default_max_slippage_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_min_profit_threshold_pct() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

fn default_opportunity_ttl_ms() -> u64 {
    5_000
}

fn default_position_size() -> Decimal {
    Decimal::new(100, 0) // 100 USDT
}

fn default_symbols() -> Vec<String> {
    ["BTC/USDT", "ETH/USDT", "ETH/BTC", "BNB/USDT", "BNB/BTC", "BNB/ETH"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_monitor_interval() -> u64 {
    30
}

fn default_liquidation_warning_ratio() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

fn default_event_capacity() -> usize {
    1024
}

fn default_db_path() -> String {
    "data/arb_engine.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("ARB"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let g = &self.graduated;
        anyhow::ensure!(
            g.min_leverage >= 1 && g.min_leverage <= g.max_leverage,
            "leverage bounds must satisfy 1 <= min_leverage <= max_leverage"
        );
        anyhow::ensure!(
            g.min_parts >= 1 && g.min_parts <= g.max_parts,
            "parts bounds must satisfy 1 <= min_parts <= max_parts"
        );
        anyhow::ensure!(
            g.min_delay_ms <= g.max_delay_ms,
            "min_delay_ms must not exceed max_delay_ms"
        );

        let t = &self.triangular;
        anyhow::ensure!(
            t.fee_rate >= Decimal::ZERO && t.fee_rate < Decimal::ONE,
            "fee_rate must be between 0 and 1"
        );
        anyhow::ensure!(
            t.default_position_size > Decimal::ZERO,
            "default_position_size must be positive"
        );
        anyhow::ensure!(!t.start_asset.is_empty(), "start_asset must be set");

        anyhow::ensure!(
            self.gateway.max_attempts >= 1,
            "gateway.max_attempts must be at least 1"
        );
        anyhow::ensure!(self.gateway.timeout_ms > 0, "gateway.timeout_ms must be positive");
        anyhow::ensure!(self.monitor.interval_secs > 0, "monitor.interval_secs must be positive");
        anyhow::ensure!(self.events.capacity > 0, "events.capacity must be positive");

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for GraduatedConfig {
    fn default() -> Self {
        Self {
            min_leverage: default_min_leverage(),
            max_leverage: default_max_leverage(),
            min_parts: default_min_parts(),
            max_parts: default_max_parts(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            monitor_on_activate: default_true(),
        }
    }
}

impl Default for TriangularConfig {
    fn default() -> Self {
        Self {
            start_asset: default_start_asset(),
            fee_rate: default_fee_rate(),
            slippage_buffer_pct: default_slippage_buffer_pct(),
            max_slippage_pct: default_max_slippage_pct(),
            min_profit_threshold_pct: default_min_profit_threshold_pct(),
            opportunity_ttl_ms: default_opportunity_ttl_ms(),
            default_position_size: default_position_size(),
            symbols: default_symbols(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval(),
            liquidation_warning_ratio: default_liquidation_warning_ratio(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: default_event_capacity(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}
