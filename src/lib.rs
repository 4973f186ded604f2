//! # Arb Engine
//!
//! Execution and supervision of cross-exchange hedges and triangular
//! arbitrage.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Gateway trait, venue types, retry policy, paper gateway
//! - `position`: Hedge and triangular position entities, per-position locks
//! - `strategy`: Quantity normalization, graduated entry, triangle scanning and execution
//! - `risk`: Liquidation proximity and the position monitor
//! - `persistence`: Position store trait with in-memory and SQLite backends
//! - `events`: Broadcast of state changes to subscribers
//! - `controller`: The control surface tying everything together
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod exchange;
pub mod persistence;
pub mod position;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use controller::Controller;
pub use error::{ArbError, GatewayError, Result};
