//! Exchange integrations.
//!
//! The execution core depends only on the [`ExchangeGateway`] trait. This
//! module provides:
//! - Venue-neutral order, position and price types
//! - The gateway trait, per-subscription price stream handles and a registry
//! - Bounded timeout + exponential backoff for gateway calls
//! - Credential resolution
//! - A paper-trading gateway used for simulation and tests

pub mod credentials;
pub mod mock;
pub mod retry;
mod traits;
mod types;

pub use credentials::{
    CredentialProvider, CredentialRef, Credentials, EnvCredentialProvider,
    StaticCredentialProvider,
};
pub use mock::PaperGateway;
pub use retry::{call_with_retry, RetryPolicy};
pub use traits::{
    canonical_symbol, split_symbol, ExchangeGateway, GatewayRegistry, PriceStream, Venue,
};
pub use types::*;
