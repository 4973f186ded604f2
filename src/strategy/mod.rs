//! Execution strategies.
//!
//! Contains the core logic for:
//! - Instrument rules lookup and two-exchange quantity reconciliation
//! - Graduated entry of cross-exchange hedges
//! - Triangle enumeration, scoring and per-exchange scanners
//! - Sequential three-leg triangular execution

mod graduated;
mod normalizer;
mod opportunity_book;
mod scanner;
pub mod triangle;
mod triangular_executor;

pub use graduated::{GraduatedEntryExecutor, GraduatedEntryRequest};
pub use normalizer::{reconcile_quantity, QuantityNormalizer, ReconciledQuantity};
pub use opportunity_book::OpportunityBook;
pub use scanner::{Rescore, ScannerInfo, ScannerManager, ScannerStatus, TriangularScanner};
pub use triangle::{PriceGraph, TriangleParams, TriangleRoute};
pub use triangular_executor::{ExecuteOpportunityRequest, TriangularExecutor};
