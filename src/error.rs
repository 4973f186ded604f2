//! Error types for the execution core.
//!
//! `GatewayError` is what an exchange adapter reports for a single call.
//! `ArbError` is what the core returns to its callers. Outcomes that happen
//! asynchronously (partial execution, liquidation) are written into entity
//! state and broadcast instead of being returned.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::exchange::Venue;

/// Failure of one exchange gateway call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The exchange answered with a business error.
    #[error("rejected by exchange{}: {message}", .code.as_ref().map(|c| format!(" ({c})")).unwrap_or_default())]
    Rejected {
        code: Option<String>,
        message: String,
    },

    /// The call did not complete within its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },

    /// Network or server-side hiccup worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// The symbol is not listed on this exchange.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl GatewayError {
    /// Timeouts and transient errors are retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Timeout { .. } | GatewayError::Transient(_))
    }

    /// Exchanges reject a leverage change that matches the current setting.
    /// That outcome is equivalent to success.
    pub fn is_leverage_not_modified(&self) -> bool {
        match self {
            GatewayError::Rejected { code, message } => {
                let msg = message.to_ascii_lowercase();
                msg.contains("leverage not modified")
                    || msg.contains("leverage not changed")
                    || code.as_deref() == Some("110043")
            }
            _ => false,
        }
    }
}

/// Errors returned by the execution core.
#[derive(Error, Debug)]
pub enum ArbError {
    /// Bad input. Nothing was sent to any exchange.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested size cannot be traded identically on both legs.
    #[error("quantity {requested} rejected: {reason} (suggested: {})", format_suggestions(.suggestions))]
    QuantityRejected {
        requested: Decimal,
        reason: String,
        suggestions: Vec<Decimal>,
    },

    /// An exchange call failed after local retries were exhausted.
    #[error("{venue} {operation}: {source}")]
    Exchange {
        venue: Venue,
        operation: &'static str,
        #[source]
        source: GatewayError,
    },

    /// One leg of a multi-leg operation failed after another succeeded.
    #[error("partial execution: {0}")]
    PartialExecution(String),

    /// The opportunity is older than its time-to-live.
    #[error("opportunity {id} is stale ({age_ms}ms old, ttl {ttl_ms}ms)")]
    StaleOpportunity { id: String, age_ms: i64, ttl_ms: u64 },

    #[error("{0} not found")]
    NotFound(String),

    /// Another operation currently owns the entity.
    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("storage error: {0}")]
    Store(#[source] anyhow::Error),
}

impl ArbError {
    pub fn exchange(venue: Venue, operation: &'static str, source: GatewayError) -> Self {
        ArbError::Exchange {
            venue,
            operation,
            source,
        }
    }

    /// Short machine-readable code for event payloads and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            ArbError::Validation(_) => "VALIDATION_ERROR",
            ArbError::QuantityRejected { .. } => "QUANTITY_RECONCILIATION_REJECTED",
            ArbError::Exchange { source, .. } if source.is_retryable() => "TRANSIENT_ERROR",
            ArbError::Exchange { .. } => "EXCHANGE_REJECTION",
            ArbError::PartialExecution(_) => "PARTIAL_EXECUTION",
            ArbError::StaleOpportunity { .. } => "STALE_OPPORTUNITY",
            ArbError::NotFound(_) => "NOT_FOUND",
            ArbError::Busy(_) => "BUSY",
            ArbError::InvalidTransition { .. } => "INVALID_TRANSITION",
            ArbError::Store(_) => "STORE_ERROR",
        }
    }
}

fn format_suggestions(suggestions: &[Decimal]) -> String {
    if suggestions.is_empty() {
        return "none".to_string();
    }
    suggestions
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, ArbError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_retryable_classification() {
        assert!(GatewayError::Transient("502".into()).is_retryable());
        assert!(GatewayError::Timeout {
            operation: "place_order".into(),
            after_ms: 100
        }
        .is_retryable());
        assert!(!GatewayError::Rejected {
            code: None,
            message: "insufficient margin".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_leverage_not_modified_is_benign() {
        let err = GatewayError::Rejected {
            code: Some("110043".into()),
            message: "Set leverage not modified".into(),
        };
        assert!(err.is_leverage_not_modified());

        let other = GatewayError::Rejected {
            code: None,
            message: "leverage exceeds risk limit".into(),
        };
        assert!(!other.is_leverage_not_modified());
    }

    #[test]
    fn test_quantity_rejected_message() {
        let err = ArbError::QuantityRejected {
            requested: dec!(1.005),
            reason: "not a multiple of step".into(),
            suggestions: vec![dec!(1.0), dec!(1.01)],
        };
        let msg = err.to_string();
        assert!(msg.contains("1.005"));
        assert!(msg.contains("1.0, 1.01"));
        assert_eq!(err.code(), "QUANTITY_RECONCILIATION_REJECTED");
    }
}
