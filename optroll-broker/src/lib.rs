//! Exchange-agnostic traits used by the rest of the workspace.

use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use optroll_core::{OrderId, OrderRequest, Position, Price, Symbol};

/// Convenience alias for exchange results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Common error type returned by exchange implementations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Represents transport-level failures (network, timeouts, etc.).
    #[error("transport error: {0}")]
    Transport(String),
    /// Returned when authentication fails or credentials are missing.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// Returned when the request parameters are invalid for the target exchange.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// Wraps serialization or parsing errors.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Exchange responded with a business error (e.g., insufficient margin).
    #[error("exchange error: {0}")]
    Exchange(String),
    /// A catch-all branch for other issues.
    #[error("unexpected error: {0}")]
    Other(String),
}

const TRANSIENT_PATTERNS: [&str; 5] = [
    "timeout",
    "timed out",
    "deadline exceeded",
    "502",
    "504",
];

impl ExchangeError {
    /// Helper used by connectors when mapping any error type into an exchange error.
    pub fn from_display(err: impl std::fmt::Display, kind: ExchangeErrorKind) -> Self {
        match kind {
            ExchangeErrorKind::Transport => Self::Transport(err.to_string()),
            ExchangeErrorKind::Authentication => Self::Authentication(err.to_string()),
            ExchangeErrorKind::InvalidRequest => Self::InvalidRequest(err.to_string()),
            ExchangeErrorKind::Serialization => Self::Serialization(err.to_string()),
            ExchangeErrorKind::Exchange => Self::Exchange(err.to_string()),
            ExchangeErrorKind::Other => Self::Other(err.to_string()),
        }
    }

    /// Whether a retry is expected to succeed once the network settles.
    ///
    /// Transport failures are always retryable; business errors only when the
    /// gateway reported an infrastructure condition (502/504/timeouts).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        if matches!(self, Self::Transport(_)) {
            return true;
        }
        let message = self.to_string().to_ascii_lowercase();
        TRANSIENT_PATTERNS
            .iter()
            .any(|pattern| message.contains(pattern))
    }
}

/// Enumerates the broad families of exchange errors.
#[derive(Debug, Clone, Copy)]
pub enum ExchangeErrorKind {
    Transport,
    Authentication,
    InvalidRequest,
    Serialization,
    Exchange,
    Other,
}

/// API credentials for private endpoints, fetched per job.
#[derive(Clone, Deserialize, Serialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Capability contract against the derivatives exchange.
///
/// Implementations are stateless per call; credentials travel as parameters
/// so that every job observes the freshest key material.
#[async_trait]
pub trait ExchangePort: Send + Sync {
    /// Latest reference price for an underlying (diagnostics; the hot path
    /// consumes the streaming feed).
    async fn index_price(&self, symbol: &str) -> ExchangeResult<Price>;

    /// All tradeable strikes for `(base, expiry)`, in no particular order.
    async fn option_chain(&self, base: &str, expiry: NaiveDate) -> ExchangeResult<Vec<Decimal>>;

    /// Mark price of a specific option contract.
    async fn mark_price(&self, option_symbol: &str) -> ExchangeResult<Price>;

    /// Position held on `option_symbol`; a zero-quantity position when absent.
    async fn position(&self, cred: &Credentials, option_symbol: &str) -> ExchangeResult<Position>;

    /// All open option positions for the account.
    async fn positions(&self, cred: &Credentials) -> ExchangeResult<Vec<Position>>;

    /// Submit an order; retries reusing the same `client_order_id` are no-ops.
    async fn place_order(
        &self,
        cred: &Credentials,
        request: OrderRequest,
    ) -> ExchangeResult<OrderId>;
}

/// Lookup port for per-task API credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Resolve the credentials referenced by a task.
    async fn credentials(&self, credential_id: i64) -> ExchangeResult<Credentials>;
}

/// Handle onto the resilient market data subscription session.
#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Add symbols to the active subscription set. Duplicates are ignored;
    /// new symbols are subscribed immediately when a connection is up and
    /// replayed after every reconnect.
    async fn add_subscriptions(&self, symbols: Vec<Symbol>) -> ExchangeResult<()>;

    /// Tear down the session; the reconnect loop terminates.
    fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_transient() {
        assert!(ExchangeError::Transport("connection reset".into()).is_transient());
    }

    #[test]
    fn gateway_conditions_are_transient() {
        assert!(ExchangeError::Exchange("bybit api error: [10016] 504 Gateway Timeout".into())
            .is_transient());
        assert!(ExchangeError::Exchange("context deadline exceeded".into()).is_transient());
        assert!(ExchangeError::Other("request timed out after 5s".into()).is_transient());
    }

    #[test]
    fn business_errors_are_fatal() {
        assert!(!ExchangeError::Exchange("insufficient margin".into()).is_transient());
        assert!(!ExchangeError::InvalidRequest("unknown symbol".into()).is_transient());
    }

    #[test]
    fn credentials_debug_hides_secret() {
        let cred = Credentials {
            api_key: "key".into(),
            api_secret: "secret".into(),
        };
        let rendered = format!("{cred:?}");
        assert!(!rendered.contains("secret\""));
        assert!(rendered.contains("<redacted>"));
    }
}
