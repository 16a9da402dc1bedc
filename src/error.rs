use chrono::{DateTime, Utc};
use thiserror::Error;

/// Bad caller input. Rejected before any state is touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("unknown token: {0}")]
    UnknownToken(String),
    #[error("unknown market: {0}")]
    UnknownMarket(String),
    #[error("market not active")]
    MarketNotActive,
    #[error("market expired")]
    MarketExpired,
    #[error("market still open until {0}")]
    MarketStillOpen(DateTime<Utc>),
    #[error("wallet {0} already holds a position in this market")]
    DuplicatePosition(String),
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("signal provider unavailable: {0}")]
    ProviderUnavailable(String),
    #[error("concurrent update conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("payout conservation violated: pool {expected}, computed {actual}")]
    InconsistentPayout { expected: u128, actual: u128 },
    #[error("storage error: {0}")]
    Storage(String),
}

impl MarketError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        MarketError::Validation(ValidationError::InvalidInput(reason.into()))
    }
}

impl From<clickhouse::error::Error> for MarketError {
    fn from(err: clickhouse::error::Error) -> Self {
        MarketError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(err: serde_json::Error) -> Self {
        MarketError::Storage(format!("snapshot encoding: {}", err))
    }
}

pub type Result<T, E = MarketError> = std::result::Result<T, E>;
