use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::models::{
    FlashTrendMarket, FlashTrendPosition, MarketStats, Payout, Resolution, Token,
    TokenVolumeMinute, TradeEvent, TrendIndexHistory, TrendState,
};

/// Persistence seam shared by every component.
///
/// Every mutating method is a single storage-level operation: bucket and
/// market-total increments compose under concurrent writers without the
/// caller holding a lock across I/O.
#[async_trait]
pub trait Store: Send + Sync {
    /// Backend name for logging.
    fn backend_type(&self) -> &'static str;

    /// Creates the token if missing. Returns `true` when it was created.
    async fn register_token(&self, token_id: &str, headline: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn get_token(&self, token_id: &str) -> Result<Option<Token>>;

    async fn list_tokens(&self) -> Result<Vec<Token>>;

    async fn insert_trade(&self, trade: &TradeEvent) -> Result<()>;

    /// Trades with `timestamp >= since`, oldest first.
    async fn trades_since(&self, token_id: &str, since: DateTime<Utc>) -> Result<Vec<TradeEvent>>;

    /// Adds `delta` to the (token, minute) bucket, creating it if absent.
    async fn increment_minute_volume(&self, delta: &TokenVolumeMinute) -> Result<()>;

    /// Buckets with `minute >= since`, oldest first, at most `limit`.
    async fn minute_volumes(
        &self,
        token_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TokenVolumeMinute>>;

    async fn write_market_stats(&self, token_id: &str, stats: &MarketStats, now: DateTime<Utc>) -> Result<()>;

    async fn write_trend_state(&self, token_id: &str, state: &TrendState) -> Result<()>;

    async fn append_history(&self, entry: &TrendIndexHistory) -> Result<()>;

    /// Newest first, at most `limit`.
    async fn recent_history(&self, token_id: &str, limit: usize) -> Result<Vec<TrendIndexHistory>>;

    /// Inserts `market` unless its token already has an unresolved market.
    /// Returns `true` when inserted.
    async fn create_flash_market_if_idle(&self, market: &FlashTrendMarket) -> Result<bool>;

    async fn get_flash_market(&self, market_id: &str) -> Result<Option<FlashTrendMarket>>;

    /// Markets with `is_active`, newest first.
    async fn active_flash_markets(&self) -> Result<Vec<FlashTrendMarket>>;

    /// Markets with `is_active` and `end_timestamp <= now`.
    async fn due_flash_markets(&self, now: DateTime<Utc>) -> Result<Vec<FlashTrendMarket>>;

    /// Records the position and bumps the market totals as one operation.
    /// Fails with `DuplicatePosition` if the wallet already holds one.
    async fn insert_position(&self, position: &FlashTrendPosition) -> Result<()>;

    /// Oldest first.
    async fn positions(&self, market_id: &str) -> Result<Vec<FlashTrendPosition>>;

    /// Flips `is_active` off and stores the payouts. Returns `false` if the
    /// market was already resolved.
    async fn resolve_flash_market(&self, resolution: &Resolution, payouts: &[Payout]) -> Result<bool>;

    async fn payouts(&self, market_id: &str) -> Result<Vec<Payout>>;
}
