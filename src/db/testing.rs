use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

use super::memory::MemoryStore;
use super::store::Store;
use crate::error::{MarketError, Result};
use crate::types::models::{
    FlashTrendMarket, FlashTrendPosition, MarketStats, Payout, Resolution, Token,
    TokenVolumeMinute, TradeEvent, TrendIndexHistory, TrendState,
};

/// `MemoryStore` with switches for pausing position inserts and failing
/// bucket increments.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    hold_positions: AtomicBool,
    pub position_paused: Notify,
    pub release_position: Notify,
    failing_increments: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `insert_position` signals `position_paused` and waits for
    /// `release_position` before writing.
    pub fn hold_next_position(&self) {
        self.hold_positions.store(true, Ordering::SeqCst);
    }

    pub fn fail_increments(&self, times: usize) {
        self.failing_increments.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FaultyStore {
    fn backend_type(&self) -> &'static str {
        "faulty"
    }

    async fn register_token(&self, token_id: &str, headline: &str, now: DateTime<Utc>) -> Result<bool> {
        self.inner.register_token(token_id, headline, now).await
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Token>> {
        self.inner.get_token(token_id).await
    }

    async fn list_tokens(&self) -> Result<Vec<Token>> {
        self.inner.list_tokens().await
    }

    async fn insert_trade(&self, trade: &TradeEvent) -> Result<()> {
        self.inner.insert_trade(trade).await
    }

    async fn trades_since(&self, token_id: &str, since: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        self.inner.trades_since(token_id, since).await
    }

    async fn increment_minute_volume(&self, delta: &TokenVolumeMinute) -> Result<()> {
        let failing = self
            .failing_increments
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MarketError::Storage("bucket write refused".into()));
        }
        self.inner.increment_minute_volume(delta).await
    }

    async fn minute_volumes(
        &self,
        token_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TokenVolumeMinute>> {
        self.inner.minute_volumes(token_id, since, limit).await
    }

    async fn write_market_stats(&self, token_id: &str, stats: &MarketStats, now: DateTime<Utc>) -> Result<()> {
        self.inner.write_market_stats(token_id, stats, now).await
    }

    async fn write_trend_state(&self, token_id: &str, state: &TrendState) -> Result<()> {
        self.inner.write_trend_state(token_id, state).await
    }

    async fn append_history(&self, entry: &TrendIndexHistory) -> Result<()> {
        self.inner.append_history(entry).await
    }

    async fn recent_history(&self, token_id: &str, limit: usize) -> Result<Vec<TrendIndexHistory>> {
        self.inner.recent_history(token_id, limit).await
    }

    async fn create_flash_market_if_idle(&self, market: &FlashTrendMarket) -> Result<bool> {
        self.inner.create_flash_market_if_idle(market).await
    }

    async fn get_flash_market(&self, market_id: &str) -> Result<Option<FlashTrendMarket>> {
        self.inner.get_flash_market(market_id).await
    }

    async fn active_flash_markets(&self) -> Result<Vec<FlashTrendMarket>> {
        self.inner.active_flash_markets().await
    }

    async fn due_flash_markets(&self, now: DateTime<Utc>) -> Result<Vec<FlashTrendMarket>> {
        self.inner.due_flash_markets(now).await
    }

    async fn insert_position(&self, position: &FlashTrendPosition) -> Result<()> {
        if self.hold_positions.swap(false, Ordering::SeqCst) {
            self.position_paused.notify_one();
            self.release_position.notified().await;
        }
        self.inner.insert_position(position).await
    }

    async fn positions(&self, market_id: &str) -> Result<Vec<FlashTrendPosition>> {
        self.inner.positions(market_id).await
    }

    async fn resolve_flash_market(&self, resolution: &Resolution, payouts: &[Payout]) -> Result<bool> {
        self.inner.resolve_flash_market(resolution, payouts).await
    }

    async fn payouts(&self, market_id: &str) -> Result<Vec<Payout>> {
        self.inner.payouts(market_id).await
    }
}
