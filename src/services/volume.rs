use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::db::Store;
use crate::error::{MarketError, Result, ValidationError};
use crate::types::models::{MarketStats, TokenVolumeMinute, TradeEvent, TradeSide};

/// The platform assumes a fixed 100-token supply per story.
pub const TOKEN_SUPPLY: f64 = 100.0;
const MINUTE_MILLIS: i64 = 60_000;
const BUCKET_WRITE_ATTEMPTS: u32 = 3;

/// Start of the UTC minute containing `ts`.
pub fn align_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    let aligned = ts.timestamp_millis().div_euclid(MINUTE_MILLIS) * MINUTE_MILLIS;
    DateTime::from_timestamp_millis(aligned).unwrap_or(ts)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1h")]
    Hour,
    #[serde(rename = "24h")]
    Day,
    #[serde(rename = "7d")]
    Week,
}

impl Timeframe {
    pub fn span(&self) -> Duration {
        match self {
            Timeframe::Hour => Duration::hours(1),
            Timeframe::Day => Duration::hours(24),
            Timeframe::Week => Duration::days(7),
        }
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1h" => Ok(Timeframe::Hour),
            "24h" => Ok(Timeframe::Day),
            "7d" => Ok(Timeframe::Week),
            other => Err(ValidationError::InvalidInput(format!("unknown timeframe {:?}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestOutcome {
    pub token_id: String,
    pub duplicate: bool,
    pub minute: DateTime<Utc>,
    /// `false` when the trade is in the ledger but its bucket write failed.
    pub minute_recorded: bool,
    /// `None` when the 24h recompute failed; the trade is still committed.
    pub stats: Option<MarketStats>,
}

/// Bounded FIFO of trade ids already ingested by this process.
#[derive(Debug)]
pub struct RecentTradeIds {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentTradeIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity.min(1024)),
            ids: HashSet::new(),
        }
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.capacity == 0 {
            return true;
        }
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }

    pub fn forget(&mut self, id: &str) {
        if self.ids.remove(id) {
            self.order.retain(|seen| seen != id);
        }
    }
}

pub struct VolumeAggregator {
    store: Arc<dyn Store>,
    seen: Mutex<RecentTradeIds>,
}

impl VolumeAggregator {
    pub fn new(store: Arc<dyn Store>, dedup_capacity: usize) -> Self {
        Self {
            store,
            seen: Mutex::new(RecentTradeIds::new(dedup_capacity)),
        }
    }

    pub async fn record_trade(&self, event: &TradeEvent) -> Result<IngestOutcome> {
        self.record_trade_at(event, Utc::now()).await
    }

    /// Validates, persists and aggregates one trade. The trade counts as
    /// committed once its ledger row is written. A failing bucket write or
    /// 24h recompute is logged and does not undo the commit.
    pub async fn record_trade_at(&self, event: &TradeEvent, now: DateTime<Utc>) -> Result<IngestOutcome> {
        validate_trade(event)?;
        if self.store.get_token(&event.token_id).await?.is_none() {
            return Err(ValidationError::UnknownToken(event.token_id.clone()).into());
        }

        let minute = align_to_minute(event.timestamp);
        if let Some(trade_id) = &event.trade_id {
            if !self.mark_seen(trade_id) {
                tracing::debug!("Ignoring duplicate trade {} for {}", trade_id, event.token_id);
                return Ok(IngestOutcome {
                    token_id: event.token_id.clone(),
                    duplicate: true,
                    minute,
                    minute_recorded: false,
                    stats: None,
                });
            }
        }

        // The ledger row is the commit point. Only a failed ledger write lets
        // the same trade id through again.
        if let Err(e) = self.store.insert_trade(event).await {
            if let Some(trade_id) = &event.trade_id {
                self.forget_seen(trade_id);
            }
            return Err(e);
        }
        let minute_recorded = self.record_bucket(event).await;

        let stats = match self.recompute_rolling_24h_at(&event.token_id, now).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(
                    "Failed to recompute 24h stats for {} (will retry on next trade): {}",
                    event.token_id,
                    e
                );
                None
            }
        };

        tracing::debug!(
            "Recorded {} of {} @ {} for {}",
            event.side.as_str(),
            event.amount,
            event.price_at_trade,
            event.token_id
        );

        Ok(IngestOutcome {
            token_id: event.token_id.clone(),
            duplicate: false,
            minute,
            minute_recorded,
            stats,
        })
    }

    /// Bucket increment for an already committed trade, retried on its own.
    /// Returns `false` if every attempt failed; the bucket then under-counts
    /// this trade while the ledger keeps it.
    async fn record_bucket(&self, event: &TradeEvent) -> bool {
        for attempt in 1..=BUCKET_WRITE_ATTEMPTS {
            match self
                .upsert_minute_volume(&event.token_id, event.timestamp, event.notional(), event.side)
                .await
            {
                Ok(_) => return true,
                Err(e) if attempt < BUCKET_WRITE_ATTEMPTS => {
                    tracing::warn!(
                        "Minute bucket write for {} failed (attempt {}/{}): {}",
                        event.token_id,
                        attempt,
                        BUCKET_WRITE_ATTEMPTS,
                        e
                    );
                    tokio::time::sleep(std::time::Duration::from_millis(25 * attempt as u64)).await;
                }
                Err(e) => {
                    tracing::error!(
                        "Giving up on minute bucket for {} at {}: {}",
                        event.token_id,
                        event.timestamp,
                        e
                    );
                }
            }
        }
        false
    }

    /// Adds one trade to its (token, UTC minute) bucket.
    pub async fn upsert_minute_volume(
        &self,
        token_id: &str,
        trade_timestamp: DateTime<Utc>,
        notional: f64,
        side: TradeSide,
    ) -> Result<TokenVolumeMinute> {
        let delta = TokenVolumeMinute::single_trade(
            token_id,
            align_to_minute(trade_timestamp),
            notional,
            side,
        );
        self.store.increment_minute_volume(&delta).await?;
        Ok(delta)
    }

    pub async fn recompute_rolling_24h(&self, token_id: &str) -> Result<MarketStats> {
        self.recompute_rolling_24h_at(token_id, Utc::now()).await
    }

    /// Rebuilds price, 24h volume and 24h price change from the trade ledger
    /// and writes them back to the token.
    pub async fn recompute_rolling_24h_at(&self, token_id: &str, now: DateTime<Utc>) -> Result<MarketStats> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()))?;

        let mut trades = self.store.trades_since(token_id, now - Duration::hours(24)).await?;
        trades.sort_by_key(|t| t.timestamp);

        let stats = rolling_stats(&trades, &token.stats);
        self.store.write_market_stats(token_id, &stats, now).await?;
        Ok(stats)
    }

    pub async fn volume_series(
        &self,
        token_id: &str,
        timeframe: Timeframe,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<TokenVolumeMinute>> {
        if self.store.get_token(token_id).await?.is_none() {
            return Err(ValidationError::UnknownToken(token_id.to_string()).into());
        }
        self.store
            .minute_volumes(token_id, now - timeframe.span(), limit)
            .await
    }

    fn mark_seen(&self, trade_id: &str) -> bool {
        match self.seen.lock() {
            Ok(mut seen) => seen.insert(trade_id),
            Err(poisoned) => poisoned.into_inner().insert(trade_id),
        }
    }

    fn forget_seen(&self, trade_id: &str) {
        match self.seen.lock() {
            Ok(mut seen) => seen.forget(trade_id),
            Err(poisoned) => poisoned.into_inner().forget(trade_id),
        }
    }
}

fn validate_trade(event: &TradeEvent) -> Result<()> {
    if event.token_id.trim().is_empty() {
        return Err(MarketError::invalid_input("tokenId is required"));
    }
    if !event.amount.is_finite() || event.amount <= 0.0 {
        return Err(MarketError::invalid_input("amount must be positive"));
    }
    if !event.price_at_trade.is_finite() || event.price_at_trade < 0.0 {
        return Err(MarketError::invalid_input("priceAtTrade must be non-negative"));
    }
    Ok(())
}

/// `trades` must be sorted oldest first. An empty window zeroes volume and
/// change but keeps the last known price.
fn rolling_stats(trades: &[TradeEvent], previous: &MarketStats) -> MarketStats {
    let (Some(oldest), Some(newest)) = (trades.first(), trades.last()) else {
        return MarketStats {
            volume_24h: 0.0,
            price_change_24h: 0.0,
            ..previous.clone()
        };
    };

    let volume_24h = trades.iter().map(TradeEvent::notional).sum();
    let price = newest.price_at_trade;
    let price_change_24h = if oldest.price_at_trade > 0.0 {
        (price - oldest.price_at_trade) / oldest.price_at_trade * 100.0
    } else {
        0.0
    };

    MarketStats {
        price,
        volume_24h,
        price_change_24h,
        market_cap: price * TOKEN_SUPPLY,
        last_trade_at: Some(newest.timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::FaultyStore;
    use crate::db::MemoryStore;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040 + secs, 0).unwrap()
    }

    fn trade(side: TradeSide, amount: f64, price: f64, ts: DateTime<Utc>) -> TradeEvent {
        TradeEvent {
            token_id: "tok".into(),
            side,
            amount,
            price_at_trade: price,
            timestamp: ts,
            trade_id: None,
            wallet: None,
        }
    }

    async fn aggregator() -> (Arc<MemoryStore>, VolumeAggregator) {
        let store = Arc::new(MemoryStore::new());
        store.register_token("tok", "Story", at(0)).await.unwrap();
        let aggregator = VolumeAggregator::new(store.clone(), 16);
        (store, aggregator)
    }

    #[test]
    fn aligns_to_utc_minute_start() {
        let ts = Utc.timestamp_millis_opt(1_700_000_059_999).unwrap();
        assert_eq!(align_to_minute(ts).timestamp_millis(), 1_700_000_040_000);
        let pre_epoch = Utc.timestamp_millis_opt(-1).unwrap();
        assert_eq!(align_to_minute(pre_epoch).timestamp_millis(), -60_000);
    }

    #[tokio::test]
    async fn same_minute_trades_sum_regardless_of_order() {
        let trades = vec![
            trade(TradeSide::Buy, 2.0, 1.5, at(1)),
            trade(TradeSide::Sell, 1.0, 2.0, at(30)),
            trade(TradeSide::Buy, 4.0, 0.5, at(59)),
        ];
        let expected_volume: f64 = trades.iter().map(TradeEvent::notional).sum();

        for order in [[0, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let (store, aggregator) = aggregator().await;
            for i in order {
                aggregator.record_trade_at(&trades[i], at(60)).await.unwrap();
            }
            let buckets = store.minute_volumes("tok", at(-60), 10).await.unwrap();
            assert_eq!(buckets.len(), 1);
            assert_eq!(buckets[0].minute, at(0));
            assert_eq!(buckets[0].trade_count, 3);
            assert!((buckets[0].volume_sol - expected_volume).abs() < 1e-9);
            assert!((buckets[0].buy_volume_sol - 5.0).abs() < 1e-9);
            assert!((buckets[0].sell_volume_sol - 2.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn rolling_stats_use_newest_and_oldest_prices_in_window() {
        let (store, aggregator) = aggregator().await;
        let now = at(25 * 3600);
        // Outside the 24h window.
        aggregator
            .record_trade_at(&trade(TradeSide::Buy, 10.0, 9.0, at(0)), now)
            .await
            .unwrap();
        aggregator
            .record_trade_at(&trade(TradeSide::Buy, 2.0, 1.0, at(2 * 3600)), now)
            .await
            .unwrap();
        let outcome = aggregator
            .record_trade_at(&trade(TradeSide::Sell, 1.0, 1.5, at(3 * 3600)), now)
            .await
            .unwrap();

        let stats = outcome.stats.unwrap();
        assert_eq!(stats.price, 1.5);
        assert!((stats.volume_24h - 3.5).abs() < 1e-9);
        assert!((stats.price_change_24h - 50.0).abs() < 1e-9);
        assert_eq!(stats.market_cap, 150.0);
        assert_eq!(store.get_token("tok").await.unwrap().unwrap().stats, stats);
    }

    #[tokio::test]
    async fn zero_oldest_price_gives_zero_change() {
        let (_, aggregator) = aggregator().await;
        aggregator
            .record_trade_at(&trade(TradeSide::Buy, 1.0, 0.0, at(0)), at(10))
            .await
            .unwrap();
        let outcome = aggregator
            .record_trade_at(&trade(TradeSide::Buy, 1.0, 2.0, at(5)), at(10))
            .await
            .unwrap();
        assert_eq!(outcome.stats.unwrap().price_change_24h, 0.0);
    }

    #[tokio::test]
    async fn rejects_bad_input_without_touching_state() {
        let (store, aggregator) = aggregator().await;
        let err = aggregator
            .record_trade_at(&trade(TradeSide::Buy, 0.0, 1.0, at(0)), at(0))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("invalid input"));

        let mut unknown = trade(TradeSide::Buy, 1.0, 1.0, at(0));
        unknown.token_id = "missing".into();
        let err = aggregator.record_trade_at(&unknown, at(0)).await.unwrap_err();
        assert!(matches!(
            err,
            MarketError::Validation(ValidationError::UnknownToken(_))
        ));

        assert!(store.trades_since("tok", at(-60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn duplicate_trade_ids_are_counted_once() {
        let (store, aggregator) = aggregator().await;
        let mut event = trade(TradeSide::Buy, 1.0, 1.0, at(0));
        event.trade_id = Some("sig-1".into());

        assert!(!aggregator.record_trade_at(&event, at(1)).await.unwrap().duplicate);
        assert!(aggregator.record_trade_at(&event, at(2)).await.unwrap().duplicate);

        let buckets = store.minute_volumes("tok", at(-60), 10).await.unwrap();
        assert_eq!(buckets[0].trade_count, 1);
    }

    async fn faulty_aggregator() -> (Arc<FaultyStore>, VolumeAggregator) {
        let store = Arc::new(FaultyStore::new());
        store.register_token("tok", "Story", at(0)).await.unwrap();
        let aggregator = VolumeAggregator::new(store.clone(), 16);
        (store, aggregator)
    }

    #[tokio::test]
    async fn transient_bucket_failure_is_retried_without_a_second_ledger_row() {
        let (store, aggregator) = faulty_aggregator().await;
        store.fail_increments(1);
        let mut event = trade(TradeSide::Buy, 2.0, 1.5, at(0));
        event.trade_id = Some("sig-9".into());

        let outcome = aggregator.record_trade_at(&event, at(1)).await.unwrap();
        assert!(outcome.minute_recorded);
        assert!(aggregator.record_trade_at(&event, at(2)).await.unwrap().duplicate);

        assert_eq!(store.trades_since("tok", at(-60)).await.unwrap().len(), 1);
        let buckets = store.minute_volumes("tok", at(-60), 10).await.unwrap();
        assert_eq!(buckets[0].trade_count, 1);
        assert_eq!(buckets[0].volume_sol, 3.0);
    }

    #[tokio::test]
    async fn lost_bucket_write_still_commits_the_trade_once() {
        let (store, aggregator) = faulty_aggregator().await;
        store.fail_increments(10);
        let mut event = trade(TradeSide::Sell, 1.0, 2.0, at(0));
        event.trade_id = Some("sig-10".into());

        let outcome = aggregator.record_trade_at(&event, at(1)).await.unwrap();
        assert!(!outcome.duplicate);
        assert!(!outcome.minute_recorded);
        assert_eq!(outcome.stats.unwrap().volume_24h, 2.0);

        // A redelivery is recognised; the ledger keeps a single row.
        assert!(aggregator.record_trade_at(&event, at(2)).await.unwrap().duplicate);
        assert_eq!(store.trades_since("tok", at(-60)).await.unwrap().len(), 1);
        assert!(store.minute_volumes("tok", at(-60), 10).await.unwrap().is_empty());
    }

    #[test]
    fn recent_trade_ids_evict_oldest_first() {
        let mut seen = RecentTradeIds::new(2);
        assert!(seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("c"));
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }
}
