use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::Serialize;

use super::store::Store;
use crate::db::models::{
    FlashMarketRecord, HistoryRecord, MarketStatsRecord, PayoutRecord, PositionRecord, TokenRecord,
    TradeRecord, TrendStateRecord, VolumeMinuteRecord, from_offset, to_offset,
};
use crate::db::queries::{fetch_markets, fetch_stats_map, fetch_trend_map};
use crate::error::{MarketError, Result, ValidationError};
use crate::types::models::{
    FlashTrendMarket, FlashTrendPosition, MarketStats, Payout, Resolution, Token,
    TokenVolumeMinute, TradeEvent, TrendIndexHistory, TrendState,
};

/// ClickHouse-backed store.
///
/// Increments never read before writing: volume buckets are delta rows in a
/// SummingMergeTree and market totals are sums over position rows. The
/// "one unresolved market per token" and "one position per wallet" checks
/// are select-then-insert and only hold within a single writer instance.
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
}

impl ClickHouseStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn insert_rows<T: Row + Serialize>(&self, table: &str, rows: &[T]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut insert = self.client.insert::<T>(table)?;
        for row in rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        Ok(())
    }

    async fn token_record(&self, token_id: &str) -> Result<Option<TokenRecord>> {
        let record = self
            .client
            .query("SELECT token_id, headline, created_at FROM tokens FINAL WHERE token_id = ?")
            .bind(token_id)
            .fetch_one::<TokenRecord>()
            .await;

        match record {
            Ok(record) => Ok(Some(record)),
            Err(clickhouse::error::Error::RowNotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Store for ClickHouseStore {
    fn backend_type(&self) -> &'static str {
        "clickhouse"
    }

    async fn register_token(&self, token_id: &str, headline: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.token_record(token_id).await?.is_some() {
            return Ok(false);
        }
        let record = TokenRecord {
            token_id: token_id.to_string(),
            headline: headline.to_string(),
            created_at: to_offset(now),
        };
        self.insert_rows("tokens", &[record]).await?;
        Ok(true)
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Token>> {
        let Some(record) = self.token_record(token_id).await? else {
            return Ok(None);
        };

        let stats = self
            .client
            .query(
                "SELECT
                    token_id,
                    price,
                    volume_24h,
                    price_change_24h,
                    market_cap,
                    last_trade_at,
                    updated_at
                FROM token_market_stats FINAL
                WHERE token_id = ?",
            )
            .bind(token_id)
            .fetch_one::<MarketStatsRecord>()
            .await;
        let stats = match stats {
            Ok(row) => row.into_stats(),
            Err(clickhouse::error::Error::RowNotFound) => MarketStats::default(),
            Err(e) => return Err(e.into()),
        };

        let trend = self
            .client
            .query(
                "SELECT
                    token_id,
                    score,
                    velocity,
                    sentiment,
                    mention_velocity,
                    holder_momentum,
                    cross_market_corr,
                    weights,
                    last_update
                FROM token_trend_state FINAL
                WHERE token_id = ?",
            )
            .bind(token_id)
            .fetch_one::<TrendStateRecord>()
            .await;
        let trend = match trend {
            Ok(row) => row.into_state()?,
            Err(clickhouse::error::Error::RowNotFound) => TrendState::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(Token {
            id: record.token_id,
            headline: record.headline,
            created_at: from_offset(record.created_at),
            stats,
            trend,
        }))
    }

    async fn list_tokens(&self) -> Result<Vec<Token>> {
        let records = self
            .client
            .query("SELECT token_id, headline, created_at FROM tokens FINAL ORDER BY token_id")
            .fetch_all::<TokenRecord>()
            .await?;
        let mut stats = fetch_stats_map(&self.client).await?;
        let mut trends = fetch_trend_map(&self.client).await?;

        Ok(records
            .into_iter()
            .map(|record| Token {
                stats: stats.remove(&record.token_id).unwrap_or_default(),
                trend: trends.remove(&record.token_id).unwrap_or_default(),
                created_at: from_offset(record.created_at),
                id: record.token_id,
                headline: record.headline,
            })
            .collect())
    }

    async fn insert_trade(&self, trade: &TradeEvent) -> Result<()> {
        self.insert_rows("trades", &[TradeRecord::from(trade)]).await
    }

    async fn trades_since(&self, token_id: &str, since: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        self.client
            .query(
                "SELECT
                    token_id,
                    trade_id,
                    side,
                    wallet,
                    amount,
                    price_at_trade,
                    timestamp
                FROM trades
                WHERE token_id = ?
                AND timestamp >= fromUnixTimestamp64Milli(toInt64(?))
                ORDER BY timestamp",
            )
            .bind(token_id)
            .bind(since.timestamp_millis())
            .fetch_all::<TradeRecord>()
            .await?
            .into_iter()
            .map(TradeRecord::into_event)
            .collect()
    }

    async fn increment_minute_volume(&self, delta: &TokenVolumeMinute) -> Result<()> {
        self.insert_rows("token_volume_minute", &[VolumeMinuteRecord::from(delta)])
            .await
    }

    async fn minute_volumes(
        &self,
        token_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TokenVolumeMinute>> {
        let rows = self
            .client
            .query(
                "SELECT
                    token_id,
                    minute,
                    sum(volume_sol),
                    sum(trade_count),
                    sum(buy_volume_sol),
                    sum(sell_volume_sol)
                FROM token_volume_minute
                WHERE token_id = ?
                AND minute >= toDateTime(?)
                GROUP BY token_id, minute
                ORDER BY minute
                LIMIT ?",
            )
            .bind(token_id)
            .bind(since.timestamp())
            .bind(limit as u64)
            .fetch_all::<VolumeMinuteRecord>()
            .await?;
        Ok(rows.into_iter().map(TokenVolumeMinute::from).collect())
    }

    async fn write_market_stats(&self, token_id: &str, stats: &MarketStats, now: DateTime<Utc>) -> Result<()> {
        let record = MarketStatsRecord::new(token_id, stats, now);
        self.insert_rows("token_market_stats", &[record]).await
    }

    async fn write_trend_state(&self, token_id: &str, state: &TrendState) -> Result<()> {
        let record = TrendStateRecord::new(token_id, state)?;
        self.insert_rows("token_trend_state", &[record]).await
    }

    async fn append_history(&self, entry: &TrendIndexHistory) -> Result<()> {
        let record = HistoryRecord::new(entry)?;
        self.insert_rows("trend_index_history", &[record]).await
    }

    async fn recent_history(&self, token_id: &str, limit: usize) -> Result<Vec<TrendIndexHistory>> {
        self.client
            .query(
                "SELECT
                    token_id,
                    score,
                    factors,
                    weights,
                    timestamp
                FROM trend_index_history
                WHERE token_id = ?
                ORDER BY timestamp DESC
                LIMIT ?",
            )
            .bind(token_id)
            .bind(limit as u64)
            .fetch_all::<HistoryRecord>()
            .await?
            .into_iter()
            .map(HistoryRecord::into_entry)
            .collect()
    }

    async fn create_flash_market_if_idle(&self, market: &FlashTrendMarket) -> Result<bool> {
        let open = self
            .client
            .query(
                "SELECT count()
                FROM flash_trend_markets FINAL
                WHERE parent_token_id = ?
                AND is_active = 1",
            )
            .bind(&market.parent_token_id)
            .fetch_one::<u64>()
            .await?;
        if open > 0 {
            return Ok(false);
        }

        self.insert_rows("flash_trend_markets", &[FlashMarketRecord::new(market, 1)?])
            .await?;
        Ok(true)
    }

    async fn get_flash_market(&self, market_id: &str) -> Result<Option<FlashTrendMarket>> {
        let mut markets = fetch_markets(&self.client, "WHERE m.id = ?", &[market_id]).await?;
        Ok(markets.pop())
    }

    async fn active_flash_markets(&self) -> Result<Vec<FlashTrendMarket>> {
        fetch_markets(
            &self.client,
            "WHERE m.is_active = 1 ORDER BY m.start_timestamp DESC",
            &[],
        )
        .await
    }

    async fn due_flash_markets(&self, now: DateTime<Utc>) -> Result<Vec<FlashTrendMarket>> {
        let now_millis = now.timestamp_millis().to_string();
        fetch_markets(
            &self.client,
            "WHERE m.is_active = 1
            AND m.end_timestamp <= fromUnixTimestamp64Milli(toInt64(?))
            ORDER BY m.end_timestamp",
            &[now_millis.as_str()],
        )
        .await
    }

    async fn insert_position(&self, position: &FlashTrendPosition) -> Result<()> {
        let held = self
            .client
            .query(
                "SELECT count()
                FROM flash_trend_positions
                WHERE market_id = ?
                AND wallet_address = ?",
            )
            .bind(&position.market_id)
            .bind(&position.wallet_address)
            .fetch_one::<u64>()
            .await?;
        if held > 0 {
            return Err(ValidationError::DuplicatePosition(position.wallet_address.clone()).into());
        }

        // Re-read right before the insert; a resolution landing between this
        // check and the insert is still possible across instances.
        let Some(market) = self.get_flash_market(&position.market_id).await? else {
            return Err(ValidationError::UnknownMarket(position.market_id.clone()).into());
        };
        if !market.is_active {
            return Err(ValidationError::MarketNotActive.into());
        }
        if position.created_at >= market.end_timestamp {
            return Err(ValidationError::MarketExpired.into());
        }

        // The row itself is the increment: totals are summed on read.
        self.insert_rows("flash_trend_positions", &[PositionRecord::from(position)])
            .await
    }

    async fn positions(&self, market_id: &str) -> Result<Vec<FlashTrendPosition>> {
        self.client
            .query(
                "SELECT
                    id,
                    market_id,
                    wallet_address,
                    direction,
                    amount,
                    created_at
                FROM flash_trend_positions
                WHERE market_id = ?
                ORDER BY created_at, id",
            )
            .bind(market_id)
            .fetch_all::<PositionRecord>()
            .await?
            .into_iter()
            .map(PositionRecord::into_position)
            .collect()
    }

    async fn resolve_flash_market(&self, resolution: &Resolution, payouts: &[Payout]) -> Result<bool> {
        let rows = self
            .client
            .query(
                "SELECT
                    id,
                    parent_token_id,
                    trend_snapshot,
                    start_timestamp,
                    end_timestamp,
                    initial_velocity,
                    is_active,
                    final_velocity,
                    winning_side,
                    version
                FROM flash_trend_markets FINAL
                WHERE id = ?",
            )
            .bind(&resolution.market_id)
            .fetch_all::<FlashMarketRecord>()
            .await?;
        let Some(mut current) = rows.into_iter().next() else {
            return Err(ValidationError::UnknownMarket(resolution.market_id.clone()).into());
        };
        if current.is_active == 0 {
            return Ok(false);
        }

        let participants = self
            .client
            .query("SELECT count() FROM flash_trend_positions WHERE market_id = ?")
            .bind(&resolution.market_id)
            .fetch_one::<u64>()
            .await?;
        if participants != resolution.participant_count {
            return Err(MarketError::ConcurrencyConflict(format!(
                "market {} took positions while resolving",
                resolution.market_id
            )));
        }

        // Payout rows land before the market flips inactive.
        let payout_rows: Vec<PayoutRecord> = payouts
            .iter()
            .map(|p| PayoutRecord::new(p, resolution.resolved_at))
            .collect();
        self.insert_rows("flash_trend_payouts", &payout_rows).await?;

        current.is_active = 0;
        current.final_velocity = resolution.final_velocity;
        current.winning_side = resolution.winning_side.as_str().to_string();
        current.version += 1;
        self.insert_rows("flash_trend_markets", &[current]).await?;
        Ok(true)
    }

    async fn payouts(&self, market_id: &str) -> Result<Vec<Payout>> {
        self.client
            .query(
                "SELECT
                    market_id,
                    position_id,
                    wallet_address,
                    direction,
                    stake,
                    payout,
                    profit_loss,
                    resolved_at
                FROM flash_trend_payouts
                WHERE market_id = ?
                ORDER BY position_id",
            )
            .bind(market_id)
            .fetch_all::<PayoutRecord>()
            .await?
            .into_iter()
            .map(PayoutRecord::into_payout)
            .collect()
    }
}
