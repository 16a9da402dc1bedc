use clickhouse::Client;
use std::collections::HashMap;

use crate::db::models::{FlashMarketRow, MarketStatsRecord, TrendStateRecord};
use crate::error::Result;
use crate::types::models::{FlashTrendMarket, MarketStats, TrendState};

/// Market rows joined with totals summed from positions. Callers append a
/// WHERE/ORDER BY tail.
pub const FLASH_MARKET_SELECT: &str = "
    SELECT
        m.id,
        m.parent_token_id,
        m.trend_snapshot,
        m.start_timestamp,
        m.end_timestamp,
        m.initial_velocity,
        m.is_active,
        m.final_velocity,
        m.winning_side,
        m.version,
        p.total_up,
        p.total_down,
        p.participants
    FROM (SELECT * FROM flash_trend_markets FINAL) AS m
    LEFT JOIN (
        SELECT
            market_id,
            sumIf(amount, direction = 'up') AS total_up,
            sumIf(amount, direction = 'down') AS total_down,
            count() AS participants
        FROM flash_trend_positions
        GROUP BY market_id
    ) AS p ON p.market_id = m.id
";

pub async fn fetch_markets(client: &Client, tail: &str, binds: &[&str]) -> Result<Vec<FlashTrendMarket>> {
    let sql = format!("{} {}", FLASH_MARKET_SELECT, tail);
    let mut query = client.query(&sql);
    for value in binds {
        query = query.bind(*value);
    }
    query
        .fetch_all::<FlashMarketRow>()
        .await?
        .into_iter()
        .map(FlashMarketRow::into_market)
        .collect()
}

pub async fn fetch_stats_map(client: &Client) -> Result<HashMap<String, MarketStats>> {
    let mut cursor = client
        .query(
            "SELECT
                token_id,
                price,
                volume_24h,
                price_change_24h,
                market_cap,
                last_trade_at,
                updated_at
            FROM token_market_stats FINAL",
        )
        .fetch::<MarketStatsRecord>()?;

    let mut results = HashMap::new();
    while let Some(row) = cursor.next().await? {
        results.insert(row.token_id.clone(), row.into_stats());
    }
    Ok(results)
}

pub async fn fetch_trend_map(client: &Client) -> Result<HashMap<String, TrendState>> {
    let mut cursor = client
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
            FROM token_trend_state FINAL",
        )
        .fetch::<TrendStateRecord>()?;

    let mut results = HashMap::new();
    while let Some(row) = cursor.next().await? {
        results.insert(row.token_id.clone(), row.into_state()?);
    }
    Ok(results)
}
