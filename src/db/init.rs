use anyhow::Result;
use clickhouse::Client;
use crate::db::schema::{
    FLASH_TREND_MARKETS_SQL,
    FLASH_TREND_PAYOUTS_SQL,
    FLASH_TREND_POSITIONS_SQL,
    TOKENS_SQL,
    TOKEN_MARKET_STATS_SQL,
    TOKEN_TREND_STATE_SQL,
    TOKEN_VOLUME_MINUTE_SQL,
    TRADES_SQL,
    TREND_INDEX_HISTORY_SQL,
};

pub async fn init_database(client: &Client) -> Result<()> {
    tracing::info!("Initializing database tables...");

    // Create tables if they don't exist (won't drop existing data)
    for ddl in [
        TOKENS_SQL,
        TOKEN_MARKET_STATS_SQL,
        TOKEN_TREND_STATE_SQL,
        TRADES_SQL,
        TOKEN_VOLUME_MINUTE_SQL,
        TREND_INDEX_HISTORY_SQL,
        FLASH_TREND_MARKETS_SQL,
        FLASH_TREND_POSITIONS_SQL,
        FLASH_TREND_PAYOUTS_SQL,
    ] {
        client.query(ddl).execute().await?;
    }

    Ok(())
}
