pub const TOKENS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS tokens (
    token_id String,
    headline String,
    created_at DateTime64(3, 'UTC'),
    PRIMARY KEY (token_id)
) ENGINE = ReplacingMergeTree
"#;

pub const TOKEN_MARKET_STATS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS token_market_stats (
    token_id String,
    price Float64,
    volume_24h Float64,
    price_change_24h Float64,
    market_cap Float64,
    last_trade_at Int64,
    updated_at DateTime64(3, 'UTC'),
    PRIMARY KEY (token_id)
) ENGINE = ReplacingMergeTree(updated_at)
"#;

pub const TOKEN_TREND_STATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS token_trend_state (
    token_id String,
    score Float64,
    velocity Float64,
    sentiment Float64,
    mention_velocity Float64,
    holder_momentum Float64,
    cross_market_corr Float64,
    weights String,
    last_update DateTime64(3, 'UTC'),
    PRIMARY KEY (token_id)
) ENGINE = ReplacingMergeTree(last_update)
"#;

pub const TRADES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trades (
    token_id String,
    trade_id String,
    side LowCardinality(String),
    wallet String,
    amount Float64,
    price_at_trade Float64,
    timestamp DateTime64(3, 'UTC'),
    PRIMARY KEY (token_id, timestamp)
) ENGINE = MergeTree()
"#;

// Each trade inserts a delta row; background merges fold rows with the same
// key, and readers always sum() so unmerged parts give the same answer.
pub const TOKEN_VOLUME_MINUTE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS token_volume_minute (
    token_id String,
    minute DateTime('UTC'),
    volume_sol Float64,
    trade_count UInt64,
    buy_volume_sol Float64,
    sell_volume_sol Float64,
    PRIMARY KEY (token_id, minute)
) ENGINE = SummingMergeTree((volume_sol, trade_count, buy_volume_sol, sell_volume_sol))
"#;

pub const TREND_INDEX_HISTORY_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS trend_index_history (
    token_id String,
    score Float64,
    factors String,
    weights String,
    timestamp DateTime64(3, 'UTC'),
    PRIMARY KEY (token_id, timestamp)
) ENGINE = MergeTree()
"#;

pub const FLASH_TREND_MARKETS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS flash_trend_markets (
    id String,
    parent_token_id String,
    trend_snapshot String,
    start_timestamp DateTime64(3, 'UTC'),
    end_timestamp DateTime64(3, 'UTC'),
    initial_velocity Float64,
    is_active UInt8,
    final_velocity Float64,
    winning_side LowCardinality(String),
    version UInt64,
    PRIMARY KEY (id)
) ENGINE = ReplacingMergeTree(version)
"#;

pub const FLASH_TREND_POSITIONS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS flash_trend_positions (
    id String,
    market_id String,
    wallet_address String,
    direction LowCardinality(String),
    amount UInt64,
    created_at DateTime64(3, 'UTC'),
    PRIMARY KEY (market_id, wallet_address)
) ENGINE = MergeTree()
"#;

pub const FLASH_TREND_PAYOUTS_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS flash_trend_payouts (
    market_id String,
    position_id String,
    wallet_address String,
    direction LowCardinality(String),
    stake UInt64,
    payout UInt64,
    profit_loss Int64,
    resolved_at DateTime64(3, 'UTC'),
    PRIMARY KEY (market_id, position_id)
) ENGINE = MergeTree()
"#;
