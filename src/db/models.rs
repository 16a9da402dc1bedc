use chrono::{DateTime, Utc};
use clickhouse::Row;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{MarketError, Result};
use crate::types::models::{
    FlashTrendMarket, FlashTrendPosition, MarketStats, Payout, TokenVolumeMinute, TradeEvent,
    TrendIndexHistory, TrendState, TrendWeights,
};

pub fn to_offset(ts: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp_nanos(ts.timestamp_millis() as i128 * 1_000_000)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

pub fn from_offset(ts: OffsetDateTime) -> DateTime<Utc> {
    let millis = (ts.unix_timestamp_nanos() / 1_000_000) as i64;
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn parse_column<T: std::str::FromStr<Err = String>>(column: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|e: String| MarketError::Storage(format!("{}: {}", column, e)))
}

fn weights_to_column(weights: &Option<TrendWeights>) -> Result<String> {
    match weights {
        Some(w) => Ok(serde_json::to_string(w)?),
        None => Ok(String::new()),
    }
}

fn weights_from_column(value: &str) -> Result<Option<TrendWeights>> {
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(value)?))
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub headline: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct MarketStatsRecord {
    pub token_id: String,
    pub price: f64,
    pub volume_24h: f64,
    pub price_change_24h: f64,
    pub market_cap: f64,
    /// Unix millis, 0 when the token never traded.
    pub last_trade_at: i64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub updated_at: OffsetDateTime,
}

impl MarketStatsRecord {
    pub fn new(token_id: &str, stats: &MarketStats, now: DateTime<Utc>) -> Self {
        Self {
            token_id: token_id.to_string(),
            price: stats.price,
            volume_24h: stats.volume_24h,
            price_change_24h: stats.price_change_24h,
            market_cap: stats.market_cap,
            last_trade_at: stats.last_trade_at.map(|t| t.timestamp_millis()).unwrap_or(0),
            updated_at: to_offset(now),
        }
    }

    pub fn into_stats(self) -> MarketStats {
        MarketStats {
            price: self.price,
            volume_24h: self.volume_24h,
            price_change_24h: self.price_change_24h,
            market_cap: self.market_cap,
            last_trade_at: match self.last_trade_at {
                0 => None,
                millis => DateTime::from_timestamp_millis(millis),
            },
        }
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct TrendStateRecord {
    pub token_id: String,
    pub score: f64,
    pub velocity: f64,
    pub sentiment: f64,
    pub mention_velocity: f64,
    pub holder_momentum: f64,
    pub cross_market_corr: f64,
    pub weights: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub last_update: OffsetDateTime,
}

impl TrendStateRecord {
    pub fn new(token_id: &str, state: &TrendState) -> Result<Self> {
        Ok(Self {
            token_id: token_id.to_string(),
            score: state.score,
            velocity: state.velocity,
            sentiment: state.sentiment,
            mention_velocity: state.mention_velocity,
            holder_momentum: state.holder_momentum,
            cross_market_corr: state.cross_market_corr,
            weights: weights_to_column(&state.weights)?,
            last_update: to_offset(state.last_update.unwrap_or_default()),
        })
    }

    pub fn into_state(self) -> Result<TrendState> {
        let last_update = from_offset(self.last_update);
        Ok(TrendState {
            score: self.score,
            velocity: self.velocity,
            sentiment: self.sentiment,
            mention_velocity: self.mention_velocity,
            holder_momentum: self.holder_momentum,
            cross_market_corr: self.cross_market_corr,
            weights: weights_from_column(&self.weights)?,
            last_update: (last_update.timestamp_millis() != 0).then_some(last_update),
        })
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct TradeRecord {
    pub token_id: String,
    pub trade_id: String,
    pub side: String,
    pub wallet: String,
    pub amount: f64,
    pub price_at_trade: f64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub timestamp: OffsetDateTime,
}

impl From<&TradeEvent> for TradeRecord {
    fn from(trade: &TradeEvent) -> Self {
        Self {
            token_id: trade.token_id.clone(),
            trade_id: trade.trade_id.clone().unwrap_or_default(),
            side: trade.side.as_str().to_string(),
            wallet: trade.wallet.clone().unwrap_or_default(),
            amount: trade.amount,
            price_at_trade: trade.price_at_trade,
            timestamp: to_offset(trade.timestamp),
        }
    }
}

impl TradeRecord {
    pub fn into_event(self) -> Result<TradeEvent> {
        Ok(TradeEvent {
            side: parse_column("side", &self.side)?,
            token_id: self.token_id,
            amount: self.amount,
            price_at_trade: self.price_at_trade,
            timestamp: from_offset(self.timestamp),
            trade_id: (!self.trade_id.is_empty()).then_some(self.trade_id),
            wallet: (!self.wallet.is_empty()).then_some(self.wallet),
        })
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct VolumeMinuteRecord {
    pub token_id: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    pub minute: OffsetDateTime,
    pub volume_sol: f64,
    pub trade_count: u64,
    pub buy_volume_sol: f64,
    pub sell_volume_sol: f64,
}

impl From<&TokenVolumeMinute> for VolumeMinuteRecord {
    fn from(bucket: &TokenVolumeMinute) -> Self {
        Self {
            token_id: bucket.token_id.clone(),
            minute: to_offset(bucket.minute),
            volume_sol: bucket.volume_sol,
            trade_count: bucket.trade_count,
            buy_volume_sol: bucket.buy_volume_sol,
            sell_volume_sol: bucket.sell_volume_sol,
        }
    }
}

impl From<VolumeMinuteRecord> for TokenVolumeMinute {
    fn from(record: VolumeMinuteRecord) -> Self {
        Self {
            token_id: record.token_id,
            minute: from_offset(record.minute),
            volume_sol: record.volume_sol,
            trade_count: record.trade_count,
            buy_volume_sol: record.buy_volume_sol,
            sell_volume_sol: record.sell_volume_sol,
        }
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub token_id: String,
    pub score: f64,
    pub factors: String,
    pub weights: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub timestamp: OffsetDateTime,
}

impl HistoryRecord {
    pub fn new(entry: &TrendIndexHistory) -> Result<Self> {
        Ok(Self {
            token_id: entry.token_id.clone(),
            score: entry.score,
            factors: serde_json::to_string(&entry.factors)?,
            weights: serde_json::to_string(&entry.weights)?,
            timestamp: to_offset(entry.timestamp),
        })
    }

    pub fn into_entry(self) -> Result<TrendIndexHistory> {
        Ok(TrendIndexHistory {
            factors: serde_json::from_str(&self.factors)?,
            weights: serde_json::from_str(&self.weights)?,
            token_id: self.token_id,
            score: self.score,
            timestamp: from_offset(self.timestamp),
        })
    }
}

/// Write shape of `flash_trend_markets`. Totals are not stored; they are
/// summed from `flash_trend_positions` on read.
#[derive(Debug, Row, Serialize, Deserialize)]
pub struct FlashMarketRecord {
    pub id: String,
    pub parent_token_id: String,
    pub trend_snapshot: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub start_timestamp: OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub end_timestamp: OffsetDateTime,
    pub initial_velocity: f64,
    pub is_active: u8,
    pub final_velocity: f64,
    pub winning_side: String,
    pub version: u64,
}

impl FlashMarketRecord {
    pub fn new(market: &FlashTrendMarket, version: u64) -> Result<Self> {
        Ok(Self {
            id: market.id.clone(),
            parent_token_id: market.parent_token_id.clone(),
            trend_snapshot: weights_to_column(&market.trend_snapshot)?,
            start_timestamp: to_offset(market.start_timestamp),
            end_timestamp: to_offset(market.end_timestamp),
            initial_velocity: market.initial_velocity,
            is_active: market.is_active as u8,
            final_velocity: market.final_velocity.unwrap_or(0.0),
            winning_side: market
                .winning_side
                .map(|side| side.as_str().to_string())
                .unwrap_or_default(),
            version,
        })
    }
}

/// Read shape: the market row joined with its position totals.
#[derive(Debug, Row, Deserialize)]
pub struct FlashMarketRow {
    pub id: String,
    pub parent_token_id: String,
    pub trend_snapshot: String,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub start_timestamp: OffsetDateTime,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub end_timestamp: OffsetDateTime,
    pub initial_velocity: f64,
    pub is_active: u8,
    pub final_velocity: f64,
    pub winning_side: String,
    pub version: u64,
    pub total_up_amount: u64,
    pub total_down_amount: u64,
    pub participant_count: u64,
}

impl FlashMarketRow {
    pub fn into_market(self) -> Result<FlashTrendMarket> {
        let is_active = self.is_active != 0;
        let winning_side = if self.winning_side.is_empty() {
            None
        } else {
            Some(parse_column("winning_side", &self.winning_side)?)
        };
        Ok(FlashTrendMarket {
            trend_snapshot: weights_from_column(&self.trend_snapshot)?,
            id: self.id,
            parent_token_id: self.parent_token_id,
            start_timestamp: from_offset(self.start_timestamp),
            end_timestamp: from_offset(self.end_timestamp),
            initial_velocity: self.initial_velocity,
            is_active,
            total_up_amount: self.total_up_amount,
            total_down_amount: self.total_down_amount,
            participant_count: self.participant_count,
            final_velocity: (!is_active).then_some(self.final_velocity),
            winning_side,
        })
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct PositionRecord {
    pub id: String,
    pub market_id: String,
    pub wallet_address: String,
    pub direction: String,
    pub amount: u64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub created_at: OffsetDateTime,
}

impl From<&FlashTrendPosition> for PositionRecord {
    fn from(position: &FlashTrendPosition) -> Self {
        Self {
            id: position.id.clone(),
            market_id: position.market_id.clone(),
            wallet_address: position.wallet_address.clone(),
            direction: position.direction.as_str().to_string(),
            amount: position.amount,
            created_at: to_offset(position.created_at),
        }
    }
}

impl PositionRecord {
    pub fn into_position(self) -> Result<FlashTrendPosition> {
        Ok(FlashTrendPosition {
            direction: parse_column("direction", &self.direction)?,
            id: self.id,
            market_id: self.market_id,
            wallet_address: self.wallet_address,
            amount: self.amount,
            created_at: from_offset(self.created_at),
        })
    }
}

#[derive(Debug, Row, Serialize, Deserialize)]
pub struct PayoutRecord {
    pub market_id: String,
    pub position_id: String,
    pub wallet_address: String,
    pub direction: String,
    pub stake: u64,
    pub payout: u64,
    pub profit_loss: i64,
    #[serde(with = "clickhouse::serde::time::datetime64::millis")]
    pub resolved_at: OffsetDateTime,
}

impl PayoutRecord {
    pub fn new(payout: &Payout, resolved_at: DateTime<Utc>) -> Self {
        Self {
            market_id: payout.market_id.clone(),
            position_id: payout.position_id.clone(),
            wallet_address: payout.wallet_address.clone(),
            direction: payout.direction.as_str().to_string(),
            stake: payout.stake,
            payout: payout.payout,
            profit_loss: payout.profit_loss,
            resolved_at: to_offset(resolved_at),
        }
    }

    pub fn into_payout(self) -> Result<Payout> {
        Ok(Payout {
            direction: parse_column("direction", &self.direction)?,
            market_id: self.market_id,
            position_id: self.position_id,
            wallet_address: self.wallet_address,
            stake: self.stake,
            payout: self.payout,
            profit_loss: self.profit_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::models::TradeSide;
    use chrono::TimeZone;

    #[test]
    fn timestamps_survive_offset_conversion_at_millisecond_precision() {
        let ts = Utc.timestamp_millis_opt(1_700_000_123_456).unwrap();
        assert_eq!(from_offset(to_offset(ts)), ts);
    }

    #[test]
    fn trade_without_optional_ids_maps_to_empty_columns_and_back() {
        let trade = TradeEvent {
            token_id: "tok".into(),
            side: TradeSide::Sell,
            amount: 3.0,
            price_at_trade: 0.5,
            timestamp: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            trade_id: None,
            wallet: None,
        };
        let record = TradeRecord::from(&trade);
        assert_eq!(record.side, "SELL");
        assert!(record.trade_id.is_empty());
        assert_eq!(record.into_event().unwrap(), trade);
    }

    #[test]
    fn unknown_direction_column_is_a_storage_error() {
        let record = PositionRecord {
            id: "p".into(),
            market_id: "m".into(),
            wallet_address: "w".into(),
            direction: "sideways".into(),
            amount: 1,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(matches!(record.into_position(), Err(MarketError::Storage(_))));
    }
}
