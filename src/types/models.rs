use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

impl FromStr for TradeSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeSide::Buy),
            "SELL" => Ok(TradeSide::Sell),
            other => Err(format!("unknown trade side {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("unknown direction {:?}", other)),
        }
    }
}

/// One buy or sell coming off the chain listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub token_id: String,
    pub side: TradeSide,
    /// Token quantity.
    pub amount: f64,
    /// SOL per token.
    pub price_at_trade: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub trade_id: Option<String>,
    #[serde(default)]
    pub wallet: Option<String>,
}

impl TradeEvent {
    /// SOL notional of the trade.
    pub fn notional(&self) -> f64 {
        self.amount * self.price_at_trade
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketStats {
    pub price: f64,
    #[serde(rename = "volume24h")]
    pub volume_24h: f64,
    #[serde(rename = "priceChange24h")]
    pub price_change_24h: f64,
    #[serde(rename = "marketCap")]
    pub market_cap: f64,
    #[serde(rename = "lastTradeAt")]
    pub last_trade_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendState {
    #[serde(rename = "trendIndexScore")]
    pub score: f64,
    /// Score points per minute.
    #[serde(rename = "trendVelocity")]
    pub velocity: f64,
    #[serde(rename = "sentimentScore")]
    pub sentiment: f64,
    #[serde(rename = "mentionVelocity")]
    pub mention_velocity: f64,
    #[serde(rename = "holderMomentum")]
    pub holder_momentum: f64,
    #[serde(rename = "crossMarketCorr")]
    pub cross_market_corr: f64,
    #[serde(rename = "trendFactorWeights")]
    pub weights: Option<TrendWeights>,
    #[serde(rename = "lastTrendUpdate")]
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub headline: String,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub stats: MarketStats,
    #[serde(flatten)]
    pub trend: TrendState,
}

impl Token {
    pub fn new(id: impl Into<String>, headline: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            headline: headline.into(),
            created_at,
            stats: MarketStats::default(),
            trend: TrendState::default(),
        }
    }
}

/// Raw signal values feeding the trend score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendFactors {
    /// -1..=1
    pub sentiment: f64,
    /// Trades per minute.
    pub trading_velocity: f64,
    /// Deviation ratio of recent volume from the rolling mean.
    pub volume_spike: f64,
    pub price_momentum: f64,
    /// Comments plus likes per hour.
    pub social_activity: f64,
    pub holder_momentum: f64,
    /// -1..=1
    #[serde(rename = "crossMarketCorr", alias = "crossMarketCorrelation")]
    pub cross_market_corr: f64,
}

impl TrendFactors {
    /// Σ factor × weight. Weights are taken as given.
    pub fn weighted_sum(&self, weights: &TrendWeights) -> f64 {
        self.sentiment * weights.sentiment
            + self.trading_velocity * weights.trading_velocity
            + self.volume_spike * weights.volume_spike
            + self.price_momentum * weights.price_momentum
            + self.social_activity * weights.social_activity
            + self.holder_momentum * weights.holder_momentum
            + self.cross_market_corr * weights.cross_market_corr
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendWeights {
    pub sentiment: f64,
    pub trading_velocity: f64,
    pub volume_spike: f64,
    pub price_momentum: f64,
    pub social_activity: f64,
    pub holder_momentum: f64,
    #[serde(rename = "crossMarketCorr", alias = "crossMarketCorrelation")]
    pub cross_market_corr: f64,
}

impl Default for TrendWeights {
    fn default() -> Self {
        Self {
            sentiment: 0.25,
            trading_velocity: 0.20,
            volume_spike: 0.20,
            price_momentum: 0.15,
            social_activity: 0.10,
            holder_momentum: 0.05,
            cross_market_corr: 0.05,
        }
    }
}

/// Output of a factor provider for one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalReading {
    #[serde(flatten)]
    pub factors: TrendFactors,
    pub weights: TrendWeights,
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

/// Immutable snapshot appended on every scoring pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendIndexHistory {
    pub token_id: String,
    pub score: f64,
    pub factors: TrendFactors,
    pub weights: TrendWeights,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenVolumeMinute {
    pub token_id: String,
    pub minute: DateTime<Utc>,
    pub volume_sol: f64,
    pub trade_count: u64,
    pub buy_volume_sol: f64,
    pub sell_volume_sol: f64,
}

impl TokenVolumeMinute {
    /// The increment a single trade contributes to its bucket.
    pub fn single_trade(
        token_id: &str,
        minute: DateTime<Utc>,
        notional: f64,
        side: TradeSide,
    ) -> Self {
        let (buy, sell) = match side {
            TradeSide::Buy => (notional, 0.0),
            TradeSide::Sell => (0.0, notional),
        };
        Self {
            token_id: token_id.to_string(),
            minute,
            volume_sol: notional,
            trade_count: 1,
            buy_volume_sol: buy,
            sell_volume_sol: sell,
        }
    }

    pub fn absorb(&mut self, delta: &TokenVolumeMinute) {
        self.volume_sol += delta.volume_sol;
        self.trade_count += delta.trade_count;
        self.buy_volume_sol += delta.buy_volume_sol;
        self.sell_volume_sol += delta.sell_volume_sol;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketState {
    Active,
    Expired,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashTrendMarket {
    pub id: String,
    pub parent_token_id: String,
    pub trend_snapshot: Option<TrendWeights>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    /// Score points per second at the spike that opened the market.
    pub initial_velocity: f64,
    pub is_active: bool,
    /// Lamports.
    pub total_up_amount: u64,
    /// Lamports.
    pub total_down_amount: u64,
    pub participant_count: u64,
    pub final_velocity: Option<f64>,
    pub winning_side: Option<Direction>,
}

impl FlashTrendMarket {
    pub fn state_at(&self, now: DateTime<Utc>) -> MarketState {
        if !self.is_active {
            MarketState::Resolved
        } else if now >= self.end_timestamp {
            MarketState::Expired
        } else {
            MarketState::Active
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashTrendPosition {
    pub id: String,
    pub market_id: String,
    pub wallet_address: String,
    pub direction: Direction,
    /// Lamports.
    pub amount: u64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payout {
    pub market_id: String,
    pub position_id: String,
    pub wallet_address: String,
    pub direction: Direction,
    pub stake: u64,
    pub payout: u64,
    pub profit_loss: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub market_id: String,
    pub winning_side: Direction,
    pub final_velocity: f64,
    pub resolved_at: DateTime<Utc>,
    /// True when nobody backed the winning side; nothing is paid out.
    pub void: bool,
    /// Positions the payouts were computed over. The store refuses to settle
    /// if the market has taken more since.
    pub participant_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSummary {
    pub direction: Direction,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveFlashMarket {
    #[serde(flatten)]
    pub market: FlashTrendMarket,
    pub positions: Vec<PositionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPoint {
    pub score: f64,
    pub timestamp: DateTime<Utc>,
    pub factors: TrendFactors,
    pub weights: TrendWeights,
}

impl From<TrendIndexHistory> for HistoryPoint {
    fn from(entry: TrendIndexHistory) -> Self {
        Self {
            score: entry.score,
            timestamp: entry.timestamp,
            factors: entry.factors,
            weights: entry.weights,
        }
    }
}

/// Read model served to external callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendIndexView {
    pub token_id: String,
    pub headline: String,
    pub score: f64,
    /// Score points per minute.
    pub velocity: f64,
    pub confidence: f64,
    pub factors: TrendFactors,
    pub weights: Option<TrendWeights>,
    pub last_update: Option<DateTime<Utc>>,
    pub history: Vec<HistoryPoint>,
    /// Set when a refresh was requested but the provider could not answer.
    pub stale: bool,
}
