use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::store::Store;
use crate::error::{MarketError, Result, ValidationError};
use crate::types::models::{
    Direction, FlashTrendMarket, FlashTrendPosition, MarketStats, Payout, Resolution, Token,
    TokenVolumeMinute, TradeEvent, TrendIndexHistory, TrendState,
};

#[derive(Default)]
struct MemoryState {
    tokens: HashMap<String, Token>,
    trades: HashMap<String, Vec<TradeEvent>>,
    minutes: HashMap<(String, i64), TokenVolumeMinute>,
    history: HashMap<String, Vec<TrendIndexHistory>>,
    markets: HashMap<String, FlashTrendMarket>,
    positions: HashMap<String, Vec<FlashTrendPosition>>,
    payouts: HashMap<String, Vec<Payout>>,
}

/// Single-process store. Each trait call holds the write lock for its
/// whole read-modify-write, which gives the same composition guarantees the
/// ClickHouse tables get from summing engines.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn backend_type(&self) -> &'static str {
        "memory"
    }

    async fn register_token(&self, token_id: &str, headline: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.tokens.contains_key(token_id) {
            return Ok(false);
        }
        state
            .tokens
            .insert(token_id.to_string(), Token::new(token_id, headline, now));
        Ok(true)
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Token>> {
        Ok(self.state.read().await.tokens.get(token_id).cloned())
    }

    async fn list_tokens(&self) -> Result<Vec<Token>> {
        let state = self.state.read().await;
        let mut tokens: Vec<Token> = state.tokens.values().cloned().collect();
        tokens.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tokens)
    }

    async fn insert_trade(&self, trade: &TradeEvent) -> Result<()> {
        let mut state = self.state.write().await;
        let trades = state.trades.entry(trade.token_id.clone()).or_default();
        let at = trades.partition_point(|t| t.timestamp <= trade.timestamp);
        trades.insert(at, trade.clone());
        Ok(())
    }

    async fn trades_since(&self, token_id: &str, since: DateTime<Utc>) -> Result<Vec<TradeEvent>> {
        let state = self.state.read().await;
        Ok(state
            .trades
            .get(token_id)
            .map(|trades| {
                trades
                    .iter()
                    .filter(|t| t.timestamp >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn increment_minute_volume(&self, delta: &TokenVolumeMinute) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (delta.token_id.clone(), delta.minute.timestamp_millis());
        state
            .minutes
            .entry(key)
            .and_modify(|bucket| bucket.absorb(delta))
            .or_insert_with(|| delta.clone());
        Ok(())
    }

    async fn minute_volumes(
        &self,
        token_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TokenVolumeMinute>> {
        let state = self.state.read().await;
        let mut buckets: Vec<TokenVolumeMinute> = state
            .minutes
            .values()
            .filter(|b| b.token_id == token_id && b.minute >= since)
            .cloned()
            .collect();
        buckets.sort_by_key(|b| b.minute);
        buckets.truncate(limit);
        Ok(buckets)
    }

    async fn write_market_stats(&self, token_id: &str, stats: &MarketStats, _now: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.write().await;
        let token = state
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()))?;
        token.stats = stats.clone();
        Ok(())
    }

    async fn write_trend_state(&self, token_id: &str, trend: &TrendState) -> Result<()> {
        let mut state = self.state.write().await;
        let token = state
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()))?;
        token.trend = trend.clone();
        Ok(())
    }

    async fn append_history(&self, entry: &TrendIndexHistory) -> Result<()> {
        let mut state = self.state.write().await;
        let history = state.history.entry(entry.token_id.clone()).or_default();
        let at = history.partition_point(|h| h.timestamp <= entry.timestamp);
        history.insert(at, entry.clone());
        Ok(())
    }

    async fn recent_history(&self, token_id: &str, limit: usize) -> Result<Vec<TrendIndexHistory>> {
        let state = self.state.read().await;
        Ok(state
            .history
            .get(token_id)
            .map(|history| history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn create_flash_market_if_idle(&self, market: &FlashTrendMarket) -> Result<bool> {
        let mut state = self.state.write().await;
        let busy = state
            .markets
            .values()
            .any(|m| m.parent_token_id == market.parent_token_id && m.is_active);
        if busy {
            return Ok(false);
        }
        state.markets.insert(market.id.clone(), market.clone());
        Ok(true)
    }

    async fn get_flash_market(&self, market_id: &str) -> Result<Option<FlashTrendMarket>> {
        Ok(self.state.read().await.markets.get(market_id).cloned())
    }

    async fn active_flash_markets(&self) -> Result<Vec<FlashTrendMarket>> {
        let state = self.state.read().await;
        let mut markets: Vec<FlashTrendMarket> =
            state.markets.values().filter(|m| m.is_active).cloned().collect();
        markets.sort_by(|a, b| b.start_timestamp.cmp(&a.start_timestamp));
        Ok(markets)
    }

    async fn due_flash_markets(&self, now: DateTime<Utc>) -> Result<Vec<FlashTrendMarket>> {
        let state = self.state.read().await;
        let mut markets: Vec<FlashTrendMarket> = state
            .markets
            .values()
            .filter(|m| m.is_active && m.end_timestamp <= now)
            .cloned()
            .collect();
        markets.sort_by_key(|m| m.end_timestamp);
        Ok(markets)
    }

    async fn insert_position(&self, position: &FlashTrendPosition) -> Result<()> {
        let mut state = self.state.write().await;
        let duplicate = state
            .positions
            .get(&position.market_id)
            .map(|existing| existing.iter().any(|p| p.wallet_address == position.wallet_address))
            .unwrap_or(false);
        if duplicate {
            return Err(ValidationError::DuplicatePosition(position.wallet_address.clone()).into());
        }

        let market = state
            .markets
            .get_mut(&position.market_id)
            .ok_or_else(|| ValidationError::UnknownMarket(position.market_id.clone()))?;
        if !market.is_active {
            return Err(ValidationError::MarketNotActive.into());
        }
        if position.created_at >= market.end_timestamp {
            return Err(ValidationError::MarketExpired.into());
        }
        let total = match position.direction {
            Direction::Up => &mut market.total_up_amount,
            Direction::Down => &mut market.total_down_amount,
        };
        *total = total
            .checked_add(position.amount)
            .ok_or_else(|| MarketError::invalid_input("market total overflow"))?;
        market.participant_count += 1;

        state
            .positions
            .entry(position.market_id.clone())
            .or_default()
            .push(position.clone());
        Ok(())
    }

    async fn positions(&self, market_id: &str) -> Result<Vec<FlashTrendPosition>> {
        let state = self.state.read().await;
        Ok(state.positions.get(market_id).cloned().unwrap_or_default())
    }

    async fn resolve_flash_market(&self, resolution: &Resolution, payouts: &[Payout]) -> Result<bool> {
        let mut state = self.state.write().await;
        let market = state
            .markets
            .get_mut(&resolution.market_id)
            .ok_or_else(|| ValidationError::UnknownMarket(resolution.market_id.clone()))?;
        if !market.is_active {
            return Ok(false);
        }
        if market.participant_count != resolution.participant_count {
            return Err(MarketError::ConcurrencyConflict(format!(
                "market {} took positions while resolving",
                resolution.market_id
            )));
        }
        market.is_active = false;
        market.final_velocity = Some(resolution.final_velocity);
        market.winning_side = Some(resolution.winning_side);
        state
            .payouts
            .insert(resolution.market_id.clone(), payouts.to_vec());
        Ok(true)
    }

    async fn payouts(&self, market_id: &str) -> Result<Vec<Payout>> {
        let state = self.state.read().await;
        Ok(state.payouts.get(market_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::models::{TradeSide, TrendFactors, TrendWeights};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn register_token_is_idempotent() {
        let store = MemoryStore::new();
        assert!(store.register_token("tok", "Headline", at(0)).await.unwrap());
        assert!(!store.register_token("tok", "Other", at(5)).await.unwrap());
        let token = store.get_token("tok").await.unwrap().unwrap();
        assert_eq!(token.headline, "Headline");
    }

    #[tokio::test]
    async fn history_reads_back_in_timestamp_order_unchanged() {
        let store = MemoryStore::new();
        let factors = TrendFactors {
            sentiment: 0.4,
            trading_velocity: 1.5,
            ..Default::default()
        };
        let weights = TrendWeights::default();
        // Appended out of order on purpose.
        for secs in [30, 10, 20, 0] {
            store
                .append_history(&TrendIndexHistory {
                    token_id: "tok".into(),
                    score: secs as f64,
                    factors,
                    weights,
                    timestamp: at(secs),
                })
                .await
                .unwrap();
        }

        let newest_first = store.recent_history("tok", 10).await.unwrap();
        let mut oldest_first = newest_first.clone();
        oldest_first.reverse();
        assert_eq!(oldest_first.len(), 4);
        assert!(oldest_first.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        for entry in &oldest_first {
            assert_eq!(entry.score, (entry.timestamp - at(0)).num_seconds() as f64);
            assert_eq!(entry.factors, factors);
            assert_eq!(entry.weights, weights);
        }
    }

    fn open_market(id: &str) -> FlashTrendMarket {
        FlashTrendMarket {
            id: id.into(),
            parent_token_id: "tok".into(),
            trend_snapshot: None,
            start_timestamp: at(0),
            end_timestamp: at(60),
            initial_velocity: 6.0,
            is_active: true,
            total_up_amount: 0,
            total_down_amount: 0,
            participant_count: 0,
            final_velocity: None,
            winning_side: None,
        }
    }

    fn stake(wallet: &str, created_at: DateTime<Utc>) -> FlashTrendPosition {
        FlashTrendPosition {
            id: format!("p-{}", wallet),
            market_id: "m1".into(),
            wallet_address: wallet.into(),
            direction: Direction::Up,
            amount: 50,
            created_at,
        }
    }

    fn void_resolution(participant_count: u64) -> Resolution {
        Resolution {
            market_id: "m1".into(),
            winning_side: Direction::Up,
            final_velocity: 0.0,
            resolved_at: at(61),
            void: true,
            participant_count,
        }
    }

    #[tokio::test]
    async fn positions_on_settled_or_closed_markets_are_refused() {
        let store = MemoryStore::new();
        store.create_flash_market_if_idle(&open_market("m1")).await.unwrap();

        let late = store.insert_position(&stake("late", at(60))).await.unwrap_err();
        assert!(matches!(late, MarketError::Validation(ValidationError::MarketExpired)));

        assert!(store.resolve_flash_market(&void_resolution(0), &[]).await.unwrap());
        let after = store.insert_position(&stake("after", at(59))).await.unwrap_err();
        assert!(matches!(after, MarketError::Validation(ValidationError::MarketNotActive)));

        let market = store.get_flash_market("m1").await.unwrap().unwrap();
        assert_eq!(market.total_up_amount, 0);
        assert_eq!(market.participant_count, 0);
        assert!(store.positions("m1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolution_over_stale_positions_is_a_conflict() {
        let store = MemoryStore::new();
        store.create_flash_market_if_idle(&open_market("m1")).await.unwrap();
        store.insert_position(&stake("alice", at(30))).await.unwrap();

        let err = store.resolve_flash_market(&void_resolution(0), &[]).await.unwrap_err();
        assert!(matches!(err, MarketError::ConcurrencyConflict(_)));
        assert!(store.get_flash_market("m1").await.unwrap().unwrap().is_active);
    }

    #[tokio::test]
    async fn concurrent_bucket_increments_compose() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let minute = at(0);
        let mut handles = Vec::new();
        for i in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let side = if i % 2 == 0 { TradeSide::Buy } else { TradeSide::Sell };
                let delta = TokenVolumeMinute::single_trade("tok", minute, 2.0, side);
                store.increment_minute_volume(&delta).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let buckets = store.minute_volumes("tok", minute, 10).await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].trade_count, 50);
        assert_eq!(buckets[0].volume_sol, 100.0);
        assert_eq!(buckets[0].buy_volume_sol, 50.0);
        assert_eq!(buckets[0].sell_volume_sol, 50.0);
    }
}
