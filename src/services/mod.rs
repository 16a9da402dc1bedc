pub mod flash_market;
pub mod monitor;
pub mod provider;
pub mod spike;
pub mod trend;
pub mod volume;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::db::Store;
use crate::error::{MarketError, Result};
use crate::types::models::{FlashTrendMarket, Token, TradeEvent};
use flash_market::FlashMarketLifecycle;
use provider::FactorProvider;
use spike::FlashSpikeDetector;
use trend::TrendScorer;
use volume::{IngestOutcome, VolumeAggregator};

/// Wires the aggregator, scorer, detector and market lifecycle over one store.
pub struct MarketEngine {
    pub store: Arc<dyn Store>,
    pub volume: VolumeAggregator,
    pub trend: TrendScorer,
    pub spikes: FlashSpikeDetector,
    pub markets: FlashMarketLifecycle,
}

impl MarketEngine {
    /// The receiver yields a token id after every trend history append.
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn FactorProvider>,
        config: &Config,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            volume: VolumeAggregator::new(store.clone(), config.trade_dedup_capacity),
            trend: TrendScorer::new(store.clone(), provider).with_history_listener(tx),
            spikes: FlashSpikeDetector::new(store.clone()),
            markets: FlashMarketLifecycle::new(store.clone()),
            store,
        };
        (Arc::new(engine), rx)
    }

    pub async fn register_token(&self, token_id: &str, headline: &str) -> Result<Token> {
        let token_id = token_id.trim();
        if token_id.is_empty() {
            return Err(MarketError::invalid_input("token id is required"));
        }
        if self.store.register_token(token_id, headline, Utc::now()).await? {
            tracing::info!("Registered token {} ({})", token_id, headline);
        }
        self.store
            .get_token(token_id)
            .await?
            .ok_or_else(|| MarketError::Storage(format!("token {} missing after registration", token_id)))
    }

    pub async fn record_trade(&self, event: &TradeEvent) -> Result<IngestOutcome> {
        self.record_trade_at(event, Utc::now()).await
    }

    /// Ingests the trade and marks the token for rescoring.
    pub async fn record_trade_at(&self, event: &TradeEvent, now: DateTime<Utc>) -> Result<IngestOutcome> {
        let outcome = self.volume.record_trade_at(event, now).await?;
        if !outcome.duplicate {
            self.trend.invalidate(&event.token_id).await;
        }
        Ok(outcome)
    }

    /// Runs the spike check for a token that just got a history entry and
    /// opens a flash market when it fires.
    pub async fn handle_history_appended_at(
        &self,
        token_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FlashTrendMarket>> {
        let check = self.spikes.detect_velocity_spike_at(token_id, now).await?;
        if !check.detected {
            return Ok(None);
        }
        self.markets
            .create_flash_market_at(token_id, check.velocity_per_second, now)
            .await
    }

    /// Timer-driven spike pass over the hottest tokens. Returns how many
    /// markets were opened.
    pub async fn scan_for_spikes_at(&self, min_score: f64, now: DateTime<Utc>) -> Result<usize> {
        let mut created = 0;
        for token_id in self.spikes.scan_candidates(min_score).await? {
            match self.handle_history_appended_at(&token_id, now).await {
                Ok(Some(_)) => created += 1,
                Ok(None) => {}
                Err(e) => tracing::error!("Spike check failed for {}: {}", token_id, e),
            }
        }
        Ok(created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::services::provider::ScriptedProvider;
    use crate::types::models::{SignalReading, TradeSide, TrendFactors, TrendWeights};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn reading(sentiment: f64) -> SignalReading {
        SignalReading {
            factors: TrendFactors {
                sentiment,
                ..Default::default()
            },
            weights: TrendWeights::default(),
            confidence: 0.9,
            reasoning: String::new(),
        }
    }

    async fn engine() -> (Arc<ScriptedProvider>, Arc<MarketEngine>, mpsc::UnboundedReceiver<String>) {
        let store = Arc::new(MemoryStore::new());
        store.register_token("tok", "Story", at(-600)).await.unwrap();
        let provider = Arc::new(ScriptedProvider::new());
        let (engine, rx) = MarketEngine::new(store, provider.clone(), &Config::default());
        (provider, engine, rx)
    }

    #[tokio::test]
    async fn spikes_within_cooldown_open_one_market() {
        let (provider, engine, mut rx) = engine().await;

        // Scores 0, 20, 40 one second apart: 20 points/s.
        for (secs, sentiment) in [(0, 0.0), (1, 0.8), (2, 1.6)] {
            provider.set("tok", reading(sentiment));
            engine.trend.compute_trend_at("tok", at(secs)).await.unwrap();
        }
        assert_eq!(rx.recv().await.as_deref(), Some("tok"));

        let first = engine.handle_history_appended_at("tok", at(2)).await.unwrap();
        assert!(first.is_some());

        provider.set("tok", reading(3.2));
        engine.trend.compute_trend_at("tok", at(3)).await.unwrap();
        let second = engine.handle_history_appended_at("tok", at(3)).await.unwrap();
        assert!(second.is_none());

        assert_eq!(engine.markets.active_flash_markets().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trades_invalidate_cached_trend() {
        let (provider, engine, _rx) = engine().await;
        provider.set("tok", reading(0.4));
        engine.trend.update_market_trend_at("tok", false, at(0)).await.unwrap();

        let trade = TradeEvent {
            token_id: "tok".into(),
            side: TradeSide::Buy,
            amount: 2.0,
            price_at_trade: 0.5,
            timestamp: at(10),
            trade_id: Some("t-1".into()),
            wallet: None,
        };
        let outcome = engine.record_trade_at(&trade, at(10)).await.unwrap();
        assert!(!outcome.duplicate);

        engine.trend.update_market_trend_at("tok", false, at(20)).await.unwrap();
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn register_rejects_blank_ids() {
        let (_provider, engine, _rx) = engine().await;
        assert!(engine.register_token("  ", "Nothing").await.is_err());
        let token = engine.register_token("tok", "Other headline").await.unwrap();
        assert_eq!(token.headline, "Story");
    }
}
