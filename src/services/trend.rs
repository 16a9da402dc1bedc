use chrono::{DateTime, Duration, Utc};
use futures::stream::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::db::Store;
use crate::error::{MarketError, Result, ValidationError};
use crate::services::provider::FactorProvider;
use crate::types::models::{
    HistoryPoint, Token, TrendFactors, TrendIndexHistory, TrendIndexView, TrendState, TrendWeights,
};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 100.0;
/// Coarse read-model confidence: any non-zero score reports this.
pub const SCORED_CONFIDENCE: f64 = 0.8;
pub const READ_MODEL_HISTORY: usize = 24;
const RESULT_CACHE_TTL_MINUTES: i64 = 5;

/// `clamp(Σ factor × weight × 100, 0, 100)`. Non-finite sums score 0.
pub fn compute_score(factors: &TrendFactors, weights: &TrendWeights) -> f64 {
    let raw = factors.weighted_sum(weights) * 100.0;
    if raw.is_finite() {
        raw.clamp(SCORE_MIN, SCORE_MAX)
    } else {
        SCORE_MIN
    }
}

/// Score change between the two newest entries per `unit_seconds`. Zero with
/// fewer than two entries or a non-positive time delta. Sorts its own copy
/// so callers may pass history in any order.
fn velocity_over(history: &[TrendIndexHistory], unit_seconds: f64) -> f64 {
    if history.len() < 2 {
        return 0.0;
    }
    let mut newest: Vec<&TrendIndexHistory> = history.iter().collect();
    newest.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    let (h0, h1) = (newest[0], newest[1]);

    let elapsed_ms = (h0.timestamp - h1.timestamp).num_milliseconds();
    if elapsed_ms <= 0 {
        return 0.0;
    }
    (h0.score - h1.score) / (elapsed_ms as f64 / 1000.0 / unit_seconds)
}

/// Display velocity, score points per minute.
pub fn velocity_per_minute(history: &[TrendIndexHistory]) -> f64 {
    velocity_over(history, 60.0)
}

/// Spike velocity, score points per second.
pub fn velocity_per_second(history: &[TrendIndexHistory]) -> f64 {
    velocity_over(history, 1.0)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendResult {
    pub token_id: String,
    pub score: f64,
    /// Score points per minute.
    pub velocity: f64,
    pub factors: TrendFactors,
    pub weights: TrendWeights,
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub selected: usize,
    pub updated: usize,
    pub skipped: usize,
}

struct CachedTrend {
    result: TrendResult,
    cached_at: DateTime<Utc>,
}

pub struct TrendScorer {
    store: Arc<dyn Store>,
    provider: Arc<dyn FactorProvider>,
    cache: RwLock<HashMap<String, CachedTrend>>,
    /// One scoring pass per token at a time within this process.
    token_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    appended: Option<mpsc::UnboundedSender<String>>,
}

impl TrendScorer {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn FactorProvider>) -> Self {
        Self {
            store,
            provider,
            cache: RwLock::new(HashMap::new()),
            token_locks: Mutex::new(HashMap::new()),
            appended: None,
        }
    }

    /// Every history append sends the token id down `tx`.
    pub fn with_history_listener(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.appended = Some(tx);
        self
    }

    pub async fn compute_trend(&self, token_id: &str) -> Result<TrendResult> {
        self.compute_trend_at(token_id, Utc::now()).await
    }

    /// Scores one token and appends a history entry. A provider failure
    /// leaves the token untouched and surfaces as `ProviderUnavailable`.
    pub async fn compute_trend_at(&self, token_id: &str, now: DateTime<Utc>) -> Result<TrendResult> {
        let token = self.require_token(token_id).await?;
        let token_lock = self.token_lock(token_id).await;
        // Held from the history read through the state write.
        let _scoring = token_lock.lock().await;

        let reading = self.provider.get_factors(token_id).await.map_err(|e| match e {
            MarketError::ProviderUnavailable(_) => e,
            other => MarketError::ProviderUnavailable(other.to_string()),
        })?;
        let score = compute_score(&reading.factors, &reading.weights);

        let mut history = self.store.recent_history(token_id, 1).await?;
        let timestamp = match history.first() {
            Some(last) if last.timestamp >= now => {
                tracing::warn!(
                    "Clock for {} is behind its last history entry ({} >= {}), nudging forward",
                    token_id,
                    last.timestamp,
                    now
                );
                last.timestamp + Duration::milliseconds(1)
            }
            _ => now,
        };

        let entry = TrendIndexHistory {
            token_id: token_id.to_string(),
            score,
            factors: reading.factors,
            weights: reading.weights,
            timestamp,
        };
        self.store.append_history(&entry).await?;
        history.insert(0, entry);
        let velocity = velocity_per_minute(&history);

        let state = TrendState {
            score,
            velocity,
            sentiment: reading.factors.sentiment,
            mention_velocity: reading.factors.social_activity,
            holder_momentum: reading.factors.holder_momentum,
            cross_market_corr: reading.factors.cross_market_corr,
            weights: Some(reading.weights),
            last_update: Some(timestamp),
        };
        self.store.write_trend_state(&token.id, &state).await?;

        if let Some(tx) = &self.appended {
            // Receiver gone means the monitor is shutting down.
            let _ = tx.send(token_id.to_string());
        }

        tracing::info!(
            "Trend updated for {}: score={:.2} velocity={:.3}/min confidence={:.2}",
            token_id,
            score,
            velocity,
            reading.confidence
        );

        Ok(TrendResult {
            token_id: token_id.to_string(),
            score,
            velocity,
            factors: reading.factors,
            weights: reading.weights,
            confidence: reading.confidence,
            reasoning: reading.reasoning,
            timestamp,
        })
    }

    async fn token_lock(&self, token_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.token_locks.lock().await;
        locks.entry(token_id.to_string()).or_default().clone()
    }

    pub async fn update_market_trend(&self, token_id: &str, force: bool) -> Result<TrendResult> {
        self.update_market_trend_at(token_id, force, Utc::now()).await
    }

    /// Cached within the TTL unless `force` or invalidated by a trade.
    pub async fn update_market_trend_at(
        &self,
        token_id: &str,
        force: bool,
        now: DateTime<Utc>,
    ) -> Result<TrendResult> {
        if !force {
            if let Some(cached) = self.cached(token_id, now).await {
                tracing::debug!("Using cached trend result for {}", token_id);
                return Ok(cached);
            }
        }

        let result = self.compute_trend_at(token_id, now).await?;
        self.cache.write().await.insert(
            token_id.to_string(),
            CachedTrend {
                result: result.clone(),
                cached_at: now,
            },
        );
        Ok(result)
    }

    async fn cached(&self, token_id: &str, now: DateTime<Utc>) -> Option<TrendResult> {
        let mut cache = self.cache.write().await;
        let fresh = match cache.get(token_id) {
            Some(entry) => now - entry.cached_at <= Duration::minutes(RESULT_CACHE_TTL_MINUTES),
            None => return None,
        };
        if fresh {
            cache.get(token_id).map(|entry| entry.result.clone())
        } else {
            cache.remove(token_id);
            None
        }
    }

    /// Drops the cached result so the next cycle rescores the token.
    pub async fn invalidate(&self, token_id: &str) {
        if self.cache.write().await.remove(token_id).is_some() {
            tracing::debug!("Marked {} for trend update", token_id);
        }
    }

    /// Per-minute velocity from the two newest history entries.
    pub async fn velocity(&self, token_id: &str) -> Result<f64> {
        let history = self.store.recent_history(token_id, 2).await?;
        Ok(velocity_per_minute(&history))
    }

    /// Last stored values; never calls the provider.
    pub async fn get_trend_index(&self, token_id: &str) -> Result<TrendIndexView> {
        let token = self.require_token(token_id).await?;
        let history = self.store.recent_history(token_id, READ_MODEL_HISTORY).await?;
        let velocity = velocity_per_minute(&history);
        let factors = history.first().map(|h| h.factors).unwrap_or(TrendFactors {
            sentiment: token.trend.sentiment,
            social_activity: token.trend.mention_velocity,
            holder_momentum: token.trend.holder_momentum,
            cross_market_corr: token.trend.cross_market_corr,
            ..Default::default()
        });

        Ok(TrendIndexView {
            token_id: token.id,
            headline: token.headline,
            score: token.trend.score,
            velocity,
            confidence: if token.trend.score > 0.0 { SCORED_CONFIDENCE } else { 0.0 },
            factors,
            weights: token.trend.weights,
            last_update: token.trend.last_update,
            history: history.into_iter().map(HistoryPoint::from).collect(),
            stale: false,
        })
    }

    /// Forced rescore for read callers. Provider outages return the last
    /// known values flagged stale instead of an error.
    pub async fn refresh_trend_index(&self, token_id: &str) -> Result<TrendIndexView> {
        match self.update_market_trend(token_id, true).await {
            Ok(_) => self.get_trend_index(token_id).await,
            Err(MarketError::ProviderUnavailable(reason)) => {
                tracing::warn!("Serving stale trend index for {}: {}", token_id, reason);
                let mut view = self.get_trend_index(token_id).await?;
                view.stale = true;
                Ok(view)
            }
            Err(e) => Err(e),
        }
    }

    /// Tokens traded within `active_window` or with 24h volume above 1 SOL.
    pub async fn tokens_due_for_scoring(
        &self,
        active_window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let threshold = now - active_window;
        let mut tokens: Vec<Token> = self
            .store
            .list_tokens()
            .await?
            .into_iter()
            .filter(|t| {
                t.stats.volume_24h > 1.0
                    || t.stats.last_trade_at.map(|ts| ts >= threshold).unwrap_or(false)
            })
            .collect();
        tokens.sort_by(|a, b| b.stats.volume_24h.total_cmp(&a.stats.volume_24h));
        Ok(tokens.into_iter().map(|t| t.id).collect())
    }

    /// One periodic pass. Each token is independent: failures are logged and
    /// the rest of the batch carries on.
    pub async fn run_scoring_cycle_at(
        &self,
        active_window: Duration,
        batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<CycleReport> {
        let tokens = self.tokens_due_for_scoring(active_window, now).await?;
        tracing::info!("Starting trend cycle for {} tokens", tokens.len());

        let outcomes: Vec<bool> = futures::stream::iter(tokens.iter().cloned())
            .map(|token_id: String| async move {
                match self.update_market_trend_at(&token_id, false, now).await {
                    Ok(_) => true,
                    Err(MarketError::ProviderUnavailable(reason)) => {
                        tracing::warn!("Skipping {} this cycle, provider unavailable: {}", token_id, reason);
                        false
                    }
                    Err(e) => {
                        tracing::error!("Failed to update trend for {}: {}", token_id, e);
                        false
                    }
                }
            })
            .buffer_unordered(batch_size.max(1))
            .collect()
            .await;

        let updated = outcomes.iter().filter(|ok| **ok).count();
        Ok(CycleReport {
            selected: tokens.len(),
            updated,
            skipped: tokens.len() - updated,
        })
    }

    async fn require_token(&self, token_id: &str) -> Result<Token> {
        self.store
            .get_token(token_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()).into())
    }
}
