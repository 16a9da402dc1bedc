use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::db::Store;
use crate::error::Result;
use crate::services::trend::velocity_per_second;

/// Score points per second.
pub const VELOCITY_THRESHOLD: f64 = 5.0;
pub const COOLDOWN_SECONDS: i64 = 120;
pub const MIN_HISTORY: usize = 3;
pub const MAX_SCAN_CANDIDATES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpikeCheck {
    pub detected: bool,
    pub velocity_per_second: f64,
}

impl SpikeCheck {
    fn quiet(velocity_per_second: f64) -> Self {
        Self {
            detected: false,
            velocity_per_second,
        }
    }
}

/// Watches trend history for fast moves. Cooldowns live in this struct
/// rather than in shared storage, so they are per instance.
pub struct FlashSpikeDetector {
    store: Arc<dyn Store>,
    last_triggers: Mutex<HashMap<String, DateTime<Utc>>>,
    threshold: f64,
    cooldown: Duration,
}

impl FlashSpikeDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            last_triggers: Mutex::new(HashMap::new()),
            threshold: VELOCITY_THRESHOLD,
            cooldown: Duration::seconds(COOLDOWN_SECONDS),
        }
    }

    pub async fn detect_velocity_spike(&self, token_id: &str) -> Result<SpikeCheck> {
        self.detect_velocity_spike_at(token_id, Utc::now()).await
    }

    pub async fn detect_velocity_spike_at(&self, token_id: &str, now: DateTime<Utc>) -> Result<SpikeCheck> {
        let history = self.store.recent_history(token_id, MIN_HISTORY).await?;
        if history.len() < MIN_HISTORY {
            return Ok(SpikeCheck::quiet(0.0));
        }
        let velocity = velocity_per_second(&history);

        // Check and mark under one lock so two racing checks can't both fire.
        let mut triggers = self.last_triggers.lock().await;
        if let Some(last) = triggers.get(token_id) {
            if now - *last < self.cooldown {
                tracing::debug!(
                    "Spike check for {} suppressed by cooldown (last trigger {})",
                    token_id,
                    last
                );
                return Ok(SpikeCheck::quiet(velocity));
            }
        }

        if velocity.abs() > self.threshold {
            triggers.insert(token_id.to_string(), now);
            tracing::info!(
                "Velocity spike on {}: {:.3} points/s (threshold {})",
                token_id,
                velocity,
                self.threshold
            );
            return Ok(SpikeCheck {
                detected: true,
                velocity_per_second: velocity,
            });
        }

        Ok(SpikeCheck::quiet(velocity))
    }

    /// Tokens worth checking on the timer: score above `min_score`, fastest
    /// movers first.
    pub async fn scan_candidates(&self, min_score: f64) -> Result<Vec<String>> {
        let mut tokens: Vec<_> = self
            .store
            .list_tokens()
            .await?
            .into_iter()
            .filter(|t| t.trend.score > min_score)
            .collect();
        tokens.sort_by(|a, b| b.trend.velocity.total_cmp(&a.trend.velocity));
        tokens.truncate(MAX_SCAN_CANDIDATES);
        Ok(tokens.into_iter().map(|t| t.id).collect())
    }

    pub async fn last_trigger(&self, token_id: &str) -> Option<DateTime<Utc>> {
        self.last_triggers.lock().await.get(token_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::types::models::{TrendFactors, TrendIndexHistory, TrendState, TrendWeights};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn seed(store: &MemoryStore, token_id: &str, points: &[(i64, f64)]) {
        store.register_token(token_id, "Story", at(-600)).await.unwrap();
        for (secs, score) in points {
            store
                .append_history(&TrendIndexHistory {
                    token_id: token_id.to_string(),
                    score: *score,
                    factors: TrendFactors::default(),
                    weights: TrendWeights::default(),
                    timestamp: at(*secs),
                })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn delta_of_six_in_one_second_is_a_spike() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "tok", &[(0, 30.0), (60, 40.0), (61, 46.0)]).await;
        let detector = FlashSpikeDetector::new(store);

        let check = detector.detect_velocity_spike_at("tok", at(61)).await.unwrap();
        assert!(check.detected);
        assert_eq!(check.velocity_per_second, 6.0);
        assert_eq!(detector.last_trigger("tok").await, Some(at(61)));
    }

    #[tokio::test]
    async fn delta_of_four_is_not() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "tok", &[(0, 30.0), (60, 40.0), (61, 44.0)]).await;
        let detector = FlashSpikeDetector::new(store);

        let check = detector.detect_velocity_spike_at("tok", at(61)).await.unwrap();
        assert!(!check.detected);
        assert_eq!(check.velocity_per_second, 4.0);
        assert_eq!(detector.last_trigger("tok").await, None);
    }

    #[tokio::test]
    async fn falling_scores_spike_too() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "tok", &[(0, 60.0), (60, 50.0), (61, 40.0)]).await;
        let detector = FlashSpikeDetector::new(store);

        let check = detector.detect_velocity_spike_at("tok", at(61)).await.unwrap();
        assert!(check.detected);
        assert_eq!(check.velocity_per_second, -10.0);
    }

    #[tokio::test]
    async fn needs_three_history_rows() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "tok", &[(60, 40.0), (61, 90.0)]).await;
        let detector = FlashSpikeDetector::new(store);

        let check = detector.detect_velocity_spike_at("tok", at(61)).await.unwrap();
        assert_eq!(check, SpikeCheck::quiet(0.0));
    }

    #[tokio::test]
    async fn cooldown_is_absolute_for_two_minutes() {
        let store = Arc::new(MemoryStore::new());
        seed(&store, "tok", &[(0, 10.0), (1, 20.0), (2, 30.0)]).await;
        let detector = FlashSpikeDetector::new(store.clone());

        assert!(detector.detect_velocity_spike_at("tok", at(2)).await.unwrap().detected);
        assert!(!detector.detect_velocity_spike_at("tok", at(60)).await.unwrap().detected);
        assert!(!detector.detect_velocity_spike_at("tok", at(121)).await.unwrap().detected);
        assert!(detector.detect_velocity_spike_at("tok", at(122)).await.unwrap().detected);
    }

    #[tokio::test]
    async fn candidates_are_hot_tokens_by_velocity() {
        let store = Arc::new(MemoryStore::new());
        for (id, score, velocity) in [("cold", 10.0, 50.0), ("warm", 40.0, 1.0), ("hot", 80.0, 9.0)] {
            store.register_token(id, "Story", at(0)).await.unwrap();
            store
                .write_trend_state(
                    id,
                    &TrendState {
                        score,
                        velocity,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        let detector = FlashSpikeDetector::new(store);

        assert_eq!(detector.scan_candidates(30.0).await.unwrap(), vec!["hot", "warm"]);
    }
}
