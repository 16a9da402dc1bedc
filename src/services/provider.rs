use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::db::Store;
use crate::error::{MarketError, Result, ValidationError};
use crate::services::volume::align_to_minute;
use crate::types::models::{SignalReading, TokenVolumeMinute, TrendFactors, TrendWeights};

/// Source of the seven trend factors and their adaptive weights.
#[async_trait]
pub trait FactorProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_factors(&self, token_id: &str) -> Result<SignalReading>;
}

const LOCAL_CONFIDENCE: f64 = 0.5;
const CORRELATION_PEERS: usize = 10;

/// Derives factors from the trade aggregates alone. Sentiment, social
/// activity and holder momentum have no local source and read as zero.
pub struct LocalFactorProvider {
    store: Arc<dyn Store>,
}

impl LocalFactorProvider {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn factors_at(&self, token_id: &str, now: DateTime<Utc>) -> Result<TrendFactors> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()))?;

        let hour_ago = now - Duration::hours(1);
        let trades_last_hour = self.store.trades_since(token_id, hour_ago).await?.len();
        let day = self
            .store
            .minute_volumes(token_id, now - Duration::hours(24), 1440)
            .await?;

        Ok(TrendFactors {
            sentiment: 0.0,
            trading_velocity: trades_last_hour as f64 / 60.0,
            volume_spike: volume_spike(&day),
            price_momentum: token.stats.price_change_24h / 100.0,
            social_activity: 0.0,
            holder_momentum: 0.0,
            cross_market_corr: self.cross_market_correlation(token_id, now).await?,
        })
    }

    /// Mean correlation of this token's last-hour minute volumes against the
    /// busiest other tokens.
    async fn cross_market_correlation(&self, token_id: &str, now: DateTime<Utc>) -> Result<f64> {
        let mut peers: Vec<_> = self
            .store
            .list_tokens()
            .await?
            .into_iter()
            .filter(|t| t.id != token_id && t.stats.volume_24h > 0.0)
            .collect();
        if peers.is_empty() {
            return Ok(0.0);
        }
        peers.sort_by(|a, b| b.stats.volume_24h.total_cmp(&a.stats.volume_24h));
        peers.truncate(CORRELATION_PEERS);

        let since = align_to_minute(now - Duration::hours(1));
        let own = hourly_series(&self.store.minute_volumes(token_id, since, 60).await?, since);

        let mut total = 0.0;
        for peer in &peers {
            let other = hourly_series(&self.store.minute_volumes(&peer.id, since, 60).await?, since);
            total += pearson(&own, &other);
        }
        Ok(total / peers.len() as f64)
    }
}

#[async_trait]
impl FactorProvider for LocalFactorProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get_factors(&self, token_id: &str) -> Result<SignalReading> {
        Ok(SignalReading {
            factors: self.factors_at(token_id, Utc::now()).await?,
            weights: TrendWeights::default(),
            confidence: LOCAL_CONFIDENCE,
            reasoning: "computed from local trade aggregates".to_string(),
        })
    }
}

/// `buckets` oldest first. Compares the latest 60 buckets against the 24h
/// per-bucket mean.
fn volume_spike(buckets: &[TokenVolumeMinute]) -> f64 {
    if buckets.is_empty() {
        return 0.0;
    }
    let total: f64 = buckets.iter().map(|b| b.volume_sol).sum();
    let average = total / buckets.len() as f64;
    if average <= 0.0 {
        return 0.0;
    }
    let recent: f64 = buckets.iter().rev().take(60).map(|b| b.volume_sol).sum();
    (recent - average) / average
}

/// Dense 60-slot series starting at `since`; missing minutes are zero.
fn hourly_series(buckets: &[TokenVolumeMinute], since: DateTime<Utc>) -> Vec<f64> {
    let mut series = vec![0.0; 60];
    for bucket in buckets {
        let slot = (bucket.minute - since).num_minutes();
        if (0..60).contains(&slot) {
            series[slot as usize] += bucket.volume_sol;
        }
    }
    series
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len().min(b.len());
    if n == 0 {
        return 0.0;
    }
    let mean_a = a[..n].iter().sum::<f64>() / n as f64;
    let mean_b = b[..n].iter().sum::<f64>() / n as f64;

    let (mut numerator, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        numerator += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    let denominator = (var_a * var_b).sqrt();
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// Remote signal service answering `GET {base}/factors/{token_id}`.
pub struct HttpFactorProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: std::time::Duration,
    rate_limiter: DefaultDirectRateLimiter,
}

impl HttpFactorProvider {
    pub fn new(base_url: &str, timeout: std::time::Duration, requests_per_second: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MarketError::ProviderUnavailable(e.to_string()))?;
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(5u32));
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            rate_limiter: RateLimiter::direct(Quota::per_second(rps)),
        })
    }

    async fn fetch(&self, token_id: &str) -> Result<SignalReading> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/factors/{}", self.base_url, token_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MarketError::ProviderUnavailable(e.to_string()))?;

        response
            .json::<SignalReading>()
            .await
            .map_err(|e| MarketError::ProviderUnavailable(format!("malformed response: {}", e)))
    }
}

#[async_trait]
impl FactorProvider for HttpFactorProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn get_factors(&self, token_id: &str) -> Result<SignalReading> {
        within(self.timeout, self.fetch(token_id)).await
    }
}

/// Bounds a provider call; running out of time reads as `ProviderUnavailable`.
async fn within<F>(limit: std::time::Duration, call: F) -> Result<SignalReading>
where
    F: std::future::Future<Output = Result<SignalReading>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MarketError::ProviderUnavailable(format!(
            "timed out after {:?}",
            limit
        ))),
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub open: bool,
    pub consecutive_failures: u32,
}

/// Routes to `primary` until it fails `threshold` times in a row, then to
/// `fallback` for `open_for` before trying `primary` again.
pub struct CircuitBreakerProvider {
    primary: Arc<dyn FactorProvider>,
    fallback: Arc<dyn FactorProvider>,
    threshold: u32,
    open_for: std::time::Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreakerProvider {
    pub fn new(primary: Arc<dyn FactorProvider>, fallback: Arc<dyn FactorProvider>) -> Self {
        Self::with_limits(primary, fallback, 5, std::time::Duration::from_secs(60))
    }

    pub fn with_limits(
        primary: Arc<dyn FactorProvider>,
        fallback: Arc<dyn FactorProvider>,
        threshold: u32,
        open_for: std::time::Duration,
    ) -> Self {
        Self {
            primary,
            fallback,
            threshold,
            open_for,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let state = self.lock();
        BreakerStatus {
            open: state.open_until.map(|t| Instant::now() < t).unwrap_or(false),
            consecutive_failures: state.consecutive_failures,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_open(&self) -> bool {
        let mut state = self.lock();
        match state.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                state.open_until = None;
                state.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    fn record(&self, ok: bool) {
        let mut state = self.lock();
        if ok {
            state.consecutive_failures = 0;
            return;
        }
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            tracing::warn!(
                "Signal provider {} failed {} times in a row, opening breaker for {:?}",
                self.primary.name(),
                state.consecutive_failures,
                self.open_for
            );
            state.open_until = Some(Instant::now() + self.open_for);
        }
    }
}

#[async_trait]
impl FactorProvider for CircuitBreakerProvider {
    fn name(&self) -> &'static str {
        "circuit-breaker"
    }

    async fn get_factors(&self, token_id: &str) -> Result<SignalReading> {
        if !self.is_open() {
            match self.primary.get_factors(token_id).await {
                Ok(reading) => {
                    self.record(true);
                    return Ok(reading);
                }
                Err(e) => {
                    self.record(false);
                    tracing::warn!(
                        "Signal provider {} failed for {}: {}",
                        self.primary.name(),
                        token_id,
                        e
                    );
                }
            }
        }
        self.fallback.get_factors(token_id).await
    }
}

/// Canned readings per token; tokens without one fail as unavailable.
#[cfg(test)]
pub struct ScriptedProvider {
    pub readings: Mutex<std::collections::HashMap<String, SignalReading>>,
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            readings: Mutex::new(std::collections::HashMap::new()),
            calls: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    pub fn set(&self, token_id: &str, reading: SignalReading) {
        self.readings.lock().unwrap().insert(token_id.to_string(), reading);
    }

    pub fn clear(&self, token_id: &str) {
        self.readings.lock().unwrap().remove(token_id);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
impl FactorProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn get_factors(&self, token_id: &str) -> Result<SignalReading> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        // Suspends like a real call so concurrent callers interleave.
        tokio::task::yield_now().await;
        self.readings
            .lock()
            .unwrap()
            .get(token_id)
            .cloned()
            .ok_or_else(|| MarketError::ProviderUnavailable(format!("no reading for {}", token_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::types::models::{TradeEvent, TradeSide};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_040 + secs, 0).unwrap()
    }

    fn reading(sentiment: f64) -> SignalReading {
        SignalReading {
            factors: TrendFactors {
                sentiment,
                ..Default::default()
            },
            weights: TrendWeights::default(),
            confidence: 0.9,
            reasoning: "scripted".into(),
        }
    }

    fn bucket(minute: DateTime<Utc>, volume: f64) -> TokenVolumeMinute {
        TokenVolumeMinute {
            token_id: "tok".into(),
            minute,
            volume_sol: volume,
            trade_count: 1,
            buy_volume_sol: volume,
            sell_volume_sol: 0.0,
        }
    }

    #[test]
    fn pearson_handles_perfect_and_flat_series() {
        assert!((pearson(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]) - 1.0).abs() < 1e-12);
        assert!((pearson(&[1.0, 2.0, 3.0], &[3.0, 2.0, 1.0]) + 1.0).abs() < 1e-12);
        assert_eq!(pearson(&[1.0, 1.0, 1.0], &[1.0, 2.0, 3.0]), 0.0);
        assert_eq!(pearson(&[], &[]), 0.0);
    }

    #[test]
    fn volume_spike_compares_recent_hour_to_daily_mean() {
        assert_eq!(volume_spike(&[]), 0.0);
        let buckets: Vec<_> = (0..4).map(|i| bucket(at(i * 60), 2.0)).collect();
        // All four buckets are within the recent 60: (8 - 2) / 2.
        assert!((volume_spike(&buckets) - 3.0).abs() < 1e-12);
    }

    #[test]
    fn hourly_series_places_buckets_by_minute_offset() {
        let since = at(0);
        let series = hourly_series(&[bucket(at(120), 5.0), bucket(at(3600), 9.0)], since);
        assert_eq!(series.len(), 60);
        assert_eq!(series[2], 5.0);
        assert_eq!(series.iter().sum::<f64>(), 5.0);
    }

    #[tokio::test]
    async fn local_factors_come_from_aggregates() {
        let store = Arc::new(MemoryStore::new());
        store.register_token("tok", "Story", at(0)).await.unwrap();
        for i in 0..6 {
            store
                .insert_trade(&TradeEvent {
                    token_id: "tok".into(),
                    side: TradeSide::Buy,
                    amount: 1.0,
                    price_at_trade: 1.0,
                    timestamp: at(i * 60),
                    trade_id: None,
                    wallet: None,
                })
                .await
                .unwrap();
        }
        let provider = LocalFactorProvider::new(store.clone());
        let factors = provider.factors_at("tok", at(600)).await.unwrap();
        assert!((factors.trading_velocity - 0.1).abs() < 1e-12);
        assert_eq!(factors.sentiment, 0.0);
        assert_eq!(factors.cross_market_corr, 0.0);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_uses_fallback() {
        let primary = Arc::new(ScriptedProvider::new());
        let fallback = Arc::new(ScriptedProvider::new());
        fallback.set("tok", reading(-0.5));
        let breaker = CircuitBreakerProvider::with_limits(
            primary.clone(),
            fallback.clone(),
            2,
            std::time::Duration::from_secs(60),
        );

        for _ in 0..2 {
            let got = breaker.get_factors("tok").await.unwrap();
            assert_eq!(got.factors.sentiment, -0.5);
        }
        assert!(breaker.status().open);

        // Open: the primary is not consulted even once it recovers.
        primary.set("tok", reading(0.7));
        let got = breaker.get_factors("tok").await.unwrap();
        assert_eq!(got.factors.sentiment, -0.5);
        assert_eq!(primary.call_count(), 2);
    }

    #[tokio::test]
    async fn breaker_resets_after_success() {
        let primary = Arc::new(ScriptedProvider::new());
        let fallback = Arc::new(ScriptedProvider::new());
        fallback.set("tok", reading(0.0));
        let breaker = CircuitBreakerProvider::with_limits(
            primary.clone(),
            fallback,
            2,
            std::time::Duration::from_secs(60),
        );

        breaker.get_factors("tok").await.unwrap();
        primary.set("tok", reading(0.3));
        breaker.get_factors("tok").await.unwrap();
        primary.clear("tok");
        breaker.get_factors("tok").await.unwrap();

        let status = breaker.status();
        assert!(!status.open);
        assert_eq!(status.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn stalled_call_becomes_provider_unavailable() {
        let err = within(
            std::time::Duration::from_millis(10),
            std::future::pending::<Result<SignalReading>>(),
        )
        .await
        .unwrap_err();
        match err {
            MarketError::ProviderUnavailable(msg) => assert!(msg.contains("timed out")),
            other => panic!("expected ProviderUnavailable, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_signal_service_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accepts connections and never answers.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let provider = HttpFactorProvider::new(
            &format!("http://{}/", addr),
            std::time::Duration::from_millis(50),
            10,
        )
        .unwrap();
        let err = provider.get_factors("tok").await.unwrap_err();
        assert!(matches!(err, MarketError::ProviderUnavailable(_)));
        server.abort();
    }

    #[test]
    fn signal_reading_accepts_either_correlation_key() {
        let json = r#"{
            "sentiment": 0.2,
            "tradingVelocity": 1.0,
            "volumeSpike": 0.0,
            "priceMomentum": 0.1,
            "socialActivity": 3.0,
            "holderMomentum": 0.5,
            "crossMarketCorrelation": -0.4,
            "weights": {
                "sentiment": 0.25,
                "tradingVelocity": 0.2,
                "volumeSpike": 0.2,
                "priceMomentum": 0.15,
                "socialActivity": 0.1,
                "holderMomentum": 0.05,
                "crossMarketCorr": 0.05
            },
            "confidence": 0.8,
            "reasoning": "busy story"
        }"#;
        let reading: SignalReading = serde_json::from_str(json).unwrap();
        assert_eq!(reading.factors.cross_market_corr, -0.4);
        assert_eq!(reading.weights, TrendWeights::default());
    }
}
