use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};

use crate::config::Config;
use crate::services::MarketEngine;

fn timer(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Periodic rescoring of recently traded tokens.
pub async fn start_trend_monitoring(engine: Arc<MarketEngine>, config: Config) {
    tracing::info!(
        "Starting trend monitoring (every {:?}, window {}h, batch {})",
        config.trend_update_interval,
        config.trend_active_window_hours,
        config.trend_batch_size
    );
    let window = chrono::Duration::hours(config.trend_active_window_hours);
    let mut trend_timer = timer(config.trend_update_interval);

    loop {
        trend_timer.tick().await;
        match engine
            .trend
            .run_scoring_cycle_at(window, config.trend_batch_size, Utc::now())
            .await
        {
            Ok(report) => tracing::info!(
                "Trend cycle done: {} selected, {} updated, {} skipped",
                report.selected,
                report.updated,
                report.skipped
            ),
            Err(e) => tracing::error!("Trend cycle failed: {}", e),
        }
    }
}

/// Spike checks run for every fresh history entry and, as a sweep, on a
/// short timer over the hottest tokens.
pub async fn start_spike_monitoring(
    engine: Arc<MarketEngine>,
    mut appended: mpsc::UnboundedReceiver<String>,
    config: Config,
) {
    tracing::info!("Starting spike monitoring (every {:?})", config.spike_scan_interval);
    let mut spike_timer = timer(config.spike_scan_interval);

    loop {
        tokio::select! {
            _ = spike_timer.tick() => {
                match engine.scan_for_spikes_at(config.spike_min_score, Utc::now()).await {
                    Ok(0) => {}
                    Ok(created) => tracing::info!("Spike sweep opened {} flash markets", created),
                    Err(e) => tracing::error!("Spike sweep failed: {}", e),
                }
            }

            token = appended.recv() => {
                let Some(token_id) = token else {
                    tracing::warn!("History channel closed, stopping spike monitoring");
                    return;
                };
                if let Err(e) = engine.handle_history_appended_at(&token_id, Utc::now()).await {
                    tracing::error!("Spike check failed for {}: {}", token_id, e);
                }
            }
        }
    }
}

/// Resolves flash markets once their window has closed.
pub async fn start_expiry_monitoring(engine: Arc<MarketEngine>, config: Config) {
    tracing::info!("Starting expiry monitoring (every {:?})", config.expiry_scan_interval);
    let mut expiry_timer = timer(config.expiry_scan_interval);

    loop {
        expiry_timer.tick().await;
        if let Err(e) = engine.markets.scan_for_expired_at(Utc::now()).await {
            tracing::error!("Expiry scan failed: {}", e);
        }
    }
}
