use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::db::Store;
use crate::error::{MarketError, Result, ValidationError};
use crate::services::trend::velocity_per_second;
use crate::types::models::{
    ActiveFlashMarket, Direction, FlashTrendMarket, FlashTrendPosition, Payout, PositionSummary,
    Resolution,
};

pub const MARKET_DURATION_SECONDS: i64 = 60;
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MarketEvent {
    Created { market: FlashTrendMarket },
    Resolved { resolution: Resolution, payouts: Vec<Payout> },
}

pub struct FlashMarketLifecycle {
    store: Arc<dyn Store>,
    events: broadcast::Sender<MarketEvent>,
}

impl FlashMarketLifecycle {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    /// Creation and resolution notifications. Slow receivers lose events.
    pub fn subscribe(&self) -> broadcast::Receiver<MarketEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: MarketEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub async fn create_flash_market(&self, token_id: &str, initial_velocity: f64) -> Result<Option<FlashTrendMarket>> {
        self.create_flash_market_at(token_id, initial_velocity, Utc::now()).await
    }

    /// Opens a 60 second market. Returns `None` when the token already has
    /// one running.
    pub async fn create_flash_market_at(
        &self,
        token_id: &str,
        initial_velocity: f64,
        now: DateTime<Utc>,
    ) -> Result<Option<FlashTrendMarket>> {
        let token = self
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownToken(token_id.to_string()))?;

        let market = FlashTrendMarket {
            id: Uuid::new_v4().to_string(),
            parent_token_id: token.id,
            trend_snapshot: token.trend.weights,
            start_timestamp: now,
            end_timestamp: now + Duration::seconds(MARKET_DURATION_SECONDS),
            initial_velocity,
            is_active: true,
            total_up_amount: 0,
            total_down_amount: 0,
            participant_count: 0,
            final_velocity: None,
            winning_side: None,
        };

        if !self.store.create_flash_market_if_idle(&market).await? {
            tracing::info!("Flash market already running for {}, skipping creation", token_id);
            return Ok(None);
        }

        tracing::info!(
            "Created flash market {} for {} (initial velocity {:.3}/s, ends {})",
            market.id,
            token_id,
            initial_velocity,
            market.end_timestamp
        );
        self.publish(MarketEvent::Created { market: market.clone() });
        Ok(Some(market))
    }

    pub async fn place_position(
        &self,
        market_id: &str,
        wallet: &str,
        direction: Direction,
        amount: u64,
    ) -> Result<FlashTrendPosition> {
        self.place_position_at(market_id, wallet, direction, amount, Utc::now())
            .await
    }

    /// Expiry is judged against `now`, not the scan, so a market past its end
    /// refuses positions even before it is resolved.
    pub async fn place_position_at(
        &self,
        market_id: &str,
        wallet: &str,
        direction: Direction,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<FlashTrendPosition> {
        if amount == 0 {
            return Err(MarketError::invalid_input("amount must be positive"));
        }
        let wallet = wallet.trim();
        if wallet.is_empty() {
            return Err(MarketError::invalid_input("wallet address is required"));
        }

        let market = self
            .store
            .get_flash_market(market_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownMarket(market_id.to_string()))?;
        if !market.is_active {
            return Err(ValidationError::MarketNotActive.into());
        }
        if now >= market.end_timestamp {
            return Err(ValidationError::MarketExpired.into());
        }

        let position = FlashTrendPosition {
            id: Uuid::new_v4().to_string(),
            market_id: market.id,
            wallet_address: wallet.to_string(),
            direction,
            amount,
            created_at: now,
        };
        self.store.insert_position(&position).await?;

        tracing::info!(
            "Position {} on market {}: {} {} lamports by {}",
            position.id,
            position.market_id,
            direction,
            amount,
            position.wallet_address
        );
        Ok(position)
    }

    pub async fn scan_for_expired(&self) -> Result<Vec<Resolution>> {
        self.scan_for_expired_at(Utc::now()).await
    }

    /// Resolves every due market. One failing market is logged and the scan
    /// moves on to the next.
    pub async fn scan_for_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<Resolution>> {
        let due = self.store.due_flash_markets(now).await?;
        if !due.is_empty() {
            tracing::info!("Resolving {} expired flash markets", due.len());
        }

        let mut resolved = Vec::with_capacity(due.len());
        for market in due {
            match self.resolve_market_at(&market.id, now).await {
                Ok(resolution) => resolved.push(resolution),
                Err(e) => {
                    tracing::error!("Failed to resolve flash market {}: {}", market.id, e);
                }
            }
        }
        Ok(resolved)
    }

    pub async fn resolve_market(&self, market_id: &str) -> Result<Resolution> {
        self.resolve_market_at(market_id, Utc::now()).await
    }

    /// Settles a market whose window has closed. The outcome compares the
    /// parent token's current per-second velocity with the one that opened
    /// the market; ties go up.
    pub async fn resolve_market_at(&self, market_id: &str, now: DateTime<Utc>) -> Result<Resolution> {
        let market = self
            .store
            .get_flash_market(market_id)
            .await?
            .ok_or_else(|| ValidationError::UnknownMarket(market_id.to_string()))?;
        if !market.is_active {
            return Err(MarketError::ConcurrencyConflict(format!(
                "market {} is already resolved",
                market_id
            )));
        }
        if now < market.end_timestamp {
            return Err(ValidationError::MarketStillOpen(market.end_timestamp).into());
        }

        let history = self.store.recent_history(&market.parent_token_id, 2).await?;
        let final_velocity = velocity_per_second(&history);
        let winning_side = if final_velocity - market.initial_velocity >= 0.0 {
            Direction::Up
        } else {
            Direction::Down
        };

        let positions = self.store.positions(market_id).await?;
        if positions.len() as u64 != market.participant_count {
            return Err(MarketError::ConcurrencyConflict(format!(
                "market {} took positions while resolving",
                market_id
            )));
        }
        let payouts = calculate_payouts(&market, &positions, winning_side)?;
        let resolution = Resolution {
            market_id: market.id.clone(),
            winning_side,
            final_velocity,
            resolved_at: now,
            void: payouts.is_empty(),
            participant_count: positions.len() as u64,
        };

        if !self.store.resolve_flash_market(&resolution, &payouts).await? {
            return Err(MarketError::ConcurrencyConflict(format!(
                "market {} was resolved concurrently",
                market_id
            )));
        }

        if resolution.void {
            tracing::info!(
                "Flash market {} resolved {} with no winning stake, void",
                market_id,
                winning_side
            );
        } else {
            tracing::info!(
                "Flash market {} resolved {}: {} payouts, pool {} lamports",
                market_id,
                winning_side,
                payouts.len(),
                market.total_up_amount as u128 + market.total_down_amount as u128
            );
        }
        self.publish(MarketEvent::Resolved {
            resolution: resolution.clone(),
            payouts,
        });
        Ok(resolution)
    }

    /// Active markets, newest first, with anonymous position summaries.
    pub async fn active_flash_markets(&self) -> Result<Vec<ActiveFlashMarket>> {
        let markets = self.store.active_flash_markets().await?;
        let mut active = Vec::with_capacity(markets.len());
        for market in markets {
            let positions = self
                .store
                .positions(&market.id)
                .await?
                .into_iter()
                .map(|p| PositionSummary {
                    direction: p.direction,
                    amount: p.amount,
                })
                .collect();
            active.push(ActiveFlashMarket { market, positions });
        }
        Ok(active)
    }

    pub async fn payouts(&self, market_id: &str) -> Result<Vec<Payout>> {
        self.store.payouts(market_id).await
    }
}

/// Winners get their stake back plus a pro-rata share of the losing pool,
/// floored. The floor remainder goes to the largest winning stake (earliest
/// on ties) so the payouts sum to the whole pool. Losers get a zero row.
/// No winning stake means a void market and no rows at all.
pub fn calculate_payouts(
    market: &FlashTrendMarket,
    positions: &[FlashTrendPosition],
    outcome: Direction,
) -> Result<Vec<Payout>> {
    let (winning_pool, losing_pool) = positions.iter().fold((0u128, 0u128), |(win, lose), p| {
        if p.direction == outcome {
            (win + p.amount as u128, lose)
        } else {
            (win, lose + p.amount as u128)
        }
    });
    let pool = winning_pool + losing_pool;
    let recorded = market.total_up_amount as u128 + market.total_down_amount as u128;
    if pool != recorded {
        return Err(MarketError::InconsistentPayout {
            expected: recorded,
            actual: pool,
        });
    }
    if winning_pool == 0 {
        return Ok(Vec::new());
    }

    let mut amounts: Vec<u128> = positions
        .iter()
        .map(|p| {
            if p.direction == outcome {
                p.amount as u128 + p.amount as u128 * losing_pool / winning_pool
            } else {
                0
            }
        })
        .collect();

    let paid: u128 = amounts.iter().sum();
    let remainder = pool.checked_sub(paid).ok_or(MarketError::InconsistentPayout {
        expected: pool,
        actual: paid,
    })?;
    if remainder > 0 {
        let mut largest: Option<usize> = None;
        for (i, p) in positions.iter().enumerate() {
            if p.direction != outcome {
                continue;
            }
            match largest {
                Some(j) if positions[j].amount >= p.amount => {}
                _ => largest = Some(i),
            }
        }
        if let Some(i) = largest {
            amounts[i] += remainder;
        }
    }

    let total: u128 = amounts.iter().sum();
    if total != pool {
        return Err(MarketError::InconsistentPayout {
            expected: pool,
            actual: total,
        });
    }

    positions
        .iter()
        .zip(amounts)
        .map(|(p, amount)| {
            let payout = u64::try_from(amount)
                .map_err(|_| MarketError::invalid_input("payout exceeds u64 lamports"))?;
            let profit_loss = i64::try_from(payout as i128 - p.amount as i128)
                .map_err(|_| MarketError::invalid_input("profit exceeds i64 lamports"))?;
            Ok(Payout {
                market_id: market.id.clone(),
                position_id: p.id.clone(),
                wallet_address: p.wallet_address.clone(),
                direction: p.direction,
                stake: p.amount,
                payout,
                profit_loss,
            })
        })
        .collect()
}
