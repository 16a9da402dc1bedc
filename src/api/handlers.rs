use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::state::AppState;
use crate::services::provider::BreakerStatus;
use crate::services::volume::{IngestOutcome, Timeframe};
use crate::types::models::{
    ActiveFlashMarket, Direction, FlashTrendPosition, Token, TokenVolumeMinute, TradeEvent,
    TrendIndexView,
};

const DEFAULT_SERIES_LIMIT: usize = 1440;
const MAX_SERIES_LIMIT: usize = 10_080;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: &'static str,
    pub provider: Option<BreakerStatus>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.engine.store.backend_type(),
        provider: state.breaker.as_ref().map(|b| b.status()),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTokenRequest {
    #[serde(alias = "id")]
    pub token_id: String,
    pub headline: String,
}

pub async fn register_token(
    State(state): State<AppState>,
    payload: Result<Json<RegisterTokenRequest>, JsonRejection>,
) -> Result<Json<Token>, ApiError> {
    let Json(request) = payload?;
    let token = state
        .engine
        .register_token(&request.token_id, &request.headline)
        .await?;
    Ok(Json(token))
}

pub async fn record_trade(
    State(state): State<AppState>,
    payload: Result<Json<TradeEvent>, JsonRejection>,
) -> Result<Json<IngestOutcome>, ApiError> {
    let Json(event) = payload?;
    let outcome = state.engine.record_trade(&event).await?;
    Ok(Json(outcome))
}

#[derive(Deserialize)]
pub struct VolumeParams {
    pub timeframe: Option<String>,
    pub limit: Option<usize>,
}

pub async fn get_volume_minute(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    params: Result<Query<VolumeParams>, QueryRejection>,
) -> Result<Json<Vec<TokenVolumeMinute>>, ApiError> {
    let Query(params) = params?;
    let timeframe = match params.timeframe.as_deref() {
        Some(raw) => raw
            .parse::<Timeframe>()
            .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        None => Timeframe::Day,
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_SERIES_LIMIT)
        .clamp(1, MAX_SERIES_LIMIT);

    let series = state
        .engine
        .volume
        .volume_series(&token_id, timeframe, limit, Utc::now())
        .await?;
    Ok(Json(series))
}

pub async fn get_trend_index(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<TrendIndexView>, ApiError> {
    Ok(Json(state.engine.trend.get_trend_index(&token_id).await?))
}

/// Forces a rescore. A provider outage answers with the last values marked
/// stale rather than an error.
pub async fn refresh_trend_index(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
) -> Result<Json<TrendIndexView>, ApiError> {
    Ok(Json(state.engine.trend.refresh_trend_index(&token_id).await?))
}

pub async fn get_active_flash_markets(
    State(state): State<AppState>,
) -> Result<Json<Vec<ActiveFlashMarket>>, ApiError> {
    Ok(Json(state.engine.markets.active_flash_markets().await?))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacePositionRequest {
    pub market_id: String,
    #[serde(alias = "wallet")]
    pub wallet_address: String,
    pub direction: Direction,
    /// Lamports.
    pub amount: u64,
}

pub async fn place_position(
    State(state): State<AppState>,
    payload: Result<Json<PlacePositionRequest>, JsonRejection>,
) -> Result<Json<FlashTrendPosition>, ApiError> {
    let Json(request) = payload?;
    let position = state
        .engine
        .markets
        .place_position(
            &request.market_id,
            &request.wallet_address,
            request.direction,
            request.amount,
        )
        .await?;
    Ok(Json(position))
}
