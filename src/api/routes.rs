use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers::{
    get_active_flash_markets, get_trend_index, get_volume_minute, health, place_position,
    record_trade, refresh_trend_index, register_token,
};
use super::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/tokens", post(register_token))
        .route("/tokens/:token_id/volume-minute", get(get_volume_minute))
        .route("/trades", post(record_trade))
        .route(
            "/trend-index/:token_id",
            get(get_trend_index).post(refresh_trend_index),
        )
        .route("/flash-markets/active", get(get_active_flash_markets))
        .route("/flash-markets/trade", post(place_position))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
