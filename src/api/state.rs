use std::sync::Arc;

use crate::services::provider::CircuitBreakerProvider;
use crate::services::MarketEngine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<MarketEngine>,
    /// Present only when an external signal provider is configured.
    pub breaker: Option<Arc<CircuitBreakerProvider>>,
}
