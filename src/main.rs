use anyhow::Result;
use clickhouse::Client;
use dotenv::dotenv;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};
use tracing_subscriber::EnvFilter;

mod api;
mod config;
mod db;
mod error;
mod services;
mod types;

use crate::api::routes::create_router;
use crate::api::state::AppState;
use crate::config::{Config, StoreBackend};
use crate::db::init::init_database;
use crate::db::{ClickHouseStore, MemoryStore, Store};
use crate::services::monitor;
use crate::services::provider::{
    CircuitBreakerProvider, FactorProvider, HttpFactorProvider, LocalFactorProvider,
};
use crate::services::MarketEngine;

async fn connect_to_clickhouse(config: &Config, max_retries: u32) -> Result<Client> {
    let client = Client::default()
        .with_url(&config.clickhouse_url)
        .with_database(&config.clickhouse_database);

    for attempt in 1..=max_retries {
        match client.query("SELECT 1").execute().await {
            Ok(_) => {
                tracing::info!("Connected to ClickHouse at {}", config.clickhouse_url);
                return Ok(client);
            }
            Err(e) => {
                if attempt == max_retries {
                    return Err(anyhow::anyhow!(
                        "Failed to connect to ClickHouse after {} attempts: {}",
                        max_retries,
                        e
                    ));
                }
                tracing::warn!(
                    "Failed to connect to ClickHouse (attempt {}/{}): {}",
                    attempt,
                    max_retries,
                    e
                );
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
    Err(anyhow::anyhow!("ClickHouse connection was never attempted"))
}

async fn open_store(config: &Config) -> Result<Arc<dyn Store>> {
    match config.store_backend {
        StoreBackend::ClickHouse => {
            let client = connect_to_clickhouse(config, 5).await?;
            init_database(&client).await?;
            Ok(Arc::new(ClickHouseStore::new(client)))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store, state is lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;

    let store = open_store(&config).await?;
    tracing::info!("Store backend: {}", store.backend_type());

    let local: Arc<dyn FactorProvider> = Arc::new(LocalFactorProvider::new(store.clone()));
    let (provider, breaker): (Arc<dyn FactorProvider>, _) = match &config.signal_provider_url {
        Some(url) => {
            let http = Arc::new(HttpFactorProvider::new(
                url,
                config.signal_provider_timeout,
                config.signal_provider_rps,
            )?);
            let breaker = Arc::new(CircuitBreakerProvider::new(http, local));
            tracing::info!("Signal provider at {} with local fallback", url);
            let provider: Arc<dyn FactorProvider> = breaker.clone();
            (provider, Some(breaker))
        }
        None => {
            tracing::info!("No signal provider configured, scoring from local aggregates");
            (local, None)
        }
    };

    let (engine, appended) = MarketEngine::new(store, provider, &config);
    let app = create_router(AppState {
        engine: engine.clone(),
        breaker,
    });

    let listener = TcpListener::bind(config.api_bind_addr).await?;
    tracing::info!("Listening on {}", config.api_bind_addr);

    let trend_handle = tokio::spawn(monitor::start_trend_monitoring(engine.clone(), config.clone()));
    let spike_handle = tokio::spawn(monitor::start_spike_monitoring(
        engine.clone(),
        appended,
        config.clone(),
    ));
    let expiry_handle = tokio::spawn(monitor::start_expiry_monitoring(engine.clone(), config.clone()));

    // Run the API server and monitors concurrently
    tokio::select! {
        result = axum::serve(listener, app.into_make_service()) => {
            if let Err(e) = result {
                tracing::error!("Failed to serve API: {:?}", e);
            }
        }
        _ = trend_handle => {
            tracing::info!("Trend monitoring finished");
        }
        _ = spike_handle => {
            tracing::info!("Spike monitoring finished");
        }
        _ = expiry_handle => {
            tracing::info!("Expiry monitoring finished");
        }
    }

    Ok(())
}
