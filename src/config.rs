use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    ClickHouse,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clickhouse" => Ok(StoreBackend::ClickHouse),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub clickhouse_url: String,
    pub clickhouse_database: String,
    pub store_backend: StoreBackend,
    pub api_bind_addr: SocketAddr,
    pub signal_provider_url: Option<String>,
    pub signal_provider_timeout: Duration,
    pub signal_provider_rps: u32,
    pub trend_update_interval: Duration,
    pub trend_active_window_hours: i64,
    pub trend_batch_size: usize,
    pub spike_scan_interval: Duration,
    pub spike_min_score: f64,
    pub expiry_scan_interval: Duration,
    pub trade_dedup_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            clickhouse_url: "http://localhost:8123".to_string(),
            clickhouse_database: "default".to_string(),
            store_backend: StoreBackend::ClickHouse,
            api_bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            signal_provider_url: None,
            signal_provider_timeout: Duration::from_secs(10),
            signal_provider_rps: 5,
            trend_update_interval: Duration::from_secs(300),
            trend_active_window_hours: 1,
            trend_batch_size: 5,
            spike_scan_interval: Duration::from_secs(2),
            spike_min_score: 30.0,
            expiry_scan_interval: Duration::from_secs(5),
            trade_dedup_capacity: 10_000,
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenv().ok()` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        Ok(Self {
            clickhouse_url: lookup("CLICKHOUSE_URL").unwrap_or(defaults.clickhouse_url),
            clickhouse_database: lookup("CLICKHOUSE_DATABASE")
                .unwrap_or(defaults.clickhouse_database),
            store_backend: parse(&lookup, "STORE_BACKEND", defaults.store_backend)?,
            api_bind_addr: parse(&lookup, "API_BIND_ADDR", defaults.api_bind_addr)?,
            signal_provider_url: lookup("SIGNAL_PROVIDER_URL").filter(|url| !url.is_empty()),
            signal_provider_timeout: Duration::from_secs(parse(
                &lookup,
                "SIGNAL_PROVIDER_TIMEOUT_SECS",
                defaults.signal_provider_timeout.as_secs(),
            )?),
            signal_provider_rps: positive(
                &lookup,
                "SIGNAL_PROVIDER_RPS",
                defaults.signal_provider_rps,
            )?,
            trend_update_interval: Duration::from_secs(positive(
                &lookup,
                "TREND_UPDATE_INTERVAL_SECS",
                defaults.trend_update_interval.as_secs(),
            )?),
            trend_active_window_hours: parse(
                &lookup,
                "TREND_ACTIVE_WINDOW_HOURS",
                defaults.trend_active_window_hours,
            )?,
            trend_batch_size: positive(&lookup, "TREND_BATCH_SIZE", defaults.trend_batch_size)?,
            spike_scan_interval: Duration::from_secs(positive(
                &lookup,
                "SPIKE_SCAN_INTERVAL_SECS",
                defaults.spike_scan_interval.as_secs(),
            )?),
            spike_min_score: parse(&lookup, "SPIKE_MIN_SCORE", defaults.spike_min_score)?,
            expiry_scan_interval: Duration::from_secs(positive(
                &lookup,
                "EXPIRY_SCAN_INTERVAL_SECS",
                defaults.expiry_scan_interval.as_secs(),
            )?),
            trade_dedup_capacity: parse(
                &lookup,
                "TRADE_DEDUP_CAPACITY",
                defaults.trade_dedup_capacity,
            )?,
        })
    }
}

fn parse<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

// Intervals and batch sizes of zero would stall the timers.
fn positive<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Default,
{
    let value = parse(lookup, name, default)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            name,
            value: lookup(name).unwrap_or_default(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config.store_backend, StoreBackend::ClickHouse);
        assert_eq!(config.spike_scan_interval, Duration::from_secs(2));
        assert_eq!(config.expiry_scan_interval, Duration::from_secs(5));
        assert!(config.signal_provider_url.is_none());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup_from(&[
            ("STORE_BACKEND", "memory"),
            ("API_BIND_ADDR", "127.0.0.1:9000"),
            ("SIGNAL_PROVIDER_URL", "http://signals:7000"),
            ("TREND_BATCH_SIZE", "8"),
            ("SPIKE_MIN_SCORE", "12.5"),
        ]))
        .unwrap();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert_eq!(config.api_bind_addr.port(), 9000);
        assert_eq!(config.signal_provider_url.as_deref(), Some("http://signals:7000"));
        assert_eq!(config.trend_batch_size, 8);
        assert_eq!(config.spike_min_score, 12.5);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = Config::from_lookup(lookup_from(&[("TREND_BATCH_SIZE", "lots")])).unwrap_err();
        assert!(err.to_string().contains("TREND_BATCH_SIZE"));

        let err = Config::from_lookup(lookup_from(&[("EXPIRY_SCAN_INTERVAL_SECS", "0")]))
            .unwrap_err();
        assert!(err.to_string().contains("EXPIRY_SCAN_INTERVAL_SECS"));
    }
}
