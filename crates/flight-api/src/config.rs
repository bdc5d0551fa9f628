//! API server configuration

use flight_db::DbConfig;
use flight_tracker::TrackerConfig;
use std::str::FromStr;
use std::time::Duration;

/// Secret used when `JWT_SECRET` is unset. Only suitable for development.
pub const DEV_JWT_SECRET: &str = "dev-secret-change-in-production";

/// Which store the server runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Scylla,
    Memory,
}

impl StoreBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreBackend::Scylla => "scylla",
            StoreBackend::Memory => "memory",
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scylla" | "scylladb" => Ok(StoreBackend::Scylla),
            "memory" | "mem" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// REST API port
    pub api_port: u16,
    /// WebSocket port
    pub ws_port: u16,
    /// Enable CORS for all origins (development)
    pub cors_permissive: bool,
    pub jwt_secret: String,
    pub store_backend: StoreBackend,
    pub db: DbConfig,
    pub tracker: TrackerConfig,
    /// OpenWeatherMap-compatible endpoint; fixed conditions are used without a key
    pub weather_api_url: String,
    pub weather_api_key: Option<String>,
    pub weather_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            api_port: 3000,
            ws_port: 3002,
            cors_permissive: true,
            jwt_secret: DEV_JWT_SECRET.to_string(),
            store_backend: StoreBackend::Scylla,
            db: DbConfig::default(),
            tracker: TrackerConfig::default(),
            weather_api_url: "https://api.openweathermap.org/data/2.5/weather".to_string(),
            weather_api_key: None,
            weather_timeout: Duration::from_secs(5),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl ApiConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let cors_permissive = std::env::var("CORS_PERMISSIVE")
            .map(|s| s == "true" || s == "1")
            .unwrap_or(defaults.cors_permissive);

        let tracker = TrackerConfig {
            inactive_threshold: env_parse::<u64>("INACTIVE_THRESHOLD_MINUTES")
                .map(|m| Duration::from_secs(m * 60))
                .unwrap_or(defaults.tracker.inactive_threshold),
            reaper_interval: env_parse::<u64>("REAPER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tracker.reaper_interval),
            zone_cache_ttl: env_parse::<u64>("ZONE_CACHE_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.tracker.zone_cache_ttl),
            engine_workers: env_parse("ENGINE_WORKERS").unwrap_or(defaults.tracker.engine_workers),
            engine_queue_capacity: env_parse("ENGINE_QUEUE_CAPACITY")
                .unwrap_or(defaults.tracker.engine_queue_capacity),
            ..defaults.tracker.clone()
        };

        Self {
            api_port: env_parse("API_PORT").unwrap_or(defaults.api_port),
            ws_port: env_parse("WS_PORT").unwrap_or(defaults.ws_port),
            cors_permissive,
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or(defaults.jwt_secret),
            store_backend: env_parse("STORE_BACKEND").unwrap_or(defaults.store_backend),
            db: DbConfig::from_env(),
            tracker,
            weather_api_url: std::env::var("WEATHER_API_URL").unwrap_or(defaults.weather_api_url),
            weather_api_key: std::env::var("WEATHER_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            weather_timeout: defaults.weather_timeout,
        }
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!("scylla".parse::<StoreBackend>().unwrap(), StoreBackend::Scylla);
        assert_eq!(" Memory ".parse::<StoreBackend>().unwrap(), StoreBackend::Memory);
        assert!("postgres".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = ApiConfig::default();
        assert_eq!(config.api_port, 3000);
        assert_eq!(config.ws_port, 3002);
        assert!(config.uses_dev_secret());
        assert_eq!(config.tracker.inactive_threshold, Duration::from_secs(30 * 60));
    }
}
