//! Application state management

use crate::auth::JwtVerifier;
use crate::config::{ApiConfig, StoreBackend};

use async_trait::async_trait;
use flight_core::{OperatorId, SessionId};
use flight_db::{FlightStore, MemoryStore, ScyllaStore};
use flight_metrics::MetricsCollector;
use flight_tracker::{FixedWeather, FlightTracker, OpenWeatherClient, WeatherProvider};
use flight_websocket::{FlightAccess, WebSocketHub};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    pub store: Arc<dyn FlightStore>,
    /// Backend actually in use, which differs from the configured one in degraded mode
    pub backend: StoreBackend,
    pub tracker: Arc<FlightTracker>,
    pub ws_hub: Arc<WebSocketHub>,
    pub jwt: Arc<JwtVerifier>,
    pub metrics: Arc<MetricsCollector>,
}

/// Observers may watch flights their operator owns
pub struct StoreFlightAccess {
    store: Arc<dyn FlightStore>,
}

#[async_trait]
impl FlightAccess for StoreFlightAccess {
    async fn can_observe(&self, operator_id: &OperatorId, flight_id: &SessionId) -> bool {
        match self.store.get_session(flight_id).await {
            Ok(Some(session)) => session.is_owned_by(operator_id),
            Ok(None) => false,
            Err(e) => {
                warn!(flight_id = %flight_id, error = %e, "Ownership lookup failed");
                false
            }
        }
    }
}

/// Open the configured store, falling back to memory when Scylla is unreachable
pub async fn connect_store(config: &ApiConfig) -> (Arc<dyn FlightStore>, StoreBackend) {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory store");
            (Arc::new(MemoryStore::new()), StoreBackend::Memory)
        }
        StoreBackend::Scylla => match ScyllaStore::connect(config.db.clone()).await {
            Ok(store) => {
                info!(hosts = ?config.db.hosts, keyspace = %config.db.keyspace, "Database connected");
                (Arc::new(store), StoreBackend::Scylla)
            }
            Err(e) => {
                warn!(error = %e, "Database connection failed");
                warn!("Running in degraded mode (in-memory store, nothing is persisted)");
                (Arc::new(MemoryStore::new()), StoreBackend::Memory)
            }
        },
    }
}

impl AppState {
    /// Wire the tracker, hub and auth around `store`.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn FlightStore>,
        backend: StoreBackend,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(MetricsCollector::new()?);

        let access = Arc::new(StoreFlightAccess { store: store.clone() });
        let ws_hub = Arc::new(WebSocketHub::new(access, Some(metrics.clone())));
        info!("WebSocket hub initialized");

        let weather: Arc<dyn WeatherProvider> = match &config.weather_api_key {
            Some(key) => Arc::new(OpenWeatherClient::new(
                config.weather_api_url.clone(),
                key.clone(),
                config.weather_timeout,
            )?),
            None => {
                info!("No weather API key, RTH uses fixed conditions");
                Arc::new(FixedWeather::default())
            }
        };

        let tracker = Arc::new(FlightTracker::new(
            config.tracker.clone(),
            store.clone(),
            ws_hub.clone(),
            weather,
            Some(metrics.clone()),
        ));

        let jwt = Arc::new(JwtVerifier::new(&config.jwt_secret));

        Ok(Self {
            config: Arc::new(config),
            store,
            backend,
            tracker,
            ws_hub,
            jwt,
            metrics,
        })
    }

    pub fn ws_client_count(&self) -> usize {
        self.ws_hub.client_count()
    }
}
