//! # Flight Tracker - Tracking Engine
//!
//! Real-time flight tracking on top of the storage layer. Ingestion is
//! synchronous only up to the durable write; everything derived from a point
//! is queued on the [`TrackingEngine`].
//!
//! ## Components
//! - [`SessionManager`]: session lifecycle
//! - [`StatisticsAggregator`]: duration, distance and extremes
//! - [`GeofenceEngine`] over a cached [`ZoneStore`]: zone violations
//! - [`RthCalculator`]: return-to-home estimates and commands
//! - [`IdleSessionReaper`]: completes sessions that went quiet

pub mod engine;
pub mod error;
pub mod geofence;
pub mod reaper;
pub mod rth;
pub mod sessions;
pub mod stats;
pub mod weather;
pub mod zones;

pub use engine::{EngineStats, Job, TrackingEngine};
pub use error::{TrackerError, TrackerResult};
pub use geofence::{GeofenceEngine, GeofenceOutcome};
pub use reaper::IdleSessionReaper;
pub use rth::{RthCalculator, RthEstimate, RthInput, Urgency};
pub use sessions::SessionManager;
pub use stats::{compute_stats, StatisticsAggregator};
pub use weather::{FixedWeather, OpenWeatherClient, WeatherConditions, WeatherProvider};
pub use zones::ZoneStore;

use chrono::Utc;
use flight_core::{
    default_session_key, Broadcaster, CoreError, DroneId, FlightSession, OperatorId, SessionId,
    TelemetryInput, TelemetryPoint,
};
use flight_db::FlightStore;
use flight_metrics::MetricsCollector;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Tracking engine configuration
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Sessions without telemetry for this long are completed by the reaper
    pub inactive_threshold: Duration,
    pub reaper_interval: Duration,
    pub zone_cache_ttl: Duration,
    /// How often expired zone cache entries are pruned
    pub zone_prune_interval: Duration,
    pub engine_workers: usize,
    /// Per-worker queue depth before ingestion waits
    pub engine_queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            inactive_threshold: Duration::from_secs(30 * 60),
            reaper_interval: Duration::from_secs(5 * 60),
            zone_cache_ttl: Duration::from_secs(5 * 60),
            zone_prune_interval: Duration::from_secs(10 * 60),
            engine_workers: 4,
            engine_queue_capacity: 1024,
        }
    }
}

/// Acknowledgment for a single ingested point
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub session_id: SessionId,
    pub point_id: Uuid,
}

/// Acknowledgment for a batch upload
#[derive(Debug, Clone, Serialize)]
pub struct BatchReceipt {
    pub session_id: SessionId,
    pub ingested: usize,
}

/// Main tracking coordinator
pub struct FlightTracker {
    config: TrackerConfig,
    store: Arc<dyn FlightStore>,
    zones: Arc<ZoneStore>,
    stats: Arc<StatisticsAggregator>,
    sessions: Arc<SessionManager>,
    rth: RthCalculator,
    reaper: Arc<IdleSessionReaper>,
    engine: TrackingEngine,
    metrics: Option<Arc<MetricsCollector>>,
}

impl FlightTracker {
    /// Wire the components and start the background workers.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: TrackerConfig,
        store: Arc<dyn FlightStore>,
        broadcaster: Arc<dyn Broadcaster>,
        weather: Arc<dyn WeatherProvider>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        info!("Initializing flight tracker...");

        let zones = Arc::new(ZoneStore::new(store.clone(), config.zone_cache_ttl));
        let stats = Arc::new(StatisticsAggregator::new(store.clone()));
        let geofence = Arc::new(GeofenceEngine::new(
            store.clone(),
            zones.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            stats.clone(),
            broadcaster.clone(),
            metrics.clone(),
        ));
        let rth = RthCalculator::new(store.clone(), weather, broadcaster.clone(), metrics.clone());
        let reaper = Arc::new(IdleSessionReaper::new(
            store.clone(),
            sessions.clone(),
            config.inactive_threshold,
            config.reaper_interval,
            metrics.clone(),
        ));
        let engine = TrackingEngine::start(
            &config,
            geofence,
            stats.clone(),
            broadcaster,
            metrics.clone(),
        );

        Self {
            config,
            store,
            zones,
            stats,
            sessions,
            rth,
            reaper,
            engine,
            metrics,
        }
    }

    /// Validate, resolve the session and durably record one point.
    ///
    /// Broadcast, geofence and recompute are queued; the caller does not
    /// wait for them.
    pub async fn ingest(
        &self,
        drone_id: &DroneId,
        operator_id: &OperatorId,
        input: TelemetryInput,
    ) -> TrackerResult<IngestReceipt> {
        input.validate()?;

        let received_at = Utc::now();
        let observed_at = input.observed_at(received_at);
        let session_key = input
            .session_id
            .clone()
            .unwrap_or_else(|| default_session_key(drone_id, observed_at));

        let session = self
            .sessions
            .resolve_or_create(drone_id, operator_id, &session_key, observed_at)
            .await?;

        let point = input.into_point(session.id, drone_id.clone(), received_at);
        self.store.insert_points(std::slice::from_ref(&point)).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_points_ingested(1);
        }

        let receipt = IngestReceipt {
            session_id: session.id,
            point_id: point.id,
        };
        self.dispatch(&session, operator_id, vec![point]).await;
        Ok(receipt)
    }

    /// Validate every point, then record them all under one session.
    ///
    /// The session starts at the earliest point. The geofence sees every
    /// point in chronological order and one recompute is queued.
    pub async fn ingest_batch(
        &self,
        drone_id: &DroneId,
        operator_id: &OperatorId,
        session_key: &str,
        inputs: Vec<TelemetryInput>,
    ) -> TrackerResult<BatchReceipt> {
        if session_key.trim().is_empty() {
            return Err(CoreError::invalid_telemetry("session key is required").into());
        }
        if inputs.is_empty() {
            return Err(CoreError::invalid_telemetry("points must not be empty").into());
        }
        for (index, input) in inputs.iter().enumerate() {
            input.validate().map_err(|e| {
                CoreError::invalid_telemetry(format!("point {index}: {e}"))
            })?;
        }

        let received_at = Utc::now();
        let started_at = inputs
            .iter()
            .map(|input| input.observed_at(received_at))
            .min()
            .unwrap_or(received_at);

        let session = self
            .sessions
            .resolve_or_create(drone_id, operator_id, session_key, started_at)
            .await?;

        let mut points: Vec<TelemetryPoint> = inputs
            .into_iter()
            .map(|input| input.into_point(session.id, drone_id.clone(), received_at))
            .collect();
        self.store.insert_points(&points).await?;

        let ingested = points.len();
        if let Some(metrics) = &self.metrics {
            metrics.record_points_ingested(ingested);
            metrics.record_batch(ingested);
        }
        info!(session_id = %session.id, ingested, "Telemetry batch recorded");

        points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        self.dispatch(&session, operator_id, points).await;

        Ok(BatchReceipt {
            session_id: session.id,
            ingested,
        })
    }

    /// Queue derived-state work for freshly written points
    async fn dispatch(&self, session: &FlightSession, operator_id: &OperatorId, points: Vec<TelemetryPoint>) {
        // Terminal sessions keep points for audit only
        if !session.is_active() {
            debug!(session_id = %session.id, status = %session.status, "Point recorded for ended session");
            return;
        }

        if let Some(latest) = points.iter().max_by_key(|p| p.timestamp) {
            self.engine
                .submit(session.id, Job::Broadcast { point: latest.clone() })
                .await;
        }
        self.engine
            .submit(
                session.id,
                Job::Geofence {
                    operator_id: operator_id.clone(),
                    points,
                },
            )
            .await;
        self.engine.submit(session.id, Job::Recompute).await;
    }

    /// Spawn the reaper and the zone cache pruner
    pub fn spawn_background(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let reaper = tokio::spawn(self.reaper.clone().run(shutdown.clone()));

        let zones = self.zones.clone();
        let interval = self.config.zone_prune_interval;
        let pruner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick fires immediately and the cache is empty then
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        zones.prune();
                    }
                }
            }
        });

        vec![reaper, pruner]
    }

    /// Drain queued background work and stop the workers
    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FlightStore> {
        &self.store
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn statistics(&self) -> &StatisticsAggregator {
        &self.stats
    }

    pub fn zones(&self) -> &ZoneStore {
        &self.zones
    }

    pub fn rth(&self) -> &RthCalculator {
        &self.rth
    }

    pub fn reaper(&self) -> &IdleSessionReaper {
        &self.reaper
    }

    pub fn engine(&self) -> &TrackingEngine {
        &self.engine
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use flight_core::{Broadcaster, OperatorId, ServerMessage, SessionId};
    use parking_lot::Mutex;

    /// Broadcaster that records everything it is asked to send
    #[derive(Default)]
    pub struct RecordingBroadcaster {
        flights: Mutex<Vec<(SessionId, ServerMessage)>>,
        operators: Mutex<Vec<(OperatorId, ServerMessage)>>,
    }

    impl RecordingBroadcaster {
        pub fn flight_messages(&self, flight_id: &SessionId) -> Vec<ServerMessage> {
            self.flights
                .lock()
                .iter()
                .filter(|(id, _)| id == flight_id)
                .map(|(_, m)| m.clone())
                .collect()
        }

        pub fn operator_messages(&self, operator_id: &OperatorId) -> Vec<ServerMessage> {
            self.operators
                .lock()
                .iter()
                .filter(|(id, _)| id == operator_id)
                .map(|(_, m)| m.clone())
                .collect()
        }
    }

    impl Broadcaster for RecordingBroadcaster {
        fn send_to_flight(&self, flight_id: &SessionId, message: ServerMessage) -> usize {
            self.flights.lock().push((*flight_id, message));
            1
        }

        fn send_to_operator(&self, operator_id: &OperatorId, message: ServerMessage) -> usize {
            self.operators.lock().push((operator_id.clone(), message));
            1
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBroadcaster;
    use flight_core::SessionStatus;
    use flight_db::MemoryStore;

    fn tracker() -> (Arc<MemoryStore>, Arc<RecordingBroadcaster>, FlightTracker) {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let tracker = FlightTracker::new(
            TrackerConfig::default(),
            store.clone(),
            broadcaster.clone(),
            Arc::new(FixedWeather::default()),
            None,
        );
        (store, broadcaster, tracker)
    }

    fn sample(key: Option<&str>, battery: f64) -> TelemetryInput {
        TelemetryInput {
            session_id: key.map(str::to_string),
            latitude: 45.0,
            longitude: 7.0,
            altitude: 120.0,
            battery,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_point_is_rejected_before_write() {
        let (store, _, tracker) = tracker();
        let mut input = sample(Some("k"), 50.0);
        input.latitude = 95.0;

        let err = tracker
            .ingest(&DroneId::new("d"), &OperatorId::new("o"), input)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Core(CoreError::InvalidPosition { .. })));
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_uses_drone_default() {
        let (store, _, tracker) = tracker();
        let drone = DroneId::new("drone-7");

        let receipt = tracker
            .ingest(&drone, &OperatorId::new("o"), sample(None, 80.0))
            .await
            .unwrap();
        let session = store.get_session(&receipt.session_id).await.unwrap().unwrap();
        assert!(session.session_key.starts_with("session_drone-7_"));
    }

    #[tokio::test]
    async fn test_ingest_broadcasts_and_recomputes() {
        let (store, broadcaster, tracker) = tracker();
        let receipt = tracker
            .ingest(&DroneId::new("d"), &OperatorId::new("o"), sample(Some("k"), 64.0))
            .await
            .unwrap();
        assert!(tracker.engine().wait_idle(Duration::from_secs(5)).await);

        assert_eq!(broadcaster.flight_messages(&receipt.session_id).len(), 1);
        let session = store.get_session(&receipt.session_id).await.unwrap().unwrap();
        assert_eq!(session.stats.min_battery_percent, Some(64.0));
    }

    #[tokio::test]
    async fn test_batch_requires_points_and_key() {
        let (_, _, tracker) = tracker();
        let drone = DroneId::new("d");
        let op = OperatorId::new("o");

        let err = tracker.ingest_batch(&drone, &op, "k", Vec::new()).await.unwrap_err();
        assert!(matches!(err, TrackerError::Core(CoreError::InvalidTelemetry(_))));

        let err = tracker
            .ingest_batch(&drone, &op, " ", vec![sample(None, 50.0)])
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Core(CoreError::InvalidTelemetry(_))));
    }

    #[tokio::test]
    async fn test_batch_with_one_bad_point_writes_nothing() {
        let (store, _, tracker) = tracker();
        let mut bad = sample(None, 50.0);
        bad.battery = 140.0;

        let result = tracker
            .ingest_batch(
                &DroneId::new("d"),
                &OperatorId::new("o"),
                "k",
                vec![sample(None, 60.0), bad],
            )
            .await;
        assert!(result.is_err());
        assert_eq!(store.session_count(), 0);
    }

    #[tokio::test]
    async fn test_point_for_ended_session_is_stored_only() {
        let (store, broadcaster, tracker) = tracker();
        let drone = DroneId::new("d");
        let op = OperatorId::new("o");

        let first = tracker.ingest(&drone, &op, sample(Some("k"), 90.0)).await.unwrap();
        assert!(tracker.engine().wait_idle(Duration::from_secs(5)).await);
        tracker
            .sessions()
            .update_status(&first.session_id, SessionStatus::Completed, None)
            .await
            .unwrap();
        let before = broadcaster.flight_messages(&first.session_id).len();
        let queued = tracker.engine().stats().jobs_queued;

        let late = tracker.ingest(&drone, &op, sample(Some("k"), 10.0)).await.unwrap();
        assert_eq!(late.session_id, first.session_id);
        assert_eq!(tracker.engine().stats().jobs_queued, queued);
        assert_eq!(broadcaster.flight_messages(&first.session_id).len(), before);

        let session = store.get_session(&first.session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(session.stats.min_battery_percent, Some(90.0));
        assert_eq!(store.points_for_session(&first.session_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_completed_stats_survive_late_points_and_recompute_jobs() {
        let (store, _, tracker) = tracker();
        let drone = DroneId::new("d");
        let op = OperatorId::new("o");

        let first = tracker.ingest(&drone, &op, sample(Some("k"), 90.0)).await.unwrap();
        assert!(tracker.engine().wait_idle(Duration::from_secs(5)).await);
        let ended = tracker
            .sessions()
            .update_status(&first.session_id, SessionStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(ended.stats.min_battery_percent, Some(90.0));

        tracker.ingest(&drone, &op, sample(Some("k"), 10.0)).await.unwrap();

        // A recompute still queued from before completion, then a manual one
        tracker.engine().submit(first.session_id, Job::Recompute).await;
        assert!(tracker.engine().wait_idle(Duration::from_secs(5)).await);
        let manual = tracker.statistics().recompute(&first.session_id).await.unwrap();

        assert_eq!(manual, Some(ended.stats.clone()));
        let session = store.get_session(&first.session_id).await.unwrap().unwrap();
        assert_eq!(session.stats, ended.stats);
    }
}
