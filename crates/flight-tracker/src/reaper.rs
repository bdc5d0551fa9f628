//! Background sweep that completes sessions which stopped sending telemetry

use crate::error::{TrackerError, TrackerResult};
use crate::sessions::SessionManager;

use chrono::Utc;
use flight_core::CoreError;
use flight_db::FlightStore;
use flight_metrics::MetricsCollector;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct IdleSessionReaper {
    store: Arc<dyn FlightStore>,
    sessions: Arc<SessionManager>,
    threshold: chrono::Duration,
    interval: Duration,
    metrics: Option<Arc<MetricsCollector>>,
}

impl IdleSessionReaper {
    pub fn new(
        store: Arc<dyn FlightStore>,
        sessions: Arc<SessionManager>,
        threshold: Duration,
        interval: Duration,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            sessions,
            threshold: chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::minutes(30)),
            interval,
            metrics,
        }
    }

    /// Complete every active session idle longer than the threshold.
    ///
    /// Returns how many were completed. A failure on one session is logged
    /// and the sweep moves on.
    pub async fn sweep(&self) -> TrackerResult<usize> {
        let now = Utc::now();
        let active = self.store.active_sessions().await?;
        let mut completed = 0;

        for session in active {
            let last_point = match self.store.last_point_at(&session.id).await {
                Ok(last) => last,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Could not read last point, skipping");
                    continue;
                }
            };

            let last_activity = last_point.unwrap_or(session.started_at);
            if now - last_activity <= self.threshold {
                continue;
            }

            let ended_at = session.fallback_end(last_point);
            match self.sessions.force_complete(&session.id, Some(ended_at)).await {
                Ok(_) => {
                    info!(session_id = %session.id, ended_at = %ended_at, "Reaped idle session");
                    completed += 1;
                }
                Err(TrackerError::Core(CoreError::AlreadyTerminal { .. })) => {
                    debug!(session_id = %session.id, "Session ended before the reaper got to it");
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Failed to reap idle session");
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_sessions_reaped(completed);
        }
        Ok(completed)
    }

    /// Sweep immediately, then on every interval until cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            interval_s = self.interval.as_secs(),
            threshold_min = self.threshold.num_minutes(),
            "Idle session reaper started"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(0) => debug!("No idle sessions"),
                        Ok(count) => info!(count, "Idle session sweep completed"),
                        Err(e) => error!(error = %e, "Idle session sweep failed"),
                    }
                }
            }
        }

        info!("Idle session reaper stopped");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatisticsAggregator;
    use crate::test_support::RecordingBroadcaster;
    use chrono::Duration as ChronoDuration;
    use flight_core::{DroneId, FlightSession, OperatorId, SessionStatus, TelemetryInput};
    use flight_db::{DbError, MemoryStore, MockFlightStore};

    fn reaper_over(store: Arc<dyn FlightStore>) -> IdleSessionReaper {
        let stats = Arc::new(StatisticsAggregator::new(store.clone()));
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            stats,
            Arc::new(RecordingBroadcaster::default()),
            None,
        ));
        IdleSessionReaper::new(
            store,
            sessions,
            Duration::from_secs(30 * 60),
            Duration::from_secs(300),
            None,
        )
    }

    async fn session_with_point(store: &MemoryStore, key: &str, last_point_age: ChronoDuration) -> FlightSession {
        let now = Utc::now();
        let session = FlightSession::new(
            DroneId::new("drone-1"),
            OperatorId::new("op-1"),
            key,
            now - last_point_age - ChronoDuration::minutes(5),
        );
        store.insert_session(&session).await.unwrap();

        let point = TelemetryInput {
            latitude: 1.0,
            longitude: 1.0,
            altitude: 20.0,
            battery: 70.0,
            timestamp: Some(now - last_point_age),
            ..Default::default()
        }
        .into_point(session.id, session.drone_id.clone(), now);
        store.insert_points(&[point]).await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_sweep_completes_only_idle_sessions() {
        let store = Arc::new(MemoryStore::new());
        let idle = session_with_point(&store, "idle", ChronoDuration::minutes(45)).await;
        let live = session_with_point(&store, "live", ChronoDuration::minutes(2)).await;

        let reaper = reaper_over(store.clone());
        assert_eq!(reaper.sweep().await.unwrap(), 1);

        let idle_after = store.get_session(&idle.id).await.unwrap().unwrap();
        assert_eq!(idle_after.status, SessionStatus::Completed);
        let last = store.last_point_at(&idle.id).await.unwrap();
        assert_eq!(idle_after.ended_at, last);
        assert!(idle_after.stats.start_position.is_some());

        let live_after = store.get_session(&live.id).await.unwrap().unwrap();
        assert!(live_after.is_active());

        // Second sweep has nothing left to do
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_with_no_sessions() {
        let reaper = reaper_over(Arc::new(MemoryStore::new()));
        assert_eq!(reaper.sweep().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let stale = Utc::now() - ChronoDuration::hours(2);
        let broken = FlightSession::new(DroneId::new("a"), OperatorId::new("o"), "broken", stale);
        let healthy = FlightSession::new(DroneId::new("b"), OperatorId::new("o"), "healthy", stale);
        let broken_id = broken.id;

        let mut store = MockFlightStore::new();
        let listed = vec![broken.clone(), healthy.clone()];
        store.expect_active_sessions().returning(move || Ok(listed.clone()));
        store.expect_last_point_at().returning(move |id| {
            if *id == broken_id {
                Err(DbError::Timeout("slow".into()))
            } else {
                Ok(None)
            }
        });
        let fetched = healthy.clone();
        store
            .expect_get_session()
            .returning(move |_| Ok(Some(fetched.clone())));
        store.expect_transition_status().returning(move |_, status, ended_at, _| {
            let mut done = healthy.clone();
            done.status = status;
            done.ended_at = Some(ended_at);
            Ok(flight_db::StatusTransition::Applied(done))
        });
        store.expect_points_for_session().returning(|_| Ok(Vec::new()));

        let reaper = reaper_over(Arc::new(store));
        assert_eq!(reaper.sweep().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_cancel() {
        let reaper = Arc::new(reaper_over(Arc::new(MemoryStore::new())));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(reaper.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(601)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
