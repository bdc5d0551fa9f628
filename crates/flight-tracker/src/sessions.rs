//! Flight session lifecycle

use crate::error::{TrackerError, TrackerResult};
use crate::stats::StatisticsAggregator;

use chrono::{DateTime, Utc};
use flight_core::{
    Broadcaster, CoreError, DroneId, FlightSession, FlightUpdate, OperatorId, SessionId,
    SessionStatus,
};
use flight_db::{DbError, FlightStore, StatusTransition};
use flight_metrics::MetricsCollector;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Reason attached to updates published for reaped sessions
pub const INACTIVITY_REASON: &str = "Session completed after telemetry inactivity";

pub struct SessionManager {
    store: Arc<dyn FlightStore>,
    stats: Arc<StatisticsAggregator>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn FlightStore>,
        stats: Arc<StatisticsAggregator>,
        broadcaster: Arc<dyn Broadcaster>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            stats,
            broadcaster,
            metrics,
        }
    }

    /// Find the operator's session for `session_key`, creating it if absent.
    ///
    /// Concurrent first calls for the same key race on the store's unique
    /// key; the loser fetches the winner's session.
    pub async fn resolve_or_create(
        &self,
        drone_id: &DroneId,
        operator_id: &OperatorId,
        session_key: &str,
        observed_at: DateTime<Utc>,
    ) -> TrackerResult<FlightSession> {
        if let Some(session) = self.store.find_session_by_key(operator_id, session_key).await? {
            return Ok(session);
        }

        let session = FlightSession::new(drone_id.clone(), operator_id.clone(), session_key, observed_at);
        match self.store.insert_session(&session).await {
            Ok(()) => {
                info!(
                    session_id = %session.id,
                    drone_id = %drone_id,
                    session_key,
                    "Flight session created"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_session_created();
                }
                Ok(session)
            }
            Err(DbError::Duplicate(_)) => {
                debug!(session_key, "Lost session create race, fetching winner");
                self.store
                    .find_session_by_key(operator_id, session_key)
                    .await?
                    .ok_or_else(|| {
                        CoreError::internal(format!("session key {session_key} vanished after conflict"))
                            .into()
                    })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get(&self, id: &SessionId) -> TrackerResult<FlightSession> {
        self.store
            .get_session(id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(id).into())
    }

    /// Fetch a session the caller owns
    pub async fn get_owned(&self, id: &SessionId, operator_id: &OperatorId) -> TrackerResult<FlightSession> {
        let session = self.get(id).await?;
        if !session.is_owned_by(operator_id) {
            return Err(TrackerError::forbidden(format!("flight session {id}")));
        }
        Ok(session)
    }

    /// Move an active session to a terminal status.
    ///
    /// Completing a session writes its final statistics with the status
    /// change. Terminal sessions fail with `AlreadyTerminal`.
    pub async fn update_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: Option<DateTime<Utc>>,
    ) -> TrackerResult<FlightSession> {
        let current = self.get(id).await?;
        if current.status.is_terminal() {
            return Err(CoreError::already_terminal(id, current.status).into());
        }
        if !status.is_terminal() {
            return Err(CoreError::InvalidStateTransition {
                from: current.status.to_string(),
                to: status.to_string(),
            }
            .into());
        }

        self.finish(id, status, ended_at.unwrap_or_else(Utc::now), None)
            .await
    }

    /// Complete a session on the reaper's behalf.
    ///
    /// Without an explicit end time the last telemetry timestamp is used,
    /// or one minute after start when the session has no points.
    pub async fn force_complete(
        &self,
        id: &SessionId,
        ended_at: Option<DateTime<Utc>>,
    ) -> TrackerResult<FlightSession> {
        let session = self.get(id).await?;
        if session.status.is_terminal() {
            return Err(CoreError::already_terminal(id, session.status).into());
        }

        let ended_at = match ended_at {
            Some(at) => at,
            None => session.fallback_end(self.store.last_point_at(id).await?),
        };

        self.finish(
            id,
            SessionStatus::Completed,
            ended_at,
            Some(INACTIVITY_REASON.to_string()),
        )
        .await
    }

    async fn finish(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
        reason: Option<String>,
    ) -> TrackerResult<FlightSession> {
        // Final stats go out with the status change; they are frozen after it
        let final_stats = if status == SessionStatus::Completed {
            match self.stats.compute(id).await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Stats recompute on completion failed");
                    None
                }
            }
        } else {
            None
        };

        let session = match self
            .store
            .transition_status(id, status, ended_at, final_stats)
            .await?
        {
            StatusTransition::Applied(session) => session,
            StatusTransition::Rejected(current) => {
                return Err(CoreError::already_terminal(id, current).into());
            }
        };

        info!(session_id = %id, status = %status, ended_at = %ended_at, "Flight session ended");
        if let Some(metrics) = &self.metrics {
            metrics.record_session_ended(status);
        }

        self.broadcaster.publish_status(
            id,
            FlightUpdate {
                status,
                ended_at: Some(ended_at),
                stats: Some(session.stats.clone()),
                reason,
            },
        );
        Ok(session)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingBroadcaster;
    use chrono::Duration;
    use flight_core::{ServerMessage, TelemetryInput};
    use flight_db::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, Arc<RecordingBroadcaster>, Arc<SessionManager>) {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let stats = Arc::new(StatisticsAggregator::new(store.clone()));
        let manager = SessionManager::new(store.clone(), stats, broadcaster.clone(), None);
        (store, broadcaster, Arc::new(manager))
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (_, _, manager) = manager();
        let drone = DroneId::new("drone-1");
        let op = OperatorId::new("op-1");
        let t0 = Utc::now();

        let first = manager.resolve_or_create(&drone, &op, "key", t0).await.unwrap();
        let second = manager
            .resolve_or_create(&drone, &op, "key", t0 + Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.started_at, t0);
        assert!(second.is_active());
    }

    #[tokio::test]
    async fn test_concurrent_first_points_share_session() {
        let (store, _, manager) = manager();
        let drone = DroneId::new("drone-1");
        let op = OperatorId::new("op-1");
        let t0 = Utc::now();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                let drone = drone.clone();
                let op = op.clone();
                tokio::spawn(async move { manager.resolve_or_create(&drone, &op, "burst", t0).await })
            })
            .collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().unwrap().id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_same_key_different_operators() {
        let (_, _, manager) = manager();
        let drone = DroneId::new("drone-1");
        let t0 = Utc::now();

        let a = manager
            .resolve_or_create(&drone, &OperatorId::new("op-a"), "key", t0)
            .await
            .unwrap();
        let b = manager
            .resolve_or_create(&drone, &OperatorId::new("op-b"), "key", t0)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_complete_recomputes_and_publishes() {
        let (store, broadcaster, manager) = manager();
        let drone = DroneId::new("drone-1");
        let op = OperatorId::new("op-1");
        let t0 = Utc::now();
        let session = manager.resolve_or_create(&drone, &op, "key", t0).await.unwrap();

        let points: Vec<_> = [(0.0, 0.0), (0.0, 0.001)]
            .into_iter()
            .enumerate()
            .map(|(i, (lat, lng))| {
                TelemetryInput {
                    latitude: lat,
                    longitude: lng,
                    altitude: 30.0,
                    battery: 90.0 - i as f64,
                    timestamp: Some(t0 + Duration::seconds(i as i64 * 4)),
                    ..Default::default()
                }
                .into_point(session.id, drone.clone(), t0)
            })
            .collect();
        store.insert_points(&points).await.unwrap();

        let done = manager
            .update_status(&session.id, SessionStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.ended_at.is_some());
        assert_eq!(done.stats.duration_seconds, Some(4));

        let sent = broadcaster.flight_messages(&session.id);
        assert!(matches!(
            sent.as_slice(),
            [ServerMessage::FlightUpdate { data, .. }] if data.status == SessionStatus::Completed
        ));
    }

    #[tokio::test]
    async fn test_terminal_session_rejects_update() {
        let (_, _, manager) = manager();
        let session = manager
            .resolve_or_create(&DroneId::new("d"), &OperatorId::new("o"), "k", Utc::now())
            .await
            .unwrap();

        manager
            .update_status(&session.id, SessionStatus::Cancelled, None)
            .await
            .unwrap();
        let err = manager
            .update_status(&session.id, SessionStatus::Completed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Core(CoreError::AlreadyTerminal { .. })));

        let err = manager.force_complete(&session.id, None).await.unwrap_err();
        assert!(matches!(err, TrackerError::Core(CoreError::AlreadyTerminal { .. })));
    }

    #[tokio::test]
    async fn test_force_complete_without_points_ends_one_minute_after_start() {
        let (_, broadcaster, manager) = manager();
        let t0 = Utc::now() - Duration::hours(2);
        let session = manager
            .resolve_or_create(&DroneId::new("d"), &OperatorId::new("o"), "k", t0)
            .await
            .unwrap();

        let done = manager.force_complete(&session.id, None).await.unwrap();
        assert_eq!(done.ended_at, Some(t0 + Duration::minutes(1)));

        let sent = broadcaster.flight_messages(&session.id);
        assert!(matches!(
            sent.as_slice(),
            [ServerMessage::FlightUpdate { data, .. }] if data.reason.as_deref() == Some(INACTIVITY_REASON)
        ));
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_sessions() {
        let (_, _, manager) = manager();
        let err = manager.get(&SessionId::new()).await.unwrap_err();
        assert!(err.is_not_found());

        let session = manager
            .resolve_or_create(&DroneId::new("d"), &OperatorId::new("owner"), "k", Utc::now())
            .await
            .unwrap();
        let err = manager
            .get_owned(&session.id, &OperatorId::new("intruder"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrackerError::Forbidden(_)));
    }
}
