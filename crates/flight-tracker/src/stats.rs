//! Flight statistics derived from a session's point history

use crate::error::TrackerResult;

use flight_core::{CoreError, FlightStats, SessionId, TelemetryPoint};
use flight_db::FlightStore;
use std::sync::Arc;
use tracing::{debug, warn};

/// Derive statistics from points in any order.
///
/// Points are sorted by timestamp (then id) before distance is summed, so
/// every permutation of the same set yields the same result.
pub fn compute_stats(points: &[TelemetryPoint]) -> Option<FlightStats> {
    let mut sorted: Vec<&TelemetryPoint> = points.iter().collect();
    sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

    let first = *sorted.first()?;
    let last = *sorted.last()?;

    let total_distance_meters = sorted
        .windows(2)
        .map(|pair| pair[0].position().distance_to(&pair[1].position()))
        .sum();

    let max_of = |f: fn(&TelemetryPoint) -> f64| sorted.iter().map(|p| f(p)).reduce(f64::max);

    Some(FlightStats {
        duration_seconds: Some((last.timestamp - first.timestamp).num_seconds()),
        total_distance_meters,
        max_altitude_meters: max_of(|p| p.altitude_meters),
        max_speed_mps: max_of(|p| p.speed_mps),
        min_battery_percent: sorted.iter().map(|p| p.battery_percent).reduce(f64::min),
        start_position: Some(first.position()),
        end_position: Some(last.position()),
    })
}

/// Recomputes and persists session statistics
pub struct StatisticsAggregator {
    store: Arc<dyn FlightStore>,
}

impl StatisticsAggregator {
    pub fn new(store: Arc<dyn FlightStore>) -> Self {
        Self { store }
    }

    /// Derive statistics from the stored points without persisting them
    pub async fn compute(&self, session_id: &SessionId) -> TrackerResult<Option<FlightStats>> {
        let points = self.store.points_for_session(session_id).await?;
        Ok(compute_stats(&points))
    }

    /// Rebuild the statistics block of an active session from scratch.
    ///
    /// Completed and cancelled sessions keep the stats written when they
    /// ended, which are returned unchanged. Returns `None` when an active
    /// session has no points yet.
    pub async fn recompute(&self, session_id: &SessionId) -> TrackerResult<Option<FlightStats>> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(session_id))?;
        if session.status.is_terminal() {
            debug!(session_id = %session_id, status = %session.status, "Session ended, stats frozen");
            return Ok(Some(session.stats));
        }

        let points = self.store.points_for_session(session_id).await?;
        let Some(stats) = compute_stats(&points) else {
            warn!(session_id = %session_id, "No telemetry points, skipping stats recompute");
            return Ok(None);
        };

        if !self.store.update_stats(session_id, &stats).await? {
            // Ended between the read and the write
            let frozen = self
                .store
                .get_session(session_id)
                .await?
                .map(|s| s.stats);
            debug!(session_id = %session_id, "Session ended during recompute, stats left frozen");
            return Ok(frozen);
        }

        debug!(
            session_id = %session_id,
            points = points.len(),
            distance_m = stats.total_distance_meters,
            "Recomputed flight stats"
        );
        Ok(Some(stats))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use flight_core::{DroneId, FlightSession, OperatorId, SessionStatus};
    use flight_db::MemoryStore;
    use uuid::Uuid;

    fn point(
        session_id: SessionId,
        at: DateTime<Utc>,
        latitude: f64,
        longitude: f64,
        altitude: f64,
        speed: f64,
        battery: f64,
    ) -> TelemetryPoint {
        TelemetryPoint {
            id: Uuid::new_v4(),
            session_id,
            drone_id: DroneId::new("drone-1"),
            timestamp: at,
            latitude,
            longitude,
            altitude_meters: altitude,
            speed_mps: speed,
            heading_degrees: None,
            battery_percent: battery,
            flight_mode: None,
            armed: true,
            raw: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_two_points_hundred_meters_apart() {
        let id = SessionId::new();
        let t0 = Utc::now();
        // 100 m of longitude at the equator
        let dlng = 100.0 / 111_194.93;
        let points = vec![
            point(id, t0, 0.0, 0.0, 50.0, 5.0, 50.0),
            point(id, t0 + Duration::seconds(10), 0.0, dlng, 60.0, 7.0, 48.0),
        ];

        let stats = compute_stats(&points).unwrap();
        assert_eq!(stats.duration_seconds, Some(10));
        assert!((stats.total_distance_meters - 100.0).abs() < 0.5);
        assert_eq!(stats.min_battery_percent, Some(48.0));
        assert_eq!(stats.max_altitude_meters, Some(60.0));
        assert_eq!(stats.max_speed_mps, Some(7.0));
        assert_eq!(stats.start_position.unwrap().longitude, 0.0);
    }

    #[test]
    fn test_order_independent() {
        let id = SessionId::new();
        let t0 = Utc::now();
        let points = vec![
            point(id, t0, 45.0, 7.0, 10.0, 1.0, 90.0),
            point(id, t0 + Duration::seconds(5), 45.001, 7.0, 40.0, 6.0, 88.0),
            point(id, t0 + Duration::seconds(9), 45.001, 7.002, 35.0, 9.0, 87.0),
            point(id, t0 + Duration::seconds(20), 45.0, 7.002, 20.0, 4.0, 85.0),
        ];
        let expected = compute_stats(&points).unwrap();

        let mut reversed = points.clone();
        reversed.reverse();
        let mut shuffled = points.clone();
        shuffled.swap(0, 2);
        shuffled.swap(1, 3);

        for permutation in [reversed, shuffled] {
            let stats = compute_stats(&permutation).unwrap();
            assert_eq!(stats, expected);
        }
    }

    #[test]
    fn test_no_points() {
        assert!(compute_stats(&[]).is_none());
    }

    #[tokio::test]
    async fn test_recompute_persists_stats() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        let session = FlightSession::new(DroneId::new("drone-1"), OperatorId::new("op-1"), "k", t0);
        store.insert_session(&session).await.unwrap();
        store
            .insert_points(&[
                point(session.id, t0 + Duration::seconds(3), 1.0, 1.001, 30.0, 3.0, 70.0),
                point(session.id, t0, 1.0, 1.0, 10.0, 2.0, 75.0),
            ])
            .await
            .unwrap();

        let aggregator = StatisticsAggregator::new(store.clone());
        let stats = aggregator.recompute(&session.id).await.unwrap().unwrap();
        assert_eq!(stats.duration_seconds, Some(3));

        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.stats, stats);
        assert_eq!(stored.home().unwrap().longitude, 1.0);
    }

    #[tokio::test]
    async fn test_recompute_without_points_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let session = FlightSession::new(DroneId::new("drone-1"), OperatorId::new("op-1"), "k", Utc::now());
        store.insert_session(&session).await.unwrap();

        let aggregator = StatisticsAggregator::new(store.clone());
        assert!(aggregator.recompute(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recompute_leaves_ended_session_untouched() {
        let store = Arc::new(MemoryStore::new());
        let t0 = Utc::now();
        let session = FlightSession::new(DroneId::new("drone-1"), OperatorId::new("op-1"), "k", t0);
        store.insert_session(&session).await.unwrap();
        store
            .insert_points(&[point(session.id, t0, 1.0, 1.0, 10.0, 2.0, 90.0)])
            .await
            .unwrap();

        let aggregator = StatisticsAggregator::new(store.clone());
        let final_stats = aggregator.compute(&session.id).await.unwrap();
        store
            .transition_status(&session.id, SessionStatus::Completed, t0, final_stats.clone())
            .await
            .unwrap();

        // Stored after the flight ended, kept for audit only
        store
            .insert_points(&[point(session.id, t0 + Duration::seconds(60), 1.01, 1.0, 10.0, 2.0, 10.0)])
            .await
            .unwrap();

        let stats = aggregator.recompute(&session.id).await.unwrap();
        assert_eq!(stats, final_stats);
        let stored = store.get_session(&session.id).await.unwrap().unwrap();
        assert_eq!(stored.stats.min_battery_percent, Some(90.0));
    }

    #[tokio::test]
    async fn test_recompute_unknown_session() {
        let aggregator = StatisticsAggregator::new(Arc::new(MemoryStore::new()));
        let err = aggregator.recompute(&SessionId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
