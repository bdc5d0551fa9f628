//! Geofence engine: opens and closes zone violations per point
//!
//! Callers must serialize evaluations per session (the tracking engine
//! routes every session to a single worker). The store's open-violation
//! uniqueness rule is the backstop if two evaluations ever race.

use crate::error::TrackerResult;
use crate::zones::ZoneStore;

use chrono::{DateTime, Utc};
use flight_core::{
    Broadcaster, GeoPosition, OperatorId, SessionId, Warning, ZoneId, ZoneViolation,
};
use flight_db::{DbError, FlightStore};
use flight_metrics::MetricsCollector;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// What one evaluation changed
#[derive(Debug, Default)]
pub struct GeofenceOutcome {
    pub entered: Vec<ZoneViolation>,
    pub exited: Vec<ZoneViolation>,
    /// Open violations whose altitude peak was raised
    pub updated: usize,
}

impl GeofenceOutcome {
    pub fn is_empty(&self) -> bool {
        self.entered.is_empty() && self.exited.is_empty() && self.updated == 0
    }
}

pub struct GeofenceEngine {
    store: Arc<dyn FlightStore>,
    zones: Arc<ZoneStore>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl GeofenceEngine {
    pub fn new(
        store: Arc<dyn FlightStore>,
        zones: Arc<ZoneStore>,
        broadcaster: Arc<dyn Broadcaster>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            zones,
            broadcaster,
            metrics,
        }
    }

    /// Evaluate one position observed at `at` for `session_id`
    pub async fn check_point(
        &self,
        session_id: &SessionId,
        operator_id: &OperatorId,
        position: GeoPosition,
        at: DateTime<Utc>,
    ) -> TrackerResult<GeofenceOutcome> {
        let inside = self
            .zones
            .containing(operator_id, position.latitude, position.longitude, position.altitude)
            .await?;
        let open = self.store.open_violations(session_id).await?;

        let mut outcome = GeofenceOutcome::default();

        for zone in &inside {
            match open.iter().find(|v| v.zone_id == zone.id) {
                Some(existing) => {
                    if position.altitude > existing.max_altitude_meters {
                        let mut violation = existing.clone();
                        violation.max_altitude_meters = position.altitude;
                        self.store.update_violation(&violation).await?;
                        outcome.updated += 1;
                    }
                }
                None => {
                    let violation = ZoneViolation::open(*session_id, zone, position.altitude, at);
                    match self.store.insert_violation(&violation).await {
                        Ok(()) => {}
                        Err(DbError::Duplicate(_)) => {
                            debug!(session_id = %session_id, zone_id = %zone.id, "Violation already open");
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    }

                    info!(
                        session_id = %session_id,
                        zone_id = %zone.id,
                        zone = %zone.name,
                        severity = %violation.severity,
                        "Danger zone entered"
                    );
                    self.broadcaster.publish_warning(
                        operator_id,
                        Warning::zone_entered(*session_id, zone, position),
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_violation_opened(violation.severity.as_str());
                    }
                    outcome.entered.push(violation);
                }
            }
        }

        let inside_ids: HashSet<ZoneId> = inside.iter().map(|z| z.id).collect();
        for violation in open.into_iter().filter(|v| !inside_ids.contains(&v.zone_id)) {
            let mut violation = violation;
            violation.close(at);
            self.store.update_violation(&violation).await?;

            info!(
                session_id = %session_id,
                zone_id = %violation.zone_id,
                duration_s = violation.duration_seconds.unwrap_or_default(),
                "Danger zone exited"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_violation_closed();
            }
            outcome.exited.push(violation);
        }

        Ok(outcome)
    }
}

// ============================================================================
// TESTS
// ============================================================================
