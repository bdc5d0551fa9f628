//! In-process store
//!
//! Keeps everything in `DashMap`s and enforces the same uniqueness rules as
//! the ScyllaDB store, so tracking logic behaves identically on either.

use crate::{DbError, DbResult, FlightStore, StatusTransition};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use flight_core::{
    DangerZone, FlightSession, FlightStats, OperatorId, RiskEvent, SessionId, SessionStatus,
    TelemetryPoint, ZoneId, ZoneScope, ZoneViolation,
};

#[derive(Default)]
pub struct MemoryStore {
    sessions: DashMap<SessionId, FlightSession>,
    session_keys: DashMap<(OperatorId, String), SessionId>,
    points: DashMap<SessionId, Vec<TelemetryPoint>>,
    zones: DashMap<ZoneId, DangerZone>,
    violations: DashMap<SessionId, Vec<ZoneViolation>>,
    risk_events: DashMap<SessionId, Vec<RiskEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl FlightStore for MemoryStore {
    async fn insert_session(&self, session: &FlightSession) -> DbResult<()> {
        let key = (session.operator_id.clone(), session.session_key.clone());
        match self.session_keys.entry(key) {
            Entry::Occupied(_) => Err(DbError::duplicate(format!(
                "session key {} for operator {}",
                session.session_key, session.operator_id
            ))),
            Entry::Vacant(slot) => {
                self.sessions.insert(session.id, session.clone());
                slot.insert(session.id);
                Ok(())
            }
        }
    }

    async fn get_session(&self, id: &SessionId) -> DbResult<Option<FlightSession>> {
        Ok(self.sessions.get(id).map(|s| s.clone()))
    }

    async fn find_session_by_key(
        &self,
        operator_id: &OperatorId,
        session_key: &str,
    ) -> DbResult<Option<FlightSession>> {
        let id = self
            .session_keys
            .get(&(operator_id.clone(), session_key.to_string()))
            .map(|id| *id);

        Ok(id.and_then(|id| self.sessions.get(&id).map(|s| s.clone())))
    }

    async fn transition_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
        final_stats: Option<FlightStats>,
    ) -> DbResult<StatusTransition> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| DbError::not_found(format!("flight session {id}")))?;

        if session.status.is_terminal() {
            return Ok(StatusTransition::Rejected(session.status));
        }

        session.status = status;
        session.ended_at = Some(ended_at);
        if let Some(stats) = final_stats {
            session.stats = stats;
        }
        session.updated_at = Utc::now();
        Ok(StatusTransition::Applied(session.clone()))
    }

    async fn update_stats(&self, id: &SessionId, stats: &FlightStats) -> DbResult<bool> {
        let mut session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| DbError::not_found(format!("flight session {id}")))?;

        if session.status.is_terminal() {
            return Ok(false);
        }
        session.stats = stats.clone();
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn active_sessions(&self) -> DbResult<Vec<FlightSession>> {
        Ok(self
            .sessions
            .iter()
            .filter(|s| s.is_active())
            .map(|s| s.clone())
            .collect())
    }

    async fn insert_points(&self, points: &[TelemetryPoint]) -> DbResult<()> {
        for point in points {
            self.points
                .entry(point.session_id)
                .or_default()
                .push(point.clone());
        }
        Ok(())
    }

    async fn points_for_session(&self, id: &SessionId) -> DbResult<Vec<TelemetryPoint>> {
        let mut points = self.points.get(id).map(|p| p.clone()).unwrap_or_default();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    async fn last_point_at(&self, id: &SessionId) -> DbResult<Option<DateTime<Utc>>> {
        Ok(self
            .points
            .get(id)
            .and_then(|p| p.iter().map(|p| p.timestamp).max()))
    }

    async fn insert_zone(&self, zone: &DangerZone) -> DbResult<()> {
        match self.zones.entry(zone.id) {
            Entry::Occupied(_) => Err(DbError::duplicate(format!("danger zone {}", zone.id))),
            Entry::Vacant(slot) => {
                slot.insert(zone.clone());
                Ok(())
            }
        }
    }

    async fn update_zone(&self, zone: &DangerZone) -> DbResult<()> {
        let mut existing = self
            .zones
            .get_mut(&zone.id)
            .ok_or_else(|| DbError::not_found(format!("danger zone {}", zone.id)))?;
        *existing = zone.clone();
        Ok(())
    }

    async fn delete_zone(&self, id: &ZoneId) -> DbResult<bool> {
        Ok(self.zones.remove(id).is_some())
    }

    async fn get_zone(&self, id: &ZoneId) -> DbResult<Option<DangerZone>> {
        Ok(self.zones.get(id).map(|z| z.clone()))
    }

    async fn active_zones(&self, scope: &ZoneScope) -> DbResult<Vec<DangerZone>> {
        Ok(self
            .zones
            .iter()
            .filter(|z| z.active && scope.includes(z))
            .map(|z| z.clone())
            .collect())
    }

    async fn insert_violation(&self, violation: &ZoneViolation) -> DbResult<()> {
        let mut list = self.violations.entry(violation.session_id).or_default();
        if list
            .iter()
            .any(|v| v.zone_id == violation.zone_id && v.is_open())
        {
            return Err(DbError::duplicate(format!(
                "open violation for session {} zone {}",
                violation.session_id, violation.zone_id
            )));
        }
        list.push(violation.clone());
        Ok(())
    }

    async fn update_violation(&self, violation: &ZoneViolation) -> DbResult<()> {
        let mut list = self
            .violations
            .get_mut(&violation.session_id)
            .ok_or_else(|| DbError::not_found(format!("violation {}", violation.id)))?;
        let existing = list
            .iter_mut()
            .find(|v| v.id == violation.id)
            .ok_or_else(|| DbError::not_found(format!("violation {}", violation.id)))?;
        *existing = violation.clone();
        Ok(())
    }

    async fn open_violations(&self, session_id: &SessionId) -> DbResult<Vec<ZoneViolation>> {
        Ok(self
            .violations
            .get(session_id)
            .map(|list| list.iter().filter(|v| v.is_open()).cloned().collect())
            .unwrap_or_default())
    }

    async fn violations_for_session(&self, session_id: &SessionId) -> DbResult<Vec<ZoneViolation>> {
        let mut list = self
            .violations
            .get(session_id)
            .map(|l| l.clone())
            .unwrap_or_default();
        list.sort_by_key(|v| v.entered_at);
        Ok(list)
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> DbResult<()> {
        self.risk_events
            .entry(event.session_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn risk_events(&self, session_id: &SessionId) -> DbResult<Vec<RiskEvent>> {
        let mut events = self
            .risk_events
            .get(session_id)
            .map(|e| e.clone())
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }

    async fn health_check(&self) -> DbResult<bool> {
        Ok(true)
    }
}
