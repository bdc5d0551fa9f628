//! ScyllaDB-backed [`FlightStore`]
//!
//! Timestamps are stored as epoch milliseconds (`bigint`). Uniqueness of
//! session keys and open violations is enforced with lightweight
//! transactions on dedicated lookup tables.

use crate::{migrations, DbConfig, DbError, DbResult, FlightStore, RetryPolicy, StatusTransition};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flight_core::{
    Coordinate, DangerZone, DroneId, FlightSession, FlightStats, OperatorId, Polygon, RiskEvent,
    SessionId, SessionStatus, TelemetryPoint, ZoneId, ZoneScope, ZoneViolation,
};
use scylla::batch::{Batch, BatchType};
use scylla::deserialize::DeserializeRow;
use scylla::serialize::row::SerializeRow;
use scylla::transport::errors::QueryError;
use scylla::{QueryResult, Session, SessionBuilder};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Rows per unlogged batch when writing telemetry
const POINT_BATCH_SIZE: usize = 100;

const SESSION_COLUMNS: &str = "session_id, drone_id, operator_id, session_key, started_at, \
     ended_at, status, stats, health_score, created_at, updated_at";

type SessionRow = (
    Uuid,
    String,
    String,
    String,
    i64,
    Option<i64>,
    String,
    Option<String>,
    Option<f64>,
    i64,
    i64,
);

const POINT_COLUMNS: &str = "session_id, timestamp, point_id, drone_id, latitude, longitude, \
     altitude, speed, heading, battery, flight_mode, armed, raw";

type PointRow = (
    Uuid,
    i64,
    Uuid,
    String,
    f64,
    f64,
    f64,
    f64,
    Option<f64>,
    f64,
    Option<String>,
    bool,
    Option<String>,
);

const ZONE_COLUMNS: &str = "zone_id, owner_id, name, description, zone_type, polygon, \
     altitude_limit, visibility, active, created_at, updated_at";

type ZoneRow = (
    Uuid,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    Option<f64>,
    String,
    bool,
    i64,
    i64,
);

const VIOLATION_COLUMNS: &str = "session_id, violation_id, zone_id, entered_at, exited_at, \
     duration_seconds, max_altitude, severity";

type ViolationRow = (Uuid, Uuid, Uuid, i64, Option<i64>, Option<i64>, f64, String);

type RiskEventRow = (Uuid, i64, Uuid, String, String, String);

/// Main ScyllaDB store
pub struct ScyllaStore {
    session: Arc<Session>,
    config: DbConfig,
    retry: RetryPolicy,
}

impl ScyllaStore {
    /// Connect, create the keyspace if needed and run migrations
    pub async fn connect(config: DbConfig) -> DbResult<Self> {
        info!("Connecting to ScyllaDB cluster: {:?}", config.hosts);

        if config.hosts.is_empty() {
            return Err(DbError::Configuration("no ScyllaDB hosts configured".into()));
        }

        let session = SessionBuilder::new()
            .known_nodes(&config.hosts)
            .connection_timeout(config.connection_timeout)
            .build()
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        migrations::ensure_keyspace(&session, &config.keyspace, config.replication_factor).await?;
        session
            .use_keyspace(&config.keyspace, false)
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;
        migrations::run_all(&session).await?;

        info!("Connected to ScyllaDB keyspace {}", config.keyspace);

        Ok(Self {
            session: Arc::new(session),
            retry: config.retry_policy(),
            config,
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    /// Run one statement under the retry policy
    async fn execute<V>(&self, operation: &str, cql: &str, values: V) -> DbResult<QueryResult>
    where
        V: SerializeRow + Clone + Send + Sync,
    {
        let session = &self.session;
        self.retry
            .run(operation, || {
                let values = values.clone();
                async move { session.query_unpaged(cql, values).await.map_err(classify) }
            })
            .await
    }

    async fn fetch_session(&self, id: Uuid) -> DbResult<Option<FlightSession>> {
        let cql = format!("SELECT {SESSION_COLUMNS} FROM flight_sessions WHERE session_id = ?");
        let result = self.execute("get_session", &cql, (id,)).await?;
        rows::<SessionRow>(result)?
            .into_iter()
            .next()
            .map(session_from_row)
            .transpose()
    }
}

/// Map driver errors onto the storage taxonomy so retries only cover
/// connection-level failures
fn classify(err: QueryError) -> DbError {
    match err {
        QueryError::TimeoutError | QueryError::RequestTimeout(_) => DbError::Timeout(err.to_string()),
        QueryError::BrokenConnection(_) | QueryError::ConnectionPoolError(_) => {
            DbError::Connection(err.to_string())
        }
        other => DbError::Query(other.to_string()),
    }
}

fn rows<R>(result: QueryResult) -> DbResult<Vec<R>>
where
    R: for<'frame, 'metadata> DeserializeRow<'frame, 'metadata>,
{
    let rows_result = result.into_rows_result().map_err(DbError::serialization)?;
    rows_result
        .rows::<R>()
        .map_err(DbError::serialization)?
        .map(|row| row.map_err(DbError::serialization))
        .collect()
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> DbResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DbError::Serialization(format!("timestamp out of range: {ms}")))
}

fn session_from_row(row: SessionRow) -> DbResult<FlightSession> {
    let (id, drone_id, operator_id, session_key, started_at, ended_at, status, stats, health, created, updated) =
        row;

    let stats = match stats {
        Some(json) => serde_json::from_str(&json).map_err(DbError::serialization)?,
        None => FlightStats::default(),
    };

    Ok(FlightSession {
        id: SessionId(id),
        drone_id: DroneId(drone_id),
        operator_id: OperatorId(operator_id),
        session_key,
        started_at: from_millis(started_at)?,
        ended_at: ended_at.map(from_millis).transpose()?,
        status: status.parse().map_err(DbError::serialization)?,
        stats,
        health_score: health,
        created_at: from_millis(created)?,
        updated_at: from_millis(updated)?,
    })
}

fn point_from_row(row: PointRow) -> DbResult<TelemetryPoint> {
    let (session_id, ts, point_id, drone_id, lat, lng, alt, speed, heading, battery, mode, armed, raw) =
        row;

    let raw = match raw {
        Some(json) => serde_json::from_str(&json).map_err(DbError::serialization)?,
        None => serde_json::Value::Null,
    };

    Ok(TelemetryPoint {
        id: point_id,
        session_id: SessionId(session_id),
        drone_id: DroneId(drone_id),
        timestamp: from_millis(ts)?,
        latitude: lat,
        longitude: lng,
        altitude_meters: alt,
        speed_mps: speed,
        heading_degrees: heading,
        battery_percent: battery,
        flight_mode: mode,
        armed,
        raw,
    })
}

fn zone_from_row(row: ZoneRow) -> DbResult<DangerZone> {
    let (id, owner, name, description, zone_type, polygon, limit, visibility, active, created, updated) =
        row;

    let ring: Vec<Coordinate> = serde_json::from_str(&polygon).map_err(DbError::serialization)?;

    Ok(DangerZone {
        id: ZoneId(id),
        owner_id: owner.map(OperatorId),
        name,
        description,
        zone_type: zone_type.parse().map_err(DbError::serialization)?,
        polygon: Polygon::new(ring).map_err(DbError::serialization)?,
        altitude_limit_meters: limit,
        visibility: visibility.parse().map_err(DbError::serialization)?,
        active,
        created_at: from_millis(created)?,
        updated_at: from_millis(updated)?,
    })
}

fn violation_from_row(row: ViolationRow) -> DbResult<ZoneViolation> {
    let (session_id, id, zone_id, entered, exited, duration, max_alt, severity) = row;

    Ok(ZoneViolation {
        id,
        session_id: SessionId(session_id),
        zone_id: ZoneId(zone_id),
        entered_at: from_millis(entered)?,
        exited_at: exited.map(from_millis).transpose()?,
        duration_seconds: duration,
        max_altitude_meters: max_alt,
        severity: severity.parse().map_err(DbError::serialization)?,
    })
}

fn risk_event_from_row(row: RiskEventRow) -> DbResult<RiskEvent> {
    let (session_id, ts, id, kind, severity, message) = row;

    Ok(RiskEvent {
        id,
        session_id: SessionId(session_id),
        kind: kind.parse().map_err(DbError::serialization)?,
        severity: severity.parse().map_err(DbError::serialization)?,
        message,
        timestamp: from_millis(ts)?,
    })
}

#[async_trait]
impl FlightStore for ScyllaStore {
    async fn insert_session(&self, session: &FlightSession) -> DbResult<()> {
        let stats = serde_json::to_string(&session.stats).map_err(DbError::serialization)?;

        // Session row first so the key row never points at a missing session
        let cql = format!(
            "INSERT INTO flight_sessions ({SESSION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        self.execute(
            "insert_session",
            &cql,
            (
                session.id.0,
                session.drone_id.as_str(),
                session.operator_id.as_str(),
                session.session_key.as_str(),
                millis(session.started_at),
                session.ended_at.map(millis),
                session.status.as_str(),
                stats.as_str(),
                session.health_score,
                millis(session.created_at),
                millis(session.updated_at),
            ),
        )
        .await?;

        self.execute(
            "claim_session_key",
            "INSERT INTO flight_sessions_by_key (operator_id, session_key, session_id) \
             VALUES (?, ?, ?) IF NOT EXISTS",
            (
                session.operator_id.as_str(),
                session.session_key.as_str(),
                session.id.0,
            ),
        )
        .await?;

        let owner = self
            .execute(
                "read_session_key",
                "SELECT session_id FROM flight_sessions_by_key WHERE operator_id = ? AND session_key = ?",
                (session.operator_id.as_str(), session.session_key.as_str()),
            )
            .await?;
        let winner = rows::<(Uuid,)>(owner)?.into_iter().next().map(|(id,)| id);

        if winner != Some(session.id.0) {
            self.execute(
                "discard_session",
                "DELETE FROM flight_sessions WHERE session_id = ?",
                (session.id.0,),
            )
            .await?;
            return Err(DbError::duplicate(format!(
                "session key {} for operator {}",
                session.session_key, session.operator_id
            )));
        }

        Ok(())
    }

    async fn get_session(&self, id: &SessionId) -> DbResult<Option<FlightSession>> {
        self.fetch_session(id.0).await
    }

    async fn find_session_by_key(
        &self,
        operator_id: &OperatorId,
        session_key: &str,
    ) -> DbResult<Option<FlightSession>> {
        let result = self
            .execute(
                "find_session_by_key",
                "SELECT session_id FROM flight_sessions_by_key WHERE operator_id = ? AND session_key = ?",
                (operator_id.as_str(), session_key),
            )
            .await?;

        match rows::<(Uuid,)>(result)?.into_iter().next() {
            Some((id,)) => self.fetch_session(id).await,
            None => Ok(None),
        }
    }

    async fn transition_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
        final_stats: Option<FlightStats>,
    ) -> DbResult<StatusTransition> {
        let ended_ms = millis(ended_at);
        match final_stats {
            Some(stats) => {
                let json = serde_json::to_string(&stats).map_err(DbError::serialization)?;
                self.execute(
                    "transition_status",
                    "UPDATE flight_sessions SET status = ?, ended_at = ?, stats = ?, updated_at = ? \
                     WHERE session_id = ? IF status = 'active'",
                    (status.as_str(), ended_ms, json.as_str(), millis(Utc::now()), id.0),
                )
                .await?;
            }
            None => {
                self.execute(
                    "transition_status",
                    "UPDATE flight_sessions SET status = ?, ended_at = ?, updated_at = ? \
                     WHERE session_id = ? IF status = 'active'",
                    (status.as_str(), ended_ms, millis(Utc::now()), id.0),
                )
                .await?;
            }
        }

        // Conditional updates only report [applied]; re-read to see who won
        let session = self
            .fetch_session(id.0)
            .await?
            .ok_or_else(|| DbError::not_found(format!("flight session {id}")))?;

        let applied = session.status == status
            && session.ended_at.map(millis) == Some(ended_ms);
        if applied {
            Ok(StatusTransition::Applied(session))
        } else {
            Ok(StatusTransition::Rejected(session.status))
        }
    }

    async fn update_stats(&self, id: &SessionId, stats: &FlightStats) -> DbResult<bool> {
        let json = serde_json::to_string(stats).map_err(DbError::serialization)?;
        self.execute(
            "update_stats",
            "UPDATE flight_sessions SET stats = ?, updated_at = ? \
             WHERE session_id = ? IF status = 'active'",
            (json.as_str(), millis(Utc::now()), id.0),
        )
        .await?;

        let session = self
            .fetch_session(id.0)
            .await?
            .ok_or_else(|| DbError::not_found(format!("flight session {id}")))?;
        Ok(session.is_active())
    }

    async fn active_sessions(&self) -> DbResult<Vec<FlightSession>> {
        let cql = format!("SELECT {SESSION_COLUMNS} FROM flight_sessions WHERE status = 'active'");
        let result = self.execute("active_sessions", &cql, ()).await?;
        rows::<SessionRow>(result)?
            .into_iter()
            .map(session_from_row)
            .collect()
    }

    async fn insert_points(&self, points: &[TelemetryPoint]) -> DbResult<()> {
        let cql = format!(
            "INSERT INTO telemetry_points ({POINT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );

        for chunk in points.chunks(POINT_BATCH_SIZE) {
            let mut batch = Batch::new(BatchType::Unlogged);
            let mut values = Vec::with_capacity(chunk.len());
            for point in chunk {
                let raw = if point.raw.is_null() {
                    None
                } else {
                    Some(serde_json::to_string(&point.raw).map_err(DbError::serialization)?)
                };
                batch.append_statement(cql.as_str());
                values.push((
                    point.session_id.0,
                    millis(point.timestamp),
                    point.id,
                    point.drone_id.0.clone(),
                    point.latitude,
                    point.longitude,
                    point.altitude_meters,
                    point.speed_mps,
                    point.heading_degrees,
                    point.battery_percent,
                    point.flight_mode.clone(),
                    point.armed,
                    raw,
                ));
            }

            let session = &self.session;
            let batch = &batch;
            self.retry
                .run("insert_points", || {
                    let values = values.clone();
                    async move { session.batch(batch, values).await.map_err(classify) }
                })
                .await?;
        }

        Ok(())
    }

    async fn points_for_session(&self, id: &SessionId) -> DbResult<Vec<TelemetryPoint>> {
        let cql = format!(
            "SELECT {POINT_COLUMNS} FROM telemetry_points WHERE session_id = ? ORDER BY timestamp ASC"
        );
        let result = self.execute("points_for_session", &cql, (id.0,)).await?;
        rows::<PointRow>(result)?
            .into_iter()
            .map(point_from_row)
            .collect()
    }

    async fn last_point_at(&self, id: &SessionId) -> DbResult<Option<DateTime<Utc>>> {
        let result = self
            .execute(
                "last_point_at",
                "SELECT timestamp FROM telemetry_points WHERE session_id = ? \
                 ORDER BY timestamp DESC LIMIT 1",
                (id.0,),
            )
            .await?;

        rows::<(i64,)>(result)?
            .into_iter()
            .next()
            .map(|(ts,)| from_millis(ts))
            .transpose()
    }

    async fn insert_zone(&self, zone: &DangerZone) -> DbResult<()> {
        self.write_zone("insert_zone", zone).await
    }

    async fn update_zone(&self, zone: &DangerZone) -> DbResult<()> {
        if self.get_zone(&zone.id).await?.is_none() {
            return Err(DbError::not_found(format!("danger zone {}", zone.id)));
        }
        self.write_zone("update_zone", zone).await
    }

    async fn delete_zone(&self, id: &ZoneId) -> DbResult<bool> {
        let existed = self.get_zone(id).await?.is_some();
        if existed {
            self.execute(
                "delete_zone",
                "DELETE FROM danger_zones WHERE zone_id = ?",
                (id.0,),
            )
            .await?;
        }
        Ok(existed)
    }

    async fn get_zone(&self, id: &ZoneId) -> DbResult<Option<DangerZone>> {
        let cql = format!("SELECT {ZONE_COLUMNS} FROM danger_zones WHERE zone_id = ?");
        let result = self.execute("get_zone", &cql, (id.0,)).await?;
        rows::<ZoneRow>(result)?
            .into_iter()
            .next()
            .map(zone_from_row)
            .transpose()
    }

    async fn active_zones(&self, scope: &ZoneScope) -> DbResult<Vec<DangerZone>> {
        // Zone counts are small and cached upstream; filter in process
        let cql = format!("SELECT {ZONE_COLUMNS} FROM danger_zones");
        let result = self.execute("active_zones", &cql, ()).await?;

        let mut zones = Vec::new();
        for row in rows::<ZoneRow>(result)? {
            match zone_from_row(row) {
                Ok(zone) if zone.active && scope.includes(&zone) => zones.push(zone),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable danger zone row"),
            }
        }
        Ok(zones)
    }

    async fn insert_violation(&self, violation: &ZoneViolation) -> DbResult<()> {
        self.execute(
            "claim_open_violation",
            "INSERT INTO open_zone_violations (session_id, zone_id, violation_id) \
             VALUES (?, ?, ?) IF NOT EXISTS",
            (violation.session_id.0, violation.zone_id.0, violation.id),
        )
        .await?;

        let owner = self
            .execute(
                "read_open_violation",
                "SELECT violation_id FROM open_zone_violations WHERE session_id = ? AND zone_id = ?",
                (violation.session_id.0, violation.zone_id.0),
            )
            .await?;
        let winner = rows::<(Uuid,)>(owner)?.into_iter().next().map(|(id,)| id);
        if winner != Some(violation.id) {
            return Err(DbError::duplicate(format!(
                "open violation for session {} zone {}",
                violation.session_id, violation.zone_id
            )));
        }

        self.write_violation("insert_violation", violation).await
    }

    async fn update_violation(&self, violation: &ZoneViolation) -> DbResult<()> {
        self.write_violation("update_violation", violation).await?;

        if !violation.is_open() {
            self.execute(
                "release_open_violation",
                "DELETE FROM open_zone_violations WHERE session_id = ? AND zone_id = ? \
                 IF violation_id = ?",
                (violation.session_id.0, violation.zone_id.0, violation.id),
            )
            .await?;
        }
        Ok(())
    }

    async fn open_violations(&self, session_id: &SessionId) -> DbResult<Vec<ZoneViolation>> {
        Ok(self
            .violations_for_session(session_id)
            .await?
            .into_iter()
            .filter(ZoneViolation::is_open)
            .collect())
    }

    async fn violations_for_session(&self, session_id: &SessionId) -> DbResult<Vec<ZoneViolation>> {
        let cql = format!("SELECT {VIOLATION_COLUMNS} FROM zone_violations WHERE session_id = ?");
        let result = self.execute("violations_for_session", &cql, (session_id.0,)).await?;
        let mut violations = rows::<ViolationRow>(result)?
            .into_iter()
            .map(violation_from_row)
            .collect::<DbResult<Vec<_>>>()?;
        violations.sort_by_key(|v| v.entered_at);
        Ok(violations)
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> DbResult<()> {
        self.execute(
            "append_risk_event",
            "INSERT INTO risk_events (session_id, timestamp, event_id, event_type, severity, message) \
             VALUES (?, ?, ?, ?, ?, ?)",
            (
                event.session_id.0,
                millis(event.timestamp),
                event.id,
                event.kind.as_str(),
                event.severity.as_str(),
                event.message.as_str(),
            ),
        )
        .await?;
        Ok(())
    }

    async fn risk_events(&self, session_id: &SessionId) -> DbResult<Vec<RiskEvent>> {
        let result = self
            .execute(
                "risk_events",
                "SELECT session_id, timestamp, event_id, event_type, severity, message \
                 FROM risk_events WHERE session_id = ?",
                (session_id.0,),
            )
            .await?;
        rows::<RiskEventRow>(result)?
            .into_iter()
            .map(risk_event_from_row)
            .collect()
    }

    async fn health_check(&self) -> DbResult<bool> {
        match self
            .session
            .query_unpaged("SELECT now() FROM system.local", &[])
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Database health check failed: {}", e);
                Ok(false)
            }
        }
    }
}

impl ScyllaStore {
    async fn write_zone(&self, operation: &str, zone: &DangerZone) -> DbResult<()> {
        let ring: Vec<Coordinate> = zone.polygon.clone().into();
        let polygon = serde_json::to_string(&ring).map_err(DbError::serialization)?;
        let cql = format!(
            "INSERT INTO danger_zones ({ZONE_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );

        self.execute(
            operation,
            &cql,
            (
                zone.id.0,
                zone.owner_id.as_ref().map(|o| o.as_str()),
                zone.name.as_str(),
                zone.description.as_deref(),
                zone.zone_type.as_str(),
                polygon.as_str(),
                zone.altitude_limit_meters,
                zone.visibility.as_str(),
                zone.active,
                millis(zone.created_at),
                millis(zone.updated_at),
            ),
        )
        .await?;
        Ok(())
    }

    async fn write_violation(&self, operation: &str, violation: &ZoneViolation) -> DbResult<()> {
        let cql = format!(
            "INSERT INTO zone_violations ({VIOLATION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        );

        self.execute(
            operation,
            &cql,
            (
                violation.session_id.0,
                violation.id,
                violation.zone_id.0,
                millis(violation.entered_at),
                violation.exited_at.map(millis),
                violation.duration_seconds,
                violation.max_altitude_meters,
                violation.severity.as_str(),
            ),
        )
        .await?;
        Ok(())
    }
}
