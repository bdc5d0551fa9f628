//! # Flight Core
//!
//! Core domain models and types for the real-time flight tracking engine.
//! This crate provides the types shared by storage, tracking, broadcast and
//! the HTTP API: flight sessions, telemetry points, danger zones, violations,
//! risk events, geometry and the observer wire protocol.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod error;
pub mod events;
pub mod geo;
pub mod zone;

pub use error::{CoreError, CoreResult};
pub use events::*;
pub use geo::*;
pub use zone::*;

// ============================================================================
// IDENTIFIERS
// ============================================================================

/// Unique identifier for a flight session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Unique identifier for a drone
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DroneId(pub String);

impl DroneId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DroneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for DroneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the operator (user account) that owns drones, flights and zones
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperatorId(pub String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// FLIGHT SESSION MODELS
// ============================================================================

/// Lifecycle state of a flight session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    /// Completed and cancelled sessions accept no further state changes
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Active)
    }
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(CoreError::Internal(format!("unknown session status: {other}"))),
        }
    }
}

/// Derived statistics for a flight, rewritten by every recompute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlightStats {
    pub duration_seconds: Option<i64>,
    pub total_distance_meters: f64,
    pub max_altitude_meters: Option<f64>,
    pub max_speed_mps: Option<f64>,
    pub min_battery_percent: Option<f64>,
    pub start_position: Option<GeoPosition>,
    pub end_position: Option<GeoPosition>,
}

/// One continuous tracked flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightSession {
    pub id: SessionId,
    pub drone_id: DroneId,
    pub operator_id: OperatorId,
    /// Client-supplied key correlating telemetry bursts into this session
    pub session_key: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub stats: FlightStats,
    pub health_score: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlightSession {
    pub fn new(
        drone_id: DroneId,
        operator_id: OperatorId,
        session_key: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            drone_id,
            operator_id,
            session_key: session_key.into(),
            started_at,
            ended_at: None,
            status: SessionStatus::Active,
            stats: FlightStats::default(),
            health_score: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    pub fn is_owned_by(&self, operator_id: &OperatorId) -> bool {
        &self.operator_id == operator_id
    }

    /// Launch point used as the return-to-home target
    pub fn home(&self) -> Option<GeoPosition> {
        self.stats.start_position
    }

    /// End time used when a session is closed without an explicit one:
    /// the last telemetry timestamp, or one minute after start if none.
    pub fn fallback_end(&self, last_point_at: Option<DateTime<Utc>>) -> DateTime<Utc> {
        last_point_at.unwrap_or_else(|| self.started_at + Duration::minutes(1))
    }
}

/// Default session key for single points that carry none
pub fn default_session_key(drone_id: &DroneId, at: DateTime<Utc>) -> String {
    format!("session_{}_{}", drone_id, at.timestamp_millis())
}

// ============================================================================
// TELEMETRY MODELS
// ============================================================================

/// One stored telemetry sample. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryPoint {
    pub id: Uuid,
    pub session_id: SessionId,
    pub drone_id: DroneId,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: f64,
    pub speed_mps: f64,
    pub heading_degrees: Option<f64>,
    pub battery_percent: f64,
    pub flight_mode: Option<String>,
    pub armed: bool,
    /// Opaque device payload kept for audit
    pub raw: serde_json::Value,
}

impl TelemetryPoint {
    pub fn position(&self) -> GeoPosition {
        GeoPosition::new(self.latitude, self.longitude, self.altitude_meters)
    }
}

/// Telemetry sample as submitted by a device
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryInput {
    /// Session key; live devices may omit it
    #[serde(default, alias = "sessionKey", alias = "session_key")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub heading: Option<f64>,
    pub battery: f64,
    #[serde(default, alias = "flightMode")]
    pub flight_mode: Option<String>,
    #[serde(default)]
    pub armed: Option<bool>,
    #[serde(default)]
    pub raw_data: Option<serde_json::Value>,
}

impl TelemetryInput {
    /// Range-check every field. Nothing invalid is ever ingested.
    pub fn validate(&self) -> CoreResult<()> {
        if !is_valid_coordinate(self.latitude, self.longitude) {
            return Err(CoreError::invalid_position(self.latitude, self.longitude));
        }
        check_range("altitude", self.altitude, -1000.0, 50_000.0)?;
        check_range("battery", self.battery, 0.0, 100.0)?;
        if let Some(speed) = self.speed {
            check_range("speed", speed, 0.0, 500.0)?;
        }
        if let Some(heading) = self.heading {
            check_range("heading", heading, 0.0, 360.0)?;
        }
        Ok(())
    }

    /// Observation time, defaulting to when the server received the sample
    pub fn observed_at(&self, received_at: DateTime<Utc>) -> DateTime<Utc> {
        self.timestamp.unwrap_or(received_at)
    }

    /// Convert to a stored point for `session_id`
    pub fn into_point(
        self,
        session_id: SessionId,
        drone_id: DroneId,
        received_at: DateTime<Utc>,
    ) -> TelemetryPoint {
        let timestamp = self.observed_at(received_at);
        TelemetryPoint {
            id: Uuid::new_v4(),
            session_id,
            drone_id,
            timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude_meters: self.altitude,
            speed_mps: self.speed.unwrap_or(0.0),
            heading_degrees: self.heading,
            battery_percent: self.battery,
            flight_mode: self.flight_mode,
            armed: self.armed.unwrap_or(false),
            raw: self.raw_data.unwrap_or(serde_json::Value::Null),
        }
    }
}

fn check_range(field: &str, value: f64, min: f64, max: f64) -> CoreResult<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(CoreError::invalid_telemetry(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

// ============================================================================
// RISK EVENT MODELS
// ============================================================================

/// Severity shared by violations, warnings and risk events
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(CoreError::Internal(format!("unknown severity: {other}"))),
        }
    }
}

/// Kind of risk event recorded against a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskEventKind {
    RthTriggered,
}

impl RiskEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskEventKind::RthTriggered => "rth_triggered",
        }
    }
}

impl FromStr for RiskEventKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rth_triggered" => Ok(RiskEventKind::RthTriggered),
            other => Err(CoreError::Internal(format!("unknown risk event: {other}"))),
        }
    }
}

/// Append-only record attached to a flight session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskEvent {
    pub id: Uuid,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub kind: RiskEventKind,
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RiskEvent {
    pub fn rth_triggered(session_id: SessionId, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            kind: RiskEventKind::RthTriggered,
            severity: Severity::Warning,
            message: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> TelemetryInput {
        TelemetryInput {
            latitude: 47.6,
            longitude: -122.3,
            altitude: 120.0,
            battery: 80.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_session_creation() {
        let started = Utc::now();
        let session = FlightSession::new(
            DroneId::new("drone-1"),
            OperatorId::new("op-1"),
            "key-1",
            started,
        );

        assert!(session.is_active());
        assert!(session.ended_at.is_none());
        assert!(session.home().is_none());
        assert!(session.is_owned_by(&OperatorId::new("op-1")));
        assert!(!session.is_owned_by(&OperatorId::new("op-2")));
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
        assert_eq!("cancelled".parse::<SessionStatus>().unwrap(), SessionStatus::Cancelled);
        assert!("paused".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_fallback_end() {
        let started = Utc::now();
        let session = FlightSession::new(DroneId::new("d"), OperatorId::new("o"), "k", started);

        assert_eq!(session.fallback_end(None), started + Duration::minutes(1));

        let last = started + Duration::seconds(42);
        assert_eq!(session.fallback_end(Some(last)), last);
    }

    #[test]
    fn test_telemetry_validation() {
        assert!(input().validate().is_ok());

        let bad_lat = TelemetryInput { latitude: 91.0, ..input() };
        assert!(matches!(bad_lat.validate(), Err(CoreError::InvalidPosition { .. })));

        let bad_lng = TelemetryInput { longitude: -181.0, ..input() };
        assert!(bad_lng.validate().is_err());

        let bad_battery = TelemetryInput { battery: 101.0, ..input() };
        assert!(matches!(bad_battery.validate(), Err(CoreError::InvalidTelemetry(_))));

        let bad_speed = TelemetryInput { speed: Some(-1.0), ..input() };
        assert!(bad_speed.validate().is_err());

        let bad_heading = TelemetryInput { heading: Some(361.0), ..input() };
        assert!(bad_heading.validate().is_err());

        let nan_alt = TelemetryInput { altitude: f64::NAN, ..input() };
        assert!(nan_alt.validate().is_err());
    }

    #[test]
    fn test_telemetry_input_wire_format() {
        let json = r#"{
            "latitude": 1.5, "longitude": 2.5, "altitude": 30,
            "battery": 55, "flightMode": "GPS", "sessionKey": "abc"
        }"#;
        let parsed: TelemetryInput = serde_json::from_str(json).unwrap();

        assert_eq!(parsed.flight_mode.as_deref(), Some("GPS"));
        assert_eq!(parsed.session_id.as_deref(), Some("abc"));
        assert!(parsed.timestamp.is_none());
    }

    #[test]
    fn test_into_point_defaults() {
        let received = Utc::now();
        let session_id = SessionId::new();
        let point = input().into_point(session_id, DroneId::new("d"), received);

        assert_eq!(point.timestamp, received);
        assert_eq!(point.speed_mps, 0.0);
        assert!(!point.armed);
        assert_eq!(point.session_id, session_id);
        assert_eq!(point.raw, serde_json::Value::Null);
    }

    #[test]
    fn test_default_session_key() {
        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(
            default_session_key(&DroneId::new("d7"), at),
            "session_d7_1700000000123"
        );
    }

    #[test]
    fn test_risk_event_serialization() {
        let event = RiskEvent::rth_triggered(SessionId::new(), "low battery");
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "rth_triggered");
        assert_eq!(json["severity"], "warning");
        assert_eq!(json["message"], "low battery");
    }
}
