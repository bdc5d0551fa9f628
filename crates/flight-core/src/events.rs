//! Observer wire protocol and the broadcast seam
//!
//! Messages are JSON objects discriminated by a snake_case `type` field.
//! The tracking engine publishes through [`Broadcaster`]; the WebSocket hub
//! implements it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    DangerZone, FlightStats, GeoPosition, OperatorId, SessionId, SessionStatus, Severity,
    TelemetryPoint, ZoneId, ZoneType,
};

/// Live telemetry frame pushed to subscribers of a flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub speed: f64,
    pub heading: Option<f64>,
    pub battery: f64,
    pub flight_mode: Option<String>,
    pub armed: bool,
}

impl From<&TelemetryPoint> for TelemetryFrame {
    fn from(point: &TelemetryPoint) -> Self {
        Self {
            id: point.id,
            timestamp: point.timestamp,
            latitude: point.latitude,
            longitude: point.longitude,
            altitude: point.altitude_meters,
            speed: point.speed_mps,
            heading: point.heading_degrees,
            battery: point.battery_percent,
            flight_mode: point.flight_mode.clone(),
            armed: point.armed,
        }
    }
}

/// Status change pushed to subscribers of a flight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightUpdate {
    pub status: SessionStatus,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FlightStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Kind of operator-wide warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    ZoneViolation,
}

/// Operator-wide warning, delivered regardless of subscriptions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Warning {
    #[serde(rename = "type")]
    pub kind: WarningKind,
    pub severity: Severity,
    pub message: String,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub zone_type: ZoneType,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    pub flight_id: SessionId,
}

impl Warning {
    pub fn zone_entered(flight_id: SessionId, zone: &DangerZone, position: GeoPosition) -> Self {
        Self {
            kind: WarningKind::ZoneViolation,
            severity: zone.zone_type.violation_severity(),
            message: format!("Entered danger zone: {}", zone.name),
            zone_id: zone.id,
            zone_name: zone.name.clone(),
            zone_type: zone.zone_type,
            latitude: position.latitude,
            longitude: position.longitude,
            altitude: position.altitude,
            flight_id,
        }
    }
}

/// Return-to-home instruction pushed to a flight's observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RthCommand {
    pub flight_id: SessionId,
    pub command: String,
    pub target_latitude: f64,
    pub target_longitude: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl RthCommand {
    pub fn new(flight_id: SessionId, home: GeoPosition, reason: impl Into<String>) -> Self {
        Self {
            flight_id,
            command: "RTH".into(),
            target_latitude: home.latitude,
            target_longitude: home.longitude,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Message sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected { message: String },
    Subscribed { flight_id: SessionId },
    Unsubscribed { flight_id: SessionId },
    Telemetry { flight_id: SessionId, data: TelemetryFrame },
    FlightUpdate { flight_id: SessionId, data: FlightUpdate },
    Warning { data: Warning },
    RthCommand(RthCommand),
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Message sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(alias = "flightId")]
        flight_id: SessionId,
    },
    Unsubscribe {
        #[serde(alias = "flightId")]
        flight_id: SessionId,
    },
    Ping,
}

/// Fan-out seam between the tracking engine and connected observers.
///
/// Delivery is best-effort; implementations must never block the caller.
/// Every method returns the number of connections the message was queued for.
pub trait Broadcaster: Send + Sync {
    /// Deliver to connections subscribed to `flight_id`
    fn send_to_flight(&self, flight_id: &SessionId, message: ServerMessage) -> usize;

    /// Deliver to every connection authenticated as `operator_id`
    fn send_to_operator(&self, operator_id: &OperatorId, message: ServerMessage) -> usize;

    fn publish_telemetry(&self, flight_id: &SessionId, point: &TelemetryPoint) -> usize {
        self.send_to_flight(
            flight_id,
            ServerMessage::Telemetry {
                flight_id: *flight_id,
                data: TelemetryFrame::from(point),
            },
        )
    }

    fn publish_status(&self, flight_id: &SessionId, update: FlightUpdate) -> usize {
        self.send_to_flight(
            flight_id,
            ServerMessage::FlightUpdate {
                flight_id: *flight_id,
                data: update,
            },
        )
    }

    fn publish_warning(&self, operator_id: &OperatorId, warning: Warning) -> usize {
        self.send_to_operator(operator_id, ServerMessage::Warning { data: warning })
    }

    fn publish_rth_command(&self, command: RthCommand) -> usize {
        let flight_id = command.flight_id;
        self.send_to_flight(&flight_id, ServerMessage::RthCommand(command))
    }
}

// ============================================================================
// TESTS
// ============================================================================
