//! Error types for the flight tracking engine

use thiserror::Error;

/// Core error type for the flight tracking engine
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Flight session not found: {0}")]
    SessionNotFound(String),

    #[error("Danger zone not found: {0}")]
    ZoneNotFound(String),

    #[error("Invalid position: latitude={lat}, longitude={lng}")]
    InvalidPosition { lat: f64, lng: f64 },

    #[error("Invalid telemetry data: {0}")]
    InvalidTelemetry(String),

    #[error("Invalid danger zone: {0}")]
    InvalidZone(String),

    #[error("Flight session {id} is already {status}")]
    AlreadyTerminal { id: String, status: String },

    #[error("Flight session {0} has no recorded home position")]
    NoHomePosition(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn session_not_found(id: impl ToString) -> Self {
        Self::SessionNotFound(id.to_string())
    }

    pub fn zone_not_found(id: impl ToString) -> Self {
        Self::ZoneNotFound(id.to_string())
    }

    pub fn invalid_position(lat: f64, lng: f64) -> Self {
        Self::InvalidPosition { lat, lng }
    }

    pub fn invalid_telemetry(msg: impl Into<String>) -> Self {
        Self::InvalidTelemetry(msg.into())
    }

    pub fn invalid_zone(msg: impl Into<String>) -> Self {
        Self::InvalidZone(msg.into())
    }

    pub fn already_terminal(id: impl ToString, status: impl ToString) -> Self {
        Self::AlreadyTerminal {
            id: id.to_string(),
            status: status.to_string(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the error was caused by caller input rather than system state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidPosition { .. } | Self::InvalidTelemetry(_) | Self::InvalidZone(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
