//! Tracker error types

use flight_core::CoreError;
use flight_db::DbError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Weather provider error: {0}")]
    Weather(String),

    /// The caller does not own the flight or zone
    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Geofence evaluation failed for {failed} of {total} points")]
    GeofenceIncomplete { failed: usize, total: usize },
}

impl TrackerError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TrackerError::Core(CoreError::SessionNotFound(_) | CoreError::ZoneNotFound(_))
                | TrackerError::Db(DbError::NotFound(_))
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TrackerError::Db(e) if e.is_transient())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
