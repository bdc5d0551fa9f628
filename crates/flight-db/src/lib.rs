//! # Flight DB - Storage Layer
//!
//! Persistence for flight sessions, telemetry points, danger zones,
//! zone violations and risk events. The tracking engine only talks to the
//! [`FlightStore`] trait; two implementations are provided:
//!
//! - [`ScyllaStore`]: ScyllaDB, with lightweight transactions backing the
//!   uniqueness rules
//! - [`MemoryStore`]: in-process, used for tests and degraded mode

pub mod error;
pub mod memory;
pub mod migrations;
pub mod retry;
pub mod scylla_store;

pub use error::{DbError, DbResult};
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use scylla_store::ScyllaStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flight_core::{
    DangerZone, FlightSession, FlightStats, OperatorId, RiskEvent, SessionId, SessionStatus,
    TelemetryPoint, ZoneId, ZoneScope, ZoneViolation,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    pub hosts: Vec<String>,
    pub keyspace: String,
    #[serde(skip, default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    #[serde(skip, default = "default_query_timeout")]
    pub query_timeout: Duration,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(skip, default = "default_retry_base")]
    pub retry_base: Duration,
    #[serde(skip, default = "default_retry_max")]
    pub retry_max: Duration,
    /// Replication factor used when the keyspace is created
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_query_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base() -> Duration {
    Duration::from_millis(100)
}

fn default_retry_max() -> Duration {
    Duration::from_secs(2)
}

fn default_replication_factor() -> u32 {
    1
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:9042".to_string()],
            keyspace: "flight_tracker".to_string(),
            connection_timeout: default_connection_timeout(),
            query_timeout: default_query_timeout(),
            retry_attempts: default_retry_attempts(),
            retry_base: default_retry_base(),
            retry_max: default_retry_max(),
            replication_factor: default_replication_factor(),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let hosts = std::env::var("SCYLLA_HOSTS")
            .unwrap_or_else(|_| "127.0.0.1:9042".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let keyspace =
            std::env::var("SCYLLA_KEYSPACE").unwrap_or_else(|_| defaults.keyspace.clone());

        let millis = |name: &str, fallback: Duration| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            hosts,
            keyspace,
            query_timeout: millis("DB_QUERY_TIMEOUT_MS", defaults.query_timeout),
            retry_attempts: std::env::var("DB_RETRY_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.retry_attempts),
            retry_base: millis("DB_RETRY_BASE_MS", defaults.retry_base),
            retry_max: millis("DB_RETRY_MAX_MS", defaults.retry_max),
            replication_factor: std::env::var("SCYLLA_REPLICATION_FACTOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.replication_factor),
            ..defaults
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_attempts,
            self.retry_base,
            self.retry_max,
            self.query_timeout,
        )
    }
}

/// Result of a conditional status change
#[derive(Debug, Clone)]
pub enum StatusTransition {
    /// The session was active and now carries the new status
    Applied(FlightSession),
    /// The session was already terminal; nothing changed
    Rejected(SessionStatus),
}

/// Storage collaborator used by the tracking engine.
///
/// Implementations must enforce two uniqueness rules: one session per
/// (operator, session key), and one open violation per (session, zone).
/// Both surface as [`DbError::Duplicate`].
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait FlightStore: Send + Sync {
    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Insert a new session; `Duplicate` if the operator already has one with this key
    async fn insert_session(&self, session: &FlightSession) -> DbResult<()>;

    async fn get_session(&self, id: &SessionId) -> DbResult<Option<FlightSession>>;

    async fn find_session_by_key(
        &self,
        operator_id: &OperatorId,
        session_key: &str,
    ) -> DbResult<Option<FlightSession>>;

    /// Move an active session to `status`, writing `final_stats` in the same
    /// update when given. `NotFound` if the session does not exist.
    async fn transition_status(
        &self,
        id: &SessionId,
        status: SessionStatus,
        ended_at: DateTime<Utc>,
        final_stats: Option<FlightStats>,
    ) -> DbResult<StatusTransition>;

    /// Overwrite the statistics block of an active session in one write.
    /// Returns `false` without writing once the session is terminal.
    async fn update_stats(&self, id: &SessionId, stats: &FlightStats) -> DbResult<bool>;

    async fn active_sessions(&self) -> DbResult<Vec<FlightSession>>;

    // ------------------------------------------------------------------
    // Telemetry
    // ------------------------------------------------------------------

    async fn insert_points(&self, points: &[TelemetryPoint]) -> DbResult<()>;

    /// All points of a session ordered by timestamp
    async fn points_for_session(&self, id: &SessionId) -> DbResult<Vec<TelemetryPoint>>;

    async fn last_point_at(&self, id: &SessionId) -> DbResult<Option<DateTime<Utc>>>;

    // ------------------------------------------------------------------
    // Danger zones
    // ------------------------------------------------------------------

    async fn insert_zone(&self, zone: &DangerZone) -> DbResult<()>;

    async fn update_zone(&self, zone: &DangerZone) -> DbResult<()>;

    /// Returns whether a zone was removed
    async fn delete_zone(&self, id: &ZoneId) -> DbResult<bool>;

    async fn get_zone(&self, id: &ZoneId) -> DbResult<Option<DangerZone>>;

    /// Active zones belonging to `scope`
    async fn active_zones(&self, scope: &ZoneScope) -> DbResult<Vec<DangerZone>>;

    // ------------------------------------------------------------------
    // Violations
    // ------------------------------------------------------------------

    /// Insert an open violation; `Duplicate` if one is already open for the pair
    async fn insert_violation(&self, violation: &ZoneViolation) -> DbResult<()>;

    /// Persist altitude or exit changes to an existing violation
    async fn update_violation(&self, violation: &ZoneViolation) -> DbResult<()>;

    async fn open_violations(&self, session_id: &SessionId) -> DbResult<Vec<ZoneViolation>>;

    /// All violations of a session ordered by entry time
    async fn violations_for_session(&self, session_id: &SessionId) -> DbResult<Vec<ZoneViolation>>;

    // ------------------------------------------------------------------
    // Risk events
    // ------------------------------------------------------------------

    /// Append without reading the existing list
    async fn append_risk_event(&self, event: &RiskEvent) -> DbResult<()>;

    /// Risk events of a session ordered by time
    async fn risk_events(&self, session_id: &SessionId) -> DbResult<Vec<RiskEvent>>;

    async fn health_check(&self) -> DbResult<bool>;
}
