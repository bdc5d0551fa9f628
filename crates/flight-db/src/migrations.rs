//! Database migrations

use crate::{DbError, DbResult};
use scylla::Session;
use tracing::{debug, info};

/// Schema version written after a successful run
pub const SCHEMA_VERSION: i32 = 1;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS schema_version (
        id int PRIMARY KEY,
        version int
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS flight_sessions (
        session_id uuid PRIMARY KEY,
        drone_id text,
        operator_id text,
        session_key text,
        started_at bigint,
        ended_at bigint,
        status text,
        stats text,
        health_score double,
        created_at bigint,
        updated_at bigint
    )
    "#,
    "CREATE INDEX IF NOT EXISTS flight_sessions_status_idx ON flight_sessions (status)",
    r#"
    CREATE TABLE IF NOT EXISTS flight_sessions_by_key (
        operator_id text,
        session_key text,
        session_id uuid,
        PRIMARY KEY ((operator_id, session_key))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS telemetry_points (
        session_id uuid,
        timestamp bigint,
        point_id uuid,
        drone_id text,
        latitude double,
        longitude double,
        altitude double,
        speed double,
        heading double,
        battery double,
        flight_mode text,
        armed boolean,
        raw text,
        PRIMARY KEY ((session_id), timestamp, point_id)
    ) WITH CLUSTERING ORDER BY (timestamp ASC, point_id ASC)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS danger_zones (
        zone_id uuid PRIMARY KEY,
        owner_id text,
        name text,
        description text,
        zone_type text,
        polygon text,
        altitude_limit double,
        visibility text,
        active boolean,
        created_at bigint,
        updated_at bigint
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS zone_violations (
        session_id uuid,
        violation_id uuid,
        zone_id uuid,
        entered_at bigint,
        exited_at bigint,
        duration_seconds bigint,
        max_altitude double,
        severity text,
        PRIMARY KEY ((session_id), violation_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS open_zone_violations (
        session_id uuid,
        zone_id uuid,
        violation_id uuid,
        PRIMARY KEY ((session_id), zone_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS risk_events (
        session_id uuid,
        timestamp bigint,
        event_id uuid,
        event_type text,
        severity text,
        message text,
        PRIMARY KEY ((session_id), timestamp, event_id)
    ) WITH CLUSTERING ORDER BY (timestamp ASC, event_id ASC)
    "#,
];

/// Create the keyspace if it is missing
pub async fn ensure_keyspace(
    session: &Session,
    keyspace: &str,
    replication_factor: u32,
) -> DbResult<()> {
    let cql = format!(
        "CREATE KEYSPACE IF NOT EXISTS {keyspace} WITH replication = \
         {{'class': 'SimpleStrategy', 'replication_factor': {replication_factor}}}"
    );
    session
        .query_unpaged(cql, &[])
        .await
        .map_err(|e| DbError::Migration(e.to_string()))?;
    Ok(())
}

/// Run all migrations against the session's current keyspace
pub async fn run_all(session: &Session) -> DbResult<()> {
    info!("Running database migrations...");

    let version = get_schema_version(session).await;
    info!("Current schema version: {}", version);

    if version >= SCHEMA_VERSION {
        info!("Schema up to date");
        return Ok(());
    }

    for statement in TABLES {
        debug!("Applying: {}", statement.trim().lines().next().unwrap_or_default());
        session
            .query_unpaged(*statement, &[])
            .await
            .map_err(|e| DbError::Migration(e.to_string()))?;
    }

    session
        .query_unpaged(
            "INSERT INTO schema_version (id, version) VALUES (1, ?)",
            (SCHEMA_VERSION,),
        )
        .await
        .map_err(|e| DbError::Migration(e.to_string()))?;

    info!("Migrations complete (schema version {})", SCHEMA_VERSION);
    Ok(())
}

/// Current schema version, 0 when the table does not exist yet
async fn get_schema_version(session: &Session) -> i32 {
    let query = "SELECT version FROM schema_version WHERE id = 1";

    let Ok(result) = session.query_unpaged(query, &[]).await else {
        return 0;
    };

    result
        .into_rows_result()
        .ok()
        .and_then(|rows| rows.maybe_first_row::<(Option<i32>,)>().ok().flatten())
        .and_then(|(version,)| version)
        .unwrap_or(0)
}
