//! API request handlers

use crate::auth::{DeviceAuth, ObserverAuth};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use flight_core::{
    default_session_key, DangerZone, DangerZoneUpdate, DroneId, FlightSession, NewDangerZone,
    RiskEvent, SessionId, SessionStatus, TelemetryInput, TelemetryPoint, ZoneId, ZoneViolation,
};
use flight_tracker::{EngineStats, RthEstimate, RthInput};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_RTH_REASON: &str = "Manual RTH triggered";

// ============================================================================
// REQUEST / RESPONSE TYPES
// ============================================================================

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub api: String,
    pub store: String,
    pub websocket_clients: usize,
    pub websocket_messages_sent: u64,
    pub websocket_messages_dropped: u64,
    pub zone_cache_scopes: usize,
    pub engine: EngineStats,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub success: bool,
    pub session_id: SessionId,
    pub point_id: Uuid,
}

#[derive(Deserialize)]
pub struct BatchRequest {
    #[serde(default, alias = "sessionKey", alias = "sessionId", alias = "session_key")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub points: Option<Vec<TelemetryInput>>,
}

#[derive(Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub session_id: SessionId,
    pub ingested: usize,
}

#[derive(Deserialize)]
pub struct CreateFlightRequest {
    pub drone_id: String,
    /// Session key; generated from the drone and start time when absent
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct UpdateFlightRequest {
    pub status: SessionStatus,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize, Default)]
pub struct TriggerRthRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct TelemetryListResponse {
    pub flight_id: SessionId,
    pub count: usize,
    pub points: Vec<TelemetryPoint>,
}

#[derive(Serialize)]
pub struct ViolationListResponse {
    pub flight_id: SessionId,
    pub violations: Vec<ZoneViolation>,
}

#[derive(Serialize)]
pub struct RiskEventListResponse {
    pub flight_id: SessionId,
    pub events: Vec<RiskEvent>,
}

#[derive(Serialize)]
pub struct ZoneListResponse {
    pub zones: Vec<DangerZone>,
    pub total: usize,
}

// ============================================================================
// HEALTH & STATUS HANDLERS
// ============================================================================

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// Readiness check: the store answers
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let ready = state.store.health_check().await.unwrap_or(false);

    if ready {
        (StatusCode::OK, Json(serde_json::json!({"ready": true})))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"ready": false})),
        )
    }
}

/// System status overview
pub async fn system_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        api: "running".into(),
        store: state.backend.as_str().into(),
        websocket_clients: state.ws_client_count(),
        websocket_messages_sent: state.ws_hub.message_count(),
        websocket_messages_dropped: state.ws_hub.dropped_count(),
        zone_cache_scopes: state.tracker.zones().cached_scopes(),
        engine: state.tracker.engine().stats(),
    })
}

/// Prometheus metrics endpoint
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.export(),
    )
}

// ============================================================================
// TELEMETRY HANDLERS
// ============================================================================

/// Ingest one live telemetry point
pub async fn ingest_telemetry(
    State(state): State<AppState>,
    device: DeviceAuth,
    Json(input): Json<TelemetryInput>,
) -> ApiResult<impl IntoResponse> {
    let receipt = state
        .tracker
        .ingest(&device.drone_id, &device.operator_id, input)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            success: true,
            session_id: receipt.session_id,
            point_id: receipt.point_id,
        }),
    ))
}

/// Ingest an uploaded log in one call
pub async fn ingest_batch(
    State(state): State<AppState>,
    device: DeviceAuth,
    Json(request): Json<BatchRequest>,
) -> ApiResult<impl IntoResponse> {
    let (session_key, points) = match (request.session_id, request.points) {
        (Some(key), Some(points)) if !key.trim().is_empty() && !points.is_empty() => (key, points),
        _ => return Err(ApiError::bad_request("session_id and points array required")),
    };

    let receipt = state
        .tracker
        .ingest_batch(&device.drone_id, &device.operator_id, &session_key, points)
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(BatchResponse {
            success: true,
            session_id: receipt.session_id,
            ingested: receipt.ingested,
        }),
    ))
}

// ============================================================================
// FLIGHT HANDLERS
// ============================================================================

async fn owned_flight(state: &AppState, auth: &ObserverAuth, id: Uuid) -> ApiResult<FlightSession> {
    Ok(state
        .tracker
        .sessions()
        .get_owned(&SessionId(id), &auth.operator_id)
        .await?)
}

/// Create a session before any telemetry arrives
pub async fn create_flight(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Json(request): Json<CreateFlightRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.drone_id.trim().is_empty() {
        return Err(ApiError::bad_request("drone_id is required"));
    }
    let drone_id = DroneId::new(request.drone_id);
    let started_at = request.started_at.unwrap_or_else(Utc::now);
    let key = request
        .session_id
        .filter(|k| !k.trim().is_empty())
        .unwrap_or_else(|| default_session_key(&drone_id, started_at));

    let session = state
        .tracker
        .sessions()
        .resolve_or_create(&drone_id, &auth.operator_id, &key, started_at)
        .await?;

    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_flight(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FlightSession>> {
    Ok(Json(owned_flight(&state, &auth, id).await?))
}

/// End a flight as completed or cancelled
pub async fn update_flight(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateFlightRequest>,
) -> ApiResult<Json<FlightSession>> {
    let session = owned_flight(&state, &auth, id).await?;
    let updated = state
        .tracker
        .sessions()
        .update_status(&session.id, request.status, request.ended_at)
        .await?;

    info!(flight_id = %session.id, status = %updated.status, "Flight status updated via API");
    Ok(Json(updated))
}

/// Recompute statistics now and return the updated flight
pub async fn recalculate_stats(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<FlightSession>> {
    let session = owned_flight(&state, &auth, id).await?;
    state.tracker.statistics().recompute(&session.id).await?;
    Ok(Json(state.tracker.sessions().get(&session.id).await?))
}

pub async fn flight_telemetry(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TelemetryListResponse>> {
    let session = owned_flight(&state, &auth, id).await?;
    let points = state.store.points_for_session(&session.id).await?;
    debug!(flight_id = %session.id, count = points.len(), "Telemetry listed");

    Ok(Json(TelemetryListResponse {
        flight_id: session.id,
        count: points.len(),
        points,
    }))
}

pub async fn flight_violations(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ViolationListResponse>> {
    let session = owned_flight(&state, &auth, id).await?;
    let violations = state.store.violations_for_session(&session.id).await?;
    Ok(Json(ViolationListResponse {
        flight_id: session.id,
        violations,
    }))
}

pub async fn flight_risk_events(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<RiskEventListResponse>> {
    let session = owned_flight(&state, &auth, id).await?;
    let events = state.store.risk_events(&session.id).await?;
    Ok(Json(RiskEventListResponse {
        flight_id: session.id,
        events,
    }))
}

pub async fn rth_estimate(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
    Json(input): Json<RthInput>,
) -> ApiResult<Json<RthEstimate>> {
    let session = owned_flight(&state, &auth, id).await?;
    Ok(Json(state.tracker.rth().estimate(&session.id, &input).await?))
}

pub async fn trigger_rth(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
    request: Option<Json<TriggerRthRequest>>,
) -> ApiResult<impl IntoResponse> {
    let session = owned_flight(&state, &auth, id).await?;
    let reason = request
        .and_then(|Json(r)| r.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_RTH_REASON.to_string());

    let command = state.tracker.rth().trigger_rth(&session.id, &reason).await?;
    Ok((StatusCode::ACCEPTED, Json(command)))
}

// ============================================================================
// DANGER ZONE HANDLERS
// ============================================================================

/// Public zones plus the caller's own
pub async fn list_zones(
    State(state): State<AppState>,
    auth: ObserverAuth,
) -> ApiResult<Json<ZoneListResponse>> {
    let zones = state.tracker.zones().list_visible(&auth.operator_id).await?;
    Ok(Json(ZoneListResponse {
        total: zones.len(),
        zones,
    }))
}

pub async fn create_zone(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Json(request): Json<NewDangerZone>,
) -> ApiResult<impl IntoResponse> {
    let zone = state.tracker.zones().create(&auth.operator_id, request).await?;
    Ok((StatusCode::CREATED, Json(zone)))
}

pub async fn get_zone(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<DangerZone>> {
    let zone_id = ZoneId(id);
    match state.store.get_zone(&zone_id).await? {
        Some(zone) if zone.is_visible_to(&auth.operator_id) => Ok(Json(zone)),
        _ => Err(ApiError::not_found(format!("Danger zone not found: {zone_id}"))),
    }
}

pub async fn update_zone(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
    Json(update): Json<DangerZoneUpdate>,
) -> ApiResult<Json<DangerZone>> {
    let zone = state
        .tracker
        .zones()
        .update(&auth.operator_id, &ZoneId(id), update)
        .await?;
    Ok(Json(zone))
}

pub async fn delete_zone(
    State(state): State<AppState>,
    auth: ObserverAuth,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state
        .tracker
        .zones()
        .delete(&auth.operator_id, &ZoneId(id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
