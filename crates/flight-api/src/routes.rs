//! API route definitions

use crate::handlers;
use crate::state::AppState;

use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use std::time::{Duration, Instant};
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = if state.config.cors_permissive {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .max_age(Duration::from_secs(3600))
    } else {
        CorsLayer::new()
            .allow_origin(HeaderValue::from_static("http://localhost:8080"))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        // Health & Status
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/status", get(handlers::system_status))

        // Metrics (Prometheus format)
        .route("/metrics", get(handlers::metrics))

        // Telemetry ingestion (device tokens)
        .route("/api/v1/telemetry", post(handlers::ingest_telemetry))
        .route("/api/v1/telemetry/batch", post(handlers::ingest_batch))

        // Flights API
        .route("/api/v1/flights", post(handlers::create_flight))
        .route(
            "/api/v1/flights/{id}",
            get(handlers::get_flight).patch(handlers::update_flight),
        )
        .route("/api/v1/flights/{id}/recalculate-stats", post(handlers::recalculate_stats))
        .route("/api/v1/flights/{id}/telemetry", get(handlers::flight_telemetry))
        .route("/api/v1/flights/{id}/violations", get(handlers::flight_violations))
        .route("/api/v1/flights/{id}/risk-events", get(handlers::flight_risk_events))
        .route("/api/v1/flights/{id}/rth/estimate", post(handlers::rth_estimate))
        .route("/api/v1/flights/{id}/rth", post(handlers::trigger_rth))

        // Danger zones API
        .route(
            "/api/v1/danger-zones",
            get(handlers::list_zones).post(handlers::create_zone),
        )
        .route(
            "/api/v1/danger-zones/{id}",
            get(handlers::get_zone)
                .patch(handlers::update_zone)
                .delete(handlers::delete_zone),
        )

        // Apply middleware
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .with_state(state)
}

/// Count requests by matched route so ids do not explode label cardinality
async fn track_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;
    state.metrics.record_api_request(
        &method,
        &path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{claims, TokenKind};
    use crate::config::{ApiConfig, StoreBackend};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, StatusCode};
    use flight_db::MemoryStore;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        AppState::new(
            ApiConfig::default(),
            Arc::new(MemoryStore::new()),
            StoreBackend::Memory,
        )
        .unwrap()
    }

    fn token(state: &AppState, kind: TokenKind, user: &str, drone: Option<&str>) -> String {
        state.jwt.issue(&claims(kind, user, drone)).unwrap()
    }

    async fn call(
        state: &AppState,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let state = test_state();
        let (status, body) = call(&state, Method::GET, "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = call(&state, Method::GET, "/status", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["websocket_messages_sent"], 0);
        assert_eq!(body["websocket_messages_dropped"], 0);
    }

    #[tokio::test]
    async fn test_telemetry_requires_device_token() {
        let state = test_state();
        let point = json!({"latitude": 1.0, "longitude": 1.0, "altitude": 10.0, "battery": 50.0});

        let (status, body) = call(&state, Method::POST, "/api/v1/telemetry", None, Some(point.clone())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "unauthorized");

        let user = token(&state, TokenKind::User, "op-1", None);
        let (status, _) = call(&state, Method::POST, "/api/v1/telemetry", Some(&user), Some(point)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_ingest_then_read_flight() {
        let state = test_state();
        let device = token(&state, TokenKind::Device, "op-1", Some("quad-1"));
        let owner = token(&state, TokenKind::User, "op-1", None);
        let stranger = token(&state, TokenKind::User, "op-2", None);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/telemetry",
            Some(&device),
            Some(json!({
                "session_id": "flight-a",
                "latitude": 45.0,
                "longitude": 7.0,
                "altitude": 100.0,
                "battery": 77.0
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let flight_id = body["session_id"].as_str().unwrap().to_string();

        let uri = format!("/api/v1/flights/{flight_id}");
        let (status, body) = call(&state, Method::GET, &uri, Some(&owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_key"], "flight-a");

        let (status, _) = call(&state, Method::GET, &uri, Some(&stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &state,
            Method::PATCH,
            &uri,
            Some(&owner),
            Some(json!({"status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(
            &state,
            Method::PATCH,
            &uri,
            Some(&owner),
            Some(json!({"status": "cancelled"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "conflict");
    }

    #[tokio::test]
    async fn test_invalid_telemetry_is_bad_request() {
        let state = test_state();
        let device = token(&state, TokenKind::Device, "op-1", Some("quad-1"));

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/telemetry",
            Some(&device),
            Some(json!({"latitude": 120.0, "longitude": 1.0, "altitude": 10.0, "battery": 50.0})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");
    }

    #[tokio::test]
    async fn test_batch_requires_session_and_points() {
        let state = test_state();
        let device = token(&state, TokenKind::Device, "op-1", Some("quad-1"));

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/telemetry/batch",
            Some(&device),
            Some(json!({"session_id": "log-1", "points": []})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["message"], "session_id and points array required");

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/telemetry/batch",
            Some(&device),
            Some(json!({
                "session_id": "log-1",
                "points": [
                    {"latitude": 1.0, "longitude": 1.0, "altitude": 10.0, "battery": 90.0},
                    {"latitude": 1.001, "longitude": 1.0, "altitude": 12.0, "battery": 89.0}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["ingested"], 2);
    }

    #[tokio::test]
    async fn test_batch_accepts_camel_case_session_key() {
        let state = test_state();
        let device = token(&state, TokenKind::Device, "op-1", Some("quad-1"));
        let owner = token(&state, TokenKind::User, "op-1", None);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/telemetry/batch",
            Some(&device),
            Some(json!({
                "sessionKey": "mission-9",
                "points": [
                    {"latitude": 2.0, "longitude": 2.0, "altitude": 15.0, "battery": 95.0}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["ingested"], 1);

        let uri = format!("/api/v1/flights/{}", body["session_id"].as_str().unwrap());
        let (status, body) = call(&state, Method::GET, &uri, Some(&owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["session_key"], "mission-9");
    }

    #[tokio::test]
    async fn test_recalculate_keeps_completed_flight_stats() {
        let state = test_state();
        let device = token(&state, TokenKind::Device, "op-1", Some("quad-1"));
        let owner = token(&state, TokenKind::User, "op-1", None);

        let telemetry = |battery: f64| {
            json!({
                "session_id": "sortie",
                "latitude": 3.0,
                "longitude": 3.0,
                "altitude": 20.0,
                "battery": battery
            })
        };

        let (_, body) = call(&state, Method::POST, "/api/v1/telemetry", Some(&device), Some(telemetry(90.0))).await;
        let uri = format!("/api/v1/flights/{}", body["session_id"].as_str().unwrap());

        let (status, _) = call(
            &state,
            Method::PATCH,
            &uri,
            Some(&owner),
            Some(json!({"status": "completed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Stored for audit after completion
        let (status, _) = call(&state, Method::POST, "/api/v1/telemetry", Some(&device), Some(telemetry(10.0))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, _) = call(
            &state,
            Method::POST,
            &format!("{uri}/recalculate-stats"),
            Some(&owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&state, Method::GET, &uri, Some(&owner), None).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["stats"]["min_battery_percent"], 90.0);
    }

    #[tokio::test]
    async fn test_rth_before_any_point_is_unprocessable() {
        let state = test_state();
        let owner = token(&state, TokenKind::User, "op-1", None);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/flights",
            Some(&owner),
            Some(json!({"drone_id": "quad-1", "session_id": "planned"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let flight_id = body["id"].as_str().unwrap().to_string();

        let (status, body) = call(
            &state,
            Method::POST,
            &format!("/api/v1/flights/{flight_id}/rth/estimate"),
            Some(&owner),
            Some(json!({"latitude": 1.0, "longitude": 1.0, "battery_percent": 40.0})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error"], "unprocessable");
    }

    #[tokio::test]
    async fn test_zone_lifecycle() {
        let state = test_state();
        let owner = token(&state, TokenKind::User, "op-1", None);
        let other = token(&state, TokenKind::User, "op-2", None);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/v1/danger-zones",
            Some(&owner),
            Some(json!({
                "name": "Hospital",
                "zone_type": "restricted",
                "coordinates": [
                    {"latitude": 0.0, "longitude": 0.0},
                    {"latitude": 0.0, "longitude": 1.0},
                    {"latitude": 1.0, "longitude": 1.0},
                    {"latitude": 1.0, "longitude": 0.0}
                ]
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let zone_uri = format!("/api/v1/danger-zones/{}", body["id"].as_str().unwrap());

        let (_, body) = call(&state, Method::GET, "/api/v1/danger-zones", Some(&other), None).await;
        assert_eq!(body["total"], 0);

        let (status, _) = call(&state, Method::DELETE, &zone_uri, Some(&other), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(&state, Method::DELETE, &zone_uri, Some(&owner), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&state, Method::GET, &zone_uri, Some(&owner), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
