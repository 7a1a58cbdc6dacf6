//! REST API handlers.
//!
//! Each handler calls into the `LoadBalancer` and returns a JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::time::Instant;
use tracing::warn;

use zerogrid_core::{ErrorKind, FabricError, ServiceDefinition};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub struct ApiResponse<T: serde::Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for a control-plane error.
pub fn status_for(error: &FabricError) -> StatusCode {
    match error.kind() {
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::CapacityExceeded
        | ErrorKind::ServiceUnavailable
        | ErrorKind::CircuitBroken => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
    }
}

pub fn fabric_error(error: &FabricError) -> Response {
    error_response(&error.to_string(), status_for(error))
}

// ── Services ───────────────────────────────────────────────────

/// GET /api/v1/services
pub async fn list_services(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.balancer.services())
}

/// POST /api/v1/services
pub async fn register_service(
    State(state): State<ApiState>,
    Json(definition): Json<ServiceDefinition>,
) -> Response {
    match state.balancer.register_service(definition.clone()).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(definition)).into_response(),
        Err(e) => {
            warn!(service = %definition.id, error = %e, "registration rejected");
            fabric_error(&e)
        }
    }
}

/// DELETE /api/v1/services/{id}
pub async fn unregister_service(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.balancer.unregister_service(&id).await {
        Ok(rejected) => ApiResponse::ok(serde_json::json!({
            "service": id,
            "rejected_requests": rejected,
        }))
        .into_response(),
        Err(e) => fabric_error(&e),
    }
}

/// GET /api/v1/services/{id}/instances
pub async fn list_instances(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state.balancer.get_instances(&id) {
        Ok(instances) => {
            let now = Instant::now();
            let views: Vec<_> = instances.iter().map(|i| i.view(now)).collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => fabric_error(&e),
    }
}

/// GET /api/v1/services/{id}/metrics
pub async fn get_service_metrics(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Response {
    match state
        .balancer
        .service_snapshots()
        .into_iter()
        .find(|s| s.service_id == id)
    {
        Some(snapshot) => ApiResponse::ok(snapshot).into_response(),
        None => fabric_error(&FabricError::ServiceNotFound(id)),
    }
}

// ── Balancer state ─────────────────────────────────────────────

/// GET /api/v1/stats
pub async fn get_stats(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.balancer.get_stats())
}

/// GET /api/v1/circuits
pub async fn list_circuits(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.balancer.get_circuit_stats())
}

#[derive(Debug, Default, serde::Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/scaling-events?limit=N
pub async fn list_scaling_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    ApiResponse::ok(state.balancer.get_scaling_events(query.limit))
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.balancer.render_metrics(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        let cases = [
            (FabricError::ServiceNotFound("a".into()), StatusCode::NOT_FOUND),
            (FabricError::AlreadyRegistered("a".into()), StatusCode::CONFLICT),
            (FabricError::InvalidDefinition("a".into()), StatusCode::BAD_REQUEST),
            (
                FabricError::CapacityExceeded {
                    service: "a".into(),
                    max_queue_size: 1,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (FabricError::unavailable("a", "down"), StatusCode::SERVICE_UNAVAILABLE),
            (
                FabricError::Provisioning {
                    service: "a".into(),
                    reason: "boom".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                FabricError::RequestTimeout {
                    request_id: "req-1".into(),
                    waited_ms: 10,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (FabricError::Upstream("reset".into()), StatusCode::BAD_GATEWAY),
        ];
        for (error, status) in cases {
            assert_eq!(status_for(&error), status, "{error}");
        }
    }

    #[test]
    fn error_envelope_omits_data() {
        let body = serde_json::to_value(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some("nope".into()),
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({"success": false, "error": "nope"}));
    }
}
