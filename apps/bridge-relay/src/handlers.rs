use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use bridge_core::{BridgeError, Coordinator, OperationKind, Request};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::pairing;

pub type SharedCoordinator = Arc<Coordinator>;

#[derive(Debug, Deserialize)]
pub struct PairDeviceRequest {
    pub device_id: String,
    /// Omit to have the relay mint a secret; it is returned exactly once.
    pub secret: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PairDeviceResponse {
    pub success: bool,
    pub device_id: String,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub agent: String,
    pub device_id: String,
    pub kind: OperationKind,
    pub payload: String,
    pub summary: String,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub agent: String,
}

#[derive(Debug, Deserialize)]
pub struct AwaitParams {
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct RequestView {
    pub request_id: Uuid,
    pub agent: String,
    pub device_id: String,
    pub kind: OperationKind,
    pub summary: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<Request> for RequestView {
    fn from(request: Request) -> Self {
        Self {
            request_id: request.id,
            agent: request.agent,
            device_id: request.device_id,
            kind: request.kind,
            summary: request.summary,
            status: request.status.to_string(),
            created_at: request.created_at,
            expires_at: request.expires_at,
            resolved_at: request.resolved_at,
        }
    }
}

fn error_response(err: BridgeError) -> Response {
    let status = match &err {
        BridgeError::UnknownDevice(_) | BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
        BridgeError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
        BridgeError::AlreadyResolved { .. } => StatusCode::CONFLICT,
        BridgeError::DeviceMismatch { .. } => StatusCode::FORBIDDEN,
        BridgeError::Timeout => StatusCode::REQUEST_TIMEOUT,
        BridgeError::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (
        status,
        Json(json!({ "success": false, "error": err.to_string() })),
    )
        .into_response()
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn api_status(State(coordinator): State<SharedCoordinator>) -> Json<serde_json::Value> {
    let registry = coordinator.registry();
    Json(json!({
        "status": "ok",
        "service": "shadow-bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "paired_devices": registry.paired_count(),
        "connected_devices": registry.connected_count(),
    }))
}

pub async fn pair_device(
    State(coordinator): State<SharedCoordinator>,
    Json(body): Json<PairDeviceRequest>,
) -> Response {
    let minted = body.secret.is_none();
    let secret = body.secret.unwrap_or_else(pairing::generate_secret);
    let fingerprint = pairing::fingerprint(&secret);
    let device = coordinator.pair_device(&body.device_id, &fingerprint);
    debug!(device = %device.device_id, "device paired");
    Json(PairDeviceResponse {
        success: true,
        device_id: device.device_id,
        fingerprint: device.fingerprint,
        secret: minted.then_some(secret),
    })
    .into_response()
}

pub async fn unpair_device(
    State(coordinator): State<SharedCoordinator>,
    Path(device_id): Path<String>,
) -> Response {
    match coordinator.unpair_device(&device_id) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn device_status(
    State(coordinator): State<SharedCoordinator>,
    Path(device_id): Path<String>,
) -> Response {
    match coordinator.registry().get(&device_id) {
        Ok(device) => Json(json!({
            "device_id": device.device_id,
            "connectivity": device.connectivity,
            "paired_at": device.paired_at,
            "last_seen": device.last_seen,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn submit_request(
    State(coordinator): State<SharedCoordinator>,
    Json(body): Json<SubmitRequest>,
) -> Response {
    let ttl = body.ttl_seconds.map(Duration::from_secs);
    match coordinator
        .submit(
            &body.agent,
            &body.device_id,
            body.kind,
            Bytes::from(body.payload),
            &body.summary,
            ttl,
        )
        .await
    {
        Ok(request) => (StatusCode::CREATED, Json(RequestView::from(request))).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn request_status(
    State(coordinator): State<SharedCoordinator>,
    Path(request_id): Path<Uuid>,
) -> Response {
    match coordinator.ledger().get(request_id).await {
        Ok(request) => Json(RequestView::from(request)).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn cancel_request(
    State(coordinator): State<SharedCoordinator>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<CancelRequest>,
) -> Response {
    match coordinator.cancel(request_id, &body.agent).await {
        Ok(request) => Json(RequestView::from(request)).into_response(),
        Err(err) => error_response(err),
    }
}

pub async fn await_request(
    State(coordinator): State<SharedCoordinator>,
    Path(request_id): Path<Uuid>,
    Query(params): Query<AwaitParams>,
) -> Response {
    let timeout = Duration::from_millis(params.timeout_ms.unwrap_or(30_000));
    match coordinator.await_resolution(request_id, timeout).await {
        Ok(status) => Json(json!({
            "request_id": request_id,
            "status": status,
        }))
        .into_response(),
        Err(err) => error_response(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_body_parses_snake_case_kind() {
        let body: SubmitRequest = serde_json::from_str(
            r#"{
                "agent": "a1",
                "device_id": "d1",
                "kind": "shell_exec",
                "payload": "ls",
                "summary": "run: ls"
            }"#,
        )
        .unwrap();
        assert_eq!(body.kind, OperationKind::ShellExec);
        assert!(body.ttl_seconds.is_none());
    }
}
