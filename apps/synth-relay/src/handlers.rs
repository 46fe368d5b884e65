use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::lock::{Acquired, LockError, Released, Releaser};
use crate::relay::SharedRelay;

#[derive(Clone)]
pub struct AppState {
    pub relay: SharedRelay,
    pub idle_timeout: Duration,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireRequest {
    pub controller_client_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AcquireResponse {
    pub success: bool,
    pub takeover: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub controller_client_id: String,
    #[serde(default)]
    pub new_controller_client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub success: bool,
    pub released: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusQuery {
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub active: bool,
    pub is_current_client: bool,
    pub controller_client_id: Option<String>,
}

/// Lock failures and malformed lock requests mapped onto HTTP status codes.
pub enum LockErrorResponse {
    Lock(LockError),
    MissingClientId,
}

impl From<LockError> for LockErrorResponse {
    fn from(err: LockError) -> Self {
        Self::Lock(err)
    }
}

impl IntoResponse for LockErrorResponse {
    fn into_response(self) -> Response {
        let err = match self {
            Self::MissingClientId => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "success": false, "error": "missing_controller_client_id" })),
                )
                    .into_response();
            }
            Self::Lock(err) => err,
        };
        let (status, body) = match &err {
            LockError::Conflict { owner } => (
                StatusCode::CONFLICT,
                json!({
                    "success": false,
                    "error": "controller_active",
                    "activeControllerId": owner,
                }),
            ),
            LockError::NotOwner { .. } => (
                StatusCode::FORBIDDEN,
                json!({ "success": false, "error": "not_owner" }),
            ),
            LockError::Contended => (
                StatusCode::SERVICE_UNAVAILABLE,
                json!({ "success": false, "error": "contended" }),
            ),
            LockError::Store(err) => {
                error!(error = %err, "controller lock store failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({ "success": false, "error": "store_unavailable" }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.relay.registry().len(),
        "store": state.relay.store_backend(),
    }))
}

pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// POST /controller/active
pub async fn acquire_controller(
    State(state): State<AppState>,
    Json(req): Json<AcquireRequest>,
) -> Result<Json<AcquireResponse>, LockErrorResponse> {
    let owner = req.controller_client_id.trim();
    if owner.is_empty() {
        warn!("acquire without controllerClientId");
        return Err(LockErrorResponse::MissingClientId);
    }
    let acquired = state.relay.acquire_controller(owner, req.force).await?;
    info!(controller = %owner, ?acquired, "controller acquire via http");
    Ok(Json(AcquireResponse {
        success: true,
        takeover: matches!(acquired, Acquired::TookOver { .. }),
    }))
}

/// DELETE /controller/active
pub async fn release_controller(
    State(state): State<AppState>,
    Json(req): Json<ReleaseRequest>,
) -> Result<Json<ReleaseResponse>, LockErrorResponse> {
    let client_id = req.controller_client_id.trim();
    if client_id.is_empty() {
        warn!("release without controllerClientId");
        return Err(LockErrorResponse::MissingClientId);
    }
    let releaser = Releaser::from_client_id(client_id);
    let released = state
        .relay
        .release_controller(&releaser, req.new_controller_client_id.as_deref())
        .await?;
    info!(?releaser, ?released, "controller release via http");
    Ok(Json(ReleaseResponse {
        success: true,
        released: matches!(released, Released::Released { .. }),
    }))
}

/// GET /controller/active?clientId=
pub async fn controller_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, LockErrorResponse> {
    let current = state.relay.lock_status().await?;
    let is_current_client = match (&current, &query.client_id) {
        (Some(owner), Some(client)) => owner == client,
        _ => false,
    };
    Ok(Json(StatusResponse {
        active: current.is_some(),
        is_current_client,
        controller_client_id: current,
    }))
}
