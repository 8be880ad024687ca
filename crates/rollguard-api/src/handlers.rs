//! REST API handlers.
//!
//! Each handler reads/writes via `StateStore` (and the `HealthMonitor` for
//! session control) and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tracing::{info, warn};

use rollguard_health::MonitorDecision;
use rollguard_rollout::MonitoringSession;
use rollguard_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
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

/// Map a store error to a status code. Rejected updates are conflicts.
fn store_error(e: StateError) -> Response {
    let status = match e {
        StateError::InvalidTransition { .. } | StateError::RollbackFlagChanged(_) => {
            StatusCode::CONFLICT
        }
        StateError::InvalidKey { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

// ── Deployments ────────────────────────────────────────────────

/// Result of a deployment report.
#[derive(Debug, Serialize)]
pub struct DeploymentReport {
    pub deployment: Deployment,
    /// Present when this report moved the deployment into `finished`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<MonitorDecision>,
}

/// PUT /api/v1/deployments
///
/// A first report of a newer release aborts the application's active
/// session right away; a report that moves a deployment into `finished`
/// hands it to the monitor.
pub async fn report_deployment(
    State(state): State<ApiState>,
    Json(deployment): Json<Deployment>,
) -> Response {
    if deployment.id.is_empty() || deployment.application_id.is_empty() {
        return error_response("id and application_id are required", StatusCode::BAD_REQUEST);
    }

    let previous = match state.store.put_deployment(&deployment) {
        Ok(previous) => previous,
        Err(e) => {
            warn!(deployment_id = %deployment.id, error = %e, "deployment report rejected");
            return store_error(e);
        }
    };

    if previous.is_none() && state.monitor.supersede(&deployment).await {
        info!(
            application_id = %deployment.application_id,
            deployment_id = %deployment.id,
            "newer deployment reported, active session aborted"
        );
    }

    let newly_finished = deployment.status == DeploymentStatus::Finished
        && previous
            .as_ref()
            .is_none_or(|p| p.status != DeploymentStatus::Finished);
    let monitor = if newly_finished {
        let decision = state.monitor.on_deployment_finished(&deployment).await;
        info!(
            application_id = %deployment.application_id,
            deployment_id = %deployment.id,
            ?decision,
            "deployment finished"
        );
        Some(decision)
    } else {
        None
    };

    let status = if previous.is_none() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    (status, ApiResponse::ok(DeploymentReport { deployment, monitor })).into_response()
}

/// GET /api/v1/applications/{app}/deployments
pub async fn list_deployments(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Response {
    match state.store.list_deployments_for_application(&app) {
        Ok(deployments) => ApiResponse::ok(deployments).into_response(),
        Err(e) => store_error(e),
    }
}

/// GET /api/v1/applications/{app}/deployments/{id}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path((app, id)): Path<(String, String)>,
) -> Response {
    match state.store.get_deployment(&app, &id) {
        Ok(Some(deployment)) => ApiResponse::ok(deployment).into_response(),
        Ok(None) => error_response("deployment not found", StatusCode::NOT_FOUND),
        Err(e) => store_error(e),
    }
}

// ── Settings ───────────────────────────────────────────────────

/// GET /api/v1/applications/{app}/settings
pub async fn get_settings(State(state): State<ApiState>, Path(app): Path<String>) -> Response {
    match state.store.get_settings(&app) {
        Ok(settings) => ApiResponse::ok(settings).into_response(),
        Err(e) => store_error(e),
    }
}

/// PUT /api/v1/applications/{app}/settings
///
/// Takes effect for a running session at its next tick.
pub async fn put_settings(
    State(state): State<ApiState>,
    Path(app): Path<String>,
    Json(settings): Json<RollbackSettings>,
) -> Response {
    if let Err(e) = state.store.put_settings(&app, &settings) {
        return store_error(e);
    }
    info!(application_id = %app, enabled = settings.auto_rollback_enabled, "rollback settings updated");
    ApiResponse::ok(settings.normalized()).into_response()
}

// ── Instances ──────────────────────────────────────────────────

/// PUT /api/v1/instances
pub async fn report_instance(
    State(state): State<ApiState>,
    Json(instance): Json<InstanceState>,
) -> Response {
    if instance.id.is_empty() || instance.deployment_id.is_empty() {
        return error_response("id and deployment_id are required", StatusCode::BAD_REQUEST);
    }
    match state.store.put_instance(&instance) {
        Ok(()) => ApiResponse::ok(instance).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Sessions ───────────────────────────────────────────────────

/// GET /api/v1/sessions
pub async fn list_active_sessions(State(state): State<ApiState>) -> Response {
    let mut sessions: Vec<MonitoringSession> = state.monitor.active_sessions().await;
    sessions.sort_by(|a, b| a.application_id().cmp(b.application_id()));
    ApiResponse::ok(sessions).into_response()
}

/// GET /api/v1/applications/{app}/sessions
pub async fn list_session_history(
    State(state): State<ApiState>,
    Path(app): Path<String>,
) -> Response {
    match state.store.list_sessions_for_application(&app) {
        Ok(records) => ApiResponse::ok(records).into_response(),
        Err(e) => store_error(e),
    }
}

/// DELETE /api/v1/applications/{app}/session
///
/// Stops the active session; it is archived as aborted (cancelled).
pub async fn stop_session(State(state): State<ApiState>, Path(app): Path<String>) -> Response {
    let Some(active) = state.monitor.session(&app).await else {
        return error_response("no active monitoring session", StatusCode::NOT_FOUND);
    };
    if !state.monitor.cancel(&app).await {
        return error_response("no active monitoring session", StatusCode::NOT_FOUND);
    }

    match state.store.get_session(&app, active.deployment_id()) {
        Ok(Some(record)) => ApiResponse::ok(record).into_response(),
        Ok(None) => ApiResponse::ok(active.to_record()).into_response(),
        Err(e) => store_error(e),
    }
}

// ── Liveness ───────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz() -> Response {
    ApiResponse::ok("ok").into_response()
}
