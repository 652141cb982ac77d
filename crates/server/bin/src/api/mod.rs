//! HTTP intake and saga query endpoints.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

use capi_server_application::{ClusterProvisioningService, InstanceSnapshot, IntakeError, RunnerError};
use capi_server_domain::{HistoryRecorder, ProviderOptions, ProvisionRequest, SagaId, TransitionEvent};

// ============================================================================
// API State
// ============================================================================

#[derive(Clone)]
pub struct ApiState {
    pub provisioning: ClusterProvisioningService,
    pub history: Arc<dyn HistoryRecorder>,
}

impl ApiState {
    pub fn new(provisioning: ClusterProvisioningService, history: Arc<dyn HistoryRecorder>) -> Self {
        Self {
            provisioning,
            history,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            Self::NotFound(m) => (StatusCode::NOT_FOUND, m),
            Self::Conflict(m) => (StatusCode::CONFLICT, m),
            Self::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            Self::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<IntakeError> for ApiError {
    fn from(err: IntakeError) -> Self {
        match err {
            IntakeError::UnsupportedProvider(_) | IntakeError::InvalidConfig(_) => {
                Self::BadRequest(err.to_string())
            }
            IntakeError::Runner(RunnerError::AlreadyStarted(_)) => Self::Conflict(err.to_string()),
            IntakeError::Runner(RunnerError::ShuttingDown) => Self::Unavailable(err.to_string()),
            IntakeError::Runner(RunnerError::UnknownWorkflow(_)) | IntakeError::Encode(_) => {
                error!(error = %err, "Provisioning request could not be started");
                Self::Internal(err.to_string())
            }
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/v1/clouds/:owner/:provider/cluster", post(create_cluster))
        .route("/api/v1/workflows/:id", get(get_workflow))
        .route("/api/v1/workflows/:id/history", get(get_workflow_history))
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

async fn create_cluster(
    State(state): State<ApiState>,
    Path((owner, provider)): Path<(String, String)>,
    Json(request): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let (id, options) = state
        .provisioning
        .provision(&owner, &provider, request)
        .inspect_err(|e| warn!(%owner, %provider, error = %e, "Provisioning request rejected"))?;
    let location = format!("/api/v1/workflows/{}", id);
    Ok((StatusCode::ACCEPTED, [(header::LOCATION, location)], Json(options)))
}

async fn get_workflow(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<InstanceSnapshot>, ApiError> {
    state
        .provisioning
        .runner()
        .snapshot(&SagaId::new(id.as_str()))
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("workflow {} not found", id)))
}

async fn get_workflow_history(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<TransitionEvent>>, ApiError> {
    let id = SagaId::new(id);
    let events = state.history.get(&id).await.map_err(|e| {
        error!(saga_id = %id, error = %e, "Failed to read history");
        ApiError::Internal(e.to_string())
    })?;
    if events.is_empty() && state.provisioning.runner().status(&id).is_none() {
        return Err(ApiError::NotFound(format!("workflow {} not found", id)));
    }
    Ok(Json(events))
}
