//! Thin HTTP shell over the driver.
//!
//! Decodes inbound control messages and forwards them to the driver handle.
//! No logic lives here beyond status-code mapping.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use drender_id::ProjectId;
use drender_protocol::{InstanceHeartbeat, ProjectAction, ProjectRequest, ProjectResponse};
use serde::Serialize;

use crate::driver::DriverHandle;
use crate::error::DriverError;

pub fn create_router(handle: DriverHandle) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/projects", post(submit_project))
        .route("/v1/projects/:id", get(project_status))
        .route("/v1/instances", post(instance_message))
        .with_state(handle)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn submit_project(
    State(handle): State<DriverHandle>,
    Json(request): Json<ProjectRequest>,
) -> Result<Json<ProjectResponse>, ApiError> {
    let response = match request.action {
        ProjectAction::Start => handle.start_project(request).await?,
        ProjectAction::Status => handle.status(request.id).await?,
    };
    Ok(Json(response))
}

async fn project_status(
    State(handle): State<DriverHandle>,
    Path(id): Path<String>,
) -> Result<Json<ProjectResponse>, ApiError> {
    let project_id = ProjectId::parse(id)
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    Ok(Json(handle.status(project_id).await?))
}

async fn instance_message(
    State(handle): State<DriverHandle>,
    Json(message): Json<InstanceHeartbeat>,
) -> Result<StatusCode, ApiError> {
    handle.instance_message(message).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DriverError> for ApiError {
    fn from(err: DriverError) -> Self {
        let status = match &err {
            DriverError::ProjectAlreadyPresent(_) => StatusCode::CONFLICT,
            DriverError::InvalidRequest(_) | DriverError::UnknownSoftware(_) => {
                StatusCode::BAD_REQUEST
            }
            DriverError::BrokerMismatch { .. } => StatusCode::CONFLICT,
            DriverError::Provision(_) => StatusCode::BAD_GATEWAY,
            DriverError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
            DriverError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}
