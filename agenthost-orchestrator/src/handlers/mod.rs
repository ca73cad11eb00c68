pub mod agents;
pub mod webhook;

use agenthost_common::OrchestratorError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// HTTP rendering of `OrchestratorError`.
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        ApiError(e)
    }
}

pub fn status_for(e: &OrchestratorError) -> StatusCode {
    match e {
        OrchestratorError::Signature => StatusCode::UNAUTHORIZED,
        OrchestratorError::MalformedCallback(_) | OrchestratorError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
        OrchestratorError::Conflict(_) | OrchestratorError::Precondition(_) => StatusCode::CONFLICT,
        OrchestratorError::Dispatch(_) | OrchestratorError::RemoteLifecycle(_) => {
            StatusCode::BAD_GATEWAY
        }
        OrchestratorError::Store(_) | OrchestratorError::Rollback(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!("[api] {} {}", status.as_u16(), self.0);
        }
        let body = ErrorBody {
            error: self.0.code().to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
