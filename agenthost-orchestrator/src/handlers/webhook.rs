use std::sync::Arc;

use agenthost_common::OrchestratorError;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use super::{ApiError, ErrorBody};
use crate::app::AppState;
use crate::webhook;

#[derive(Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
}

#[utoipa::path(
    post,
    path = "/webhooks/provisioning",
    request_body(content = String, description = "Callback JSON, signed with X-Signature-256"),
    responses(
        (status = 200, description = "Callback accepted (applied or ignored)", body = WebhookAck),
        (status = 400, description = "Malformed body", body = ErrorBody),
        (status = 401, description = "Bad or missing signature", body = ErrorBody),
        (status = 404, description = "Unknown job", body = ErrorBody)
    )
)]
pub async fn receive_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let signature = headers
        .get(webhook::SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    if !webhook::verify_signature(state.config.webhook_secret.as_bytes(), &body, signature) {
        tracing::warn!("[webhook] rejected callback with bad or missing signature");
        return Err(OrchestratorError::Signature.into());
    }

    match webhook::process_callback(&state, &body).await {
        Ok(_) => Ok(Json(WebhookAck { received: true })),
        Err(e) => {
            tracing::warn!("[webhook] callback not applied: {}", e);
            Err(e.into())
        }
    }
}
