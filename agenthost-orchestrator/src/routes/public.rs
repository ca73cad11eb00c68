// Public routes: liveness, OpenAPI document and the signed webhook
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use utoipa::OpenApi;

use crate::api_docs::ApiDoc;
use crate::app::AppState;
use crate::handlers::webhook;

pub fn create_public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(root))
        .route("/api-docs/openapi.json", get(openapi))
        // Authenticated by HMAC signature, not by session.
        .route("/webhooks/provisioning", post(webhook::receive_callback))
}

async fn root() -> &'static str {
    "agenthost-orchestrator online"
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
