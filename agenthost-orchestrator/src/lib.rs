// Library entry point: the binary and the integration tests share everything below.

pub mod api_docs;
pub mod app;
pub mod audit;
pub mod config;
pub mod handlers;
pub mod heartbeat_job;
pub mod lifecycle;
pub mod logger;
pub mod progress;
pub mod provider_manager;
pub mod provisioning;
pub mod rollback;
pub mod routes;
pub mod state_machine;
pub mod store;
pub mod webhook;

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::app::AppState;

/// Full router with CORS and request tracing, state applied.
pub fn build_app(state: Arc<AppState>) -> Router {
    routes::create_router()
        .layer(app::create_cors())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
