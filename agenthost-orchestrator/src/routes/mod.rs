// Routes module - all route definitions in one place
pub mod agents;
pub mod public;

use axum::Router;
use std::sync::Arc;

use crate::app::AppState;

/// Build the application router (state applied by the caller).
pub fn create_router() -> Router<Arc<AppState>> {
    Router::new()
        .merge(public::create_public_routes())
        .merge(agents::create_agent_routes())
}
