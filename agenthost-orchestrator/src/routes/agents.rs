// Agent provisioning and lifecycle routes. Ownership and subscription checks
// happen upstream, before requests reach this service.
use axum::routing::{delete, get, post};
use axum::Router;
use std::sync::Arc;

use crate::app::AppState;
use crate::handlers::agents;

pub fn create_agent_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/agents/{agent_id}/provision", post(agents::provision_agent))
        .route("/agents/{agent_id}/provisioning", get(agents::provisioning_status))
        .route("/agents/{agent_id}/start", post(agents::start_agent))
        .route("/agents/{agent_id}/stop", post(agents::stop_agent))
        .route("/agents/{agent_id}/instance", delete(agents::destroy_instance))
}
