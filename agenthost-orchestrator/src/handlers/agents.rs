use std::sync::Arc;

use agenthost_common::{AgentInstance, Backing, InstanceStatus, OrchestratorError, ProvisioningJob};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{ApiError, ErrorBody};
use crate::app::AppState;
use crate::lifecycle::{self, LifecycleOutcome};
use crate::progress::{self, StepView};
use crate::provisioning;

#[derive(Deserialize, ToSchema)]
pub struct ProvisionRequest {
    pub region: String,
    pub requested_by: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct InstanceView {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub status: InstanceStatus,
    /// "simulated" or "remote".
    pub mode: String,
    pub server_id: Option<String>,
    pub server_ip: Option<String>,
    pub tailscale_ip: Option<String>,
    pub current_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl From<AgentInstance> for InstanceView {
    fn from(inst: AgentInstance) -> Self {
        let (mode, server_id, server_ip, tailscale_ip) = match inst.backing {
            Backing::Simulated => ("simulated", None, None, None),
            Backing::Remote(meta) => (
                "remote",
                Some(meta.server_id),
                Some(meta.server_ip),
                Some(meta.tailscale_ip),
            ),
        };
        InstanceView {
            id: inst.id,
            agent_id: inst.agent_id,
            status: inst.status,
            mode: mode.to_string(),
            server_id,
            server_ip,
            tailscale_ip,
            current_step: inst.current_step,
            started_at: inst.started_at,
            updated_at: inst.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct StatusView {
    pub job: ProvisioningJob,
    pub instance: Option<InstanceView>,
    pub steps: Vec<StepView>,
}

#[utoipa::path(
    post,
    path = "/agents/{agent_id}/provision",
    params(("agent_id" = Uuid, Path, description = "Agent id")),
    request_body = ProvisionRequest,
    responses(
        (status = 201, description = "Job created and workflow dispatched", body = ProvisioningJob),
        (status = 400, description = "Invalid request", body = ErrorBody),
        (status = 404, description = "Unknown agent", body = ErrorBody),
        (status = 409, description = "Job already in flight or agent already provisioned", body = ErrorBody),
        (status = 502, description = "Workflow dispatch rejected", body = ErrorBody)
    )
)]
pub async fn provision_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<Uuid>,
    body: Result<Json<ProvisionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ProvisioningJob>), ApiError> {
    let Json(req) = body.map_err(|e| OrchestratorError::Validation(e.body_text()))?;
    let job =
        provisioning::queue_provisioning(&state, agent_id, &req.region, req.requested_by.as_deref())
            .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

#[utoipa::path(
    get,
    path = "/agents/{agent_id}/provisioning",
    params(("agent_id" = Uuid, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Latest job, instance and step list", body = StatusView),
        (status = 404, description = "No provisioning job for this agent", body = ErrorBody)
    )
)]
pub async fn provisioning_status(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<StatusView>, ApiError> {
    let mut job = state
        .store
        .latest_job_for_agent(agent_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("provisioning job for agent {}", agent_id)))?;

    if !job.status.is_terminal() {
        // Advisory: a failure here must not break the status read.
        match progress::advance(state.store.as_ref(), &job).await {
            Ok(Some(_)) => {
                if let Some(fresh) = state.store.get_job(job.id).await? {
                    job = fresh;
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("[progress] advancing job {} failed: {}", job.id, e),
        }
    }

    let instance = state.store.get_instance(agent_id).await?.map(InstanceView::from);
    let steps = progress::project_steps(
        job.status,
        job.current_step.as_deref(),
        job.failed_step.as_deref(),
    );
    Ok(Json(StatusView { job, instance, steps }))
}

#[utoipa::path(
    post,
    path = "/agents/{agent_id}/start",
    params(("agent_id" = Uuid, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Agent started", body = LifecycleOutcome),
        (status = 409, description = "Precondition failed or concurrent update", body = ErrorBody),
        (status = 502, description = "Provider call failed", body = ErrorBody)
    )
)]
pub async fn start_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<LifecycleOutcome>, ApiError> {
    Ok(Json(lifecycle::start(&state, agent_id).await?))
}

#[utoipa::path(
    post,
    path = "/agents/{agent_id}/stop",
    params(("agent_id" = Uuid, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Agent stopped", body = LifecycleOutcome),
        (status = 409, description = "Precondition failed or concurrent update", body = ErrorBody),
        (status = 502, description = "Provider call failed", body = ErrorBody)
    )
)]
pub async fn stop_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<LifecycleOutcome>, ApiError> {
    Ok(Json(lifecycle::stop(&state, agent_id).await?))
}

#[utoipa::path(
    delete,
    path = "/agents/{agent_id}/instance",
    params(("agent_id" = Uuid, Path, description = "Agent id")),
    responses(
        (status = 200, description = "Instance destroyed", body = LifecycleOutcome),
        (status = 409, description = "Job in flight, precondition failed or concurrent update", body = ErrorBody),
        (status = 502, description = "Provider call failed", body = ErrorBody)
    )
)]
pub async fn destroy_instance(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<Uuid>,
) -> Result<Json<LifecycleOutcome>, ApiError> {
    Ok(Json(lifecycle::destroy(&state, agent_id).await?))
}
