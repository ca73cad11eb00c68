use agenthost_common::{InstanceStatus, JobStatus, OrchestratorError, ProvisioningJob};
use agenthost_providers::DispatchRequest;
use uuid::Uuid;

use crate::app::AppState;
use crate::logger;
use crate::rollback::UNFINISHED;
use crate::store::JobPatch;

/// Create a pending job for `agent_id` and fire the provisioning workflow.
///
/// A rejected dispatch fails the job on the spot (`failed_step = "dispatch"`),
/// marks the instance failed and the agent `error` unless a newer attempt
/// already took over, then returns `Dispatch`.
pub async fn queue_provisioning(
    state: &AppState,
    agent_id: Uuid,
    region: &str,
    requested_by: Option<&str>,
) -> Result<ProvisioningJob, OrchestratorError> {
    if region.trim().is_empty() {
        return Err(OrchestratorError::Validation("region must not be empty".into()));
    }

    let job = state
        .store
        .create_job(&ProvisioningJob::new(agent_id, region, requested_by))
        .await?;
    tracing::info!(
        "[provisioning] job {} queued for agent {} in {}",
        job.id,
        agent_id,
        job.region
    );

    let request = DispatchRequest {
        job_id: job.id.to_string(),
        agent_id: agent_id.to_string(),
        region: job.region.clone(),
        callback_url: state.config.callback_url(),
    };

    let Err(e) = state.dispatcher.dispatch(&request).await else {
        tracing::info!(
            "[provisioning] job {} dispatched via {}",
            job.id,
            state.dispatcher.name()
        );
        return Ok(job);
    };

    let message = e.to_string();
    tracing::error!("[provisioning] dispatch for job {} failed: {}", job.id, message);

    let patch = JobPatch {
        error: Some(message.clone()),
        failed_step: Some("dispatch".to_string()),
        ..JobPatch::default()
    };
    let failed = state
        .store
        .transition_job(job.id, &JobStatus::NON_TERMINAL, JobStatus::Failed, &patch)
        .await?;
    logger::log_transition(
        "job",
        job.id,
        &logger::any_of(&JobStatus::NON_TERMINAL, JobStatus::as_str),
        JobStatus::Failed.as_str(),
        "dispatch_failed",
        failed,
    );

    // A callback may already have moved the job; its own handling owns the rest.
    if failed {
        let cleanup = state.store.fail_attempt(job.id).await?;
        if !cleanup.superseded {
            logger::log_transition(
                "instance",
                agent_id,
                &logger::any_of(&UNFINISHED, InstanceStatus::as_str),
                InstanceStatus::Failed.as_str(),
                "dispatch_failed",
                cleanup.instance_failed,
            );
        }
    }

    Err(OrchestratorError::Dispatch(message))
}
