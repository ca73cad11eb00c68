use std::collections::BTreeSet;

use agenthost_common::{InstanceStatus, OrchestratorError};
use serde::Serialize;
use uuid::Uuid;

use crate::app::AppState;
use crate::logger;

/// Instance states a failed attempt still owns.
pub const UNFINISHED: [InstanceStatus; 2] = [InstanceStatus::Pending, InstanceStatus::Provisioning];

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RollbackReport {
    pub job_id: Uuid,
    pub torn_down: Vec<String>,
    pub teardown_errors: Vec<String>,
    pub instance_failed: bool,
    /// A newer attempt owns the agent's rows, so they were left untouched.
    pub superseded: bool,
}

/// Best-effort cleanup after a failed provisioning attempt.
///
/// Teardown errors are collected and logged, never returned. Only a failure
/// to read or write local state surfaces as `Rollback`. Local writes only
/// land while `job_id` is still the agent's latest attempt.
pub async fn run(state: &AppState, job_id: Uuid) -> Result<RollbackReport, OrchestratorError> {
    let job = state
        .store
        .get_job(job_id)
        .await
        .map_err(|e| OrchestratorError::Rollback(e.to_string()))?
        .ok_or_else(|| OrchestratorError::Rollback(format!("job {} not found", job_id)))?;

    let mut report = RollbackReport {
        job_id,
        ..RollbackReport::default()
    };

    let latest = state
        .store
        .latest_job_for_agent(job.agent_id)
        .await
        .map_err(|e| OrchestratorError::Rollback(e.to_string()))?;
    let owns_instance = latest.map(|j| j.id) == Some(job_id);
    let instance = if owns_instance {
        state
            .store
            .get_instance(job.agent_id)
            .await
            .map_err(|e| OrchestratorError::Rollback(e.to_string()))?
    } else {
        None
    };

    // Servers labelled with this job by the workflow, plus whatever the
    // instance row points at if it never reached running.
    let mut targets = BTreeSet::new();
    let listed = tokio::time::timeout(
        state.config.remote_call_timeout,
        state.infra.list_servers_for_job(&job_id.to_string()),
    )
    .await;
    match listed {
        Ok(Ok(servers)) => targets.extend(servers),
        Ok(Err(e)) => {
            tracing::warn!("[rollback] job {}: listing servers failed: {}", job_id, e);
            report.teardown_errors.push(format!("list: {}", e));
        }
        Err(_) => {
            tracing::warn!("[rollback] job {}: listing servers timed out", job_id);
            report.teardown_errors.push("list: timed out".to_string());
        }
    }
    if let Some(inst) = &instance {
        if inst.status != InstanceStatus::Running {
            if let Some(server_id) = inst.backing.server_id() {
                targets.insert(server_id.to_string());
            }
        }
    }

    for server_id in targets {
        let result = tokio::time::timeout(
            state.config.remote_call_timeout,
            state.infra.destroy_server(&server_id),
        )
        .await;
        match result {
            Ok(Ok(())) => {
                tracing::info!("[rollback] job {}: destroyed server {}", job_id, server_id);
                report.torn_down.push(server_id);
            }
            Ok(Err(e)) => {
                tracing::warn!("[rollback] job {}: destroy {} failed: {}", job_id, server_id, e);
                report.teardown_errors.push(format!("{}: {}", server_id, e));
            }
            Err(_) => {
                tracing::warn!("[rollback] job {}: destroy {} timed out", job_id, server_id);
                report
                    .teardown_errors
                    .push(format!("{}: timed out", server_id));
            }
        }
    }

    let cleanup = state
        .store
        .fail_attempt(job_id)
        .await
        .map_err(|e| OrchestratorError::Rollback(e.to_string()))?;
    report.superseded = cleanup.superseded;
    report.instance_failed = cleanup.instance_failed;
    if cleanup.superseded {
        tracing::info!(
            "[rollback] job {}: agent {} has a newer attempt, local state left as is",
            job_id,
            job.agent_id
        );
    } else {
        logger::log_transition(
            "instance",
            job.agent_id,
            &logger::any_of(&UNFINISHED, InstanceStatus::as_str),
            InstanceStatus::Failed.as_str(),
            "rollback",
            cleanup.instance_failed,
        );
    }

    tracing::info!(
        "[rollback] job {} done: {} torn down, {} teardown errors",
        job_id,
        report.torn_down.len(),
        report.teardown_errors.len()
    );
    Ok(report)
}
