//! start / stop / destroy over an agent's instance.
//!
//! Simulated instances only change local rows. Remote instances call the
//! infrastructure provider first, with a timeout and no lock held, then apply
//! a conditional update; a lost update surfaces as a conflict.

use std::future::Future;

use agenthost_common::{
    AgentInstance, AgentStatus, AuditAction, AuditRecord, Backing, InstanceStatus, OrchestratorError,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::app::AppState;
use crate::store::{InstanceChange, InstanceTarget, LifecycleChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Stop,
    Destroy,
}

impl LifecycleAction {
    fn audit_action(self) -> AuditAction {
        match self {
            LifecycleAction::Start => AuditAction::AgentStarted,
            LifecycleAction::Stop => AuditAction::AgentStopped,
            LifecycleAction::Destroy => AuditAction::AgentDestroyed,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LifecycleAction::Start => "start",
            LifecycleAction::Stop => "stop",
            LifecycleAction::Destroy => "destroy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct LifecycleOutcome {
    pub agent_id: Uuid,
    pub previous_status: AgentStatus,
    pub status: AgentStatus,
    pub had_infrastructure: bool,
}

pub async fn start(state: &AppState, agent_id: Uuid) -> Result<LifecycleOutcome, OrchestratorError> {
    perform(state, agent_id, LifecycleAction::Start).await
}

pub async fn stop(state: &AppState, agent_id: Uuid) -> Result<LifecycleOutcome, OrchestratorError> {
    perform(state, agent_id, LifecycleAction::Stop).await
}

pub async fn destroy(state: &AppState, agent_id: Uuid) -> Result<LifecycleOutcome, OrchestratorError> {
    perform(state, agent_id, LifecycleAction::Destroy).await
}

async fn perform(
    state: &AppState,
    agent_id: Uuid,
    action: LifecycleAction,
) -> Result<LifecycleOutcome, OrchestratorError> {
    let previous = state
        .store
        .get_agent_status(agent_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("agent {}", agent_id)))?;
    let instance = state.store.get_instance(agent_id).await?;
    let backing = instance
        .as_ref()
        .map(|i| i.backing.clone())
        .unwrap_or(Backing::Simulated);

    if action == LifecycleAction::Destroy {
        ensure_no_job_in_flight(state, agent_id).await?;
    }

    let change = match &backing {
        Backing::Simulated => simulated_change(action, previous, instance.as_ref())?,
        Backing::Remote(meta) => {
            let Some(inst) = instance.as_ref() else {
                return Err(OrchestratorError::NotFound(format!("instance for agent {}", agent_id)));
            };
            let change = remote_change(action, inst, &meta.server_id)?;

            let infra = state.infra.as_ref();
            let server_id = meta.server_id.as_str();
            match action {
                LifecycleAction::Start => remote_call(state, action, server_id, infra.start_server(server_id)).await?,
                LifecycleAction::Stop => remote_call(state, action, server_id, infra.stop_server(server_id)).await?,
                LifecycleAction::Destroy => {
                    remote_call(state, action, server_id, infra.destroy_server(server_id)).await?
                }
            }
            change
        }
    };

    let applied = state.store.apply_lifecycle(agent_id, &change).await?;
    if !applied {
        tracing::warn!(
            "[lifecycle] {} for agent {} lost a concurrent update",
            action.as_str(),
            agent_id
        );
        return Err(OrchestratorError::Conflict(format!(
            "agent {} changed while {} was in progress",
            agent_id,
            action.as_str()
        )));
    }

    let record = AuditRecord::agent(action.audit_action(), agent_id, previous, &backing);
    if let Err(e) = state.audit.record(&record).await {
        tracing::warn!("[lifecycle] audit write for agent {} failed: {}", agent_id, e);
    }

    tracing::info!(
        "[lifecycle] {} agent {}: {} -> {} (remote: {})",
        action.as_str(),
        agent_id,
        previous.as_str(),
        change.agent_to.as_str(),
        backing.is_remote()
    );

    Ok(LifecycleOutcome {
        agent_id,
        previous_status: previous,
        status: change.agent_to,
        had_infrastructure: backing.is_remote(),
    })
}

async fn ensure_no_job_in_flight(state: &AppState, agent_id: Uuid) -> Result<(), OrchestratorError> {
    let latest = state.store.latest_job_for_agent(agent_id).await?;
    if let Some(job) = latest {
        if !job.status.is_terminal() {
            return Err(OrchestratorError::Conflict(format!(
                "provisioning job {} is still {}",
                job.id,
                job.status.as_str()
            )));
        }
    }
    Ok(())
}

fn simulated_change(
    action: LifecycleAction,
    agent: AgentStatus,
    instance: Option<&AgentInstance>,
) -> Result<LifecycleChange, OrchestratorError> {
    let optional_instance = |from: Vec<InstanceStatus>, to: InstanceTarget| {
        instance.map(|_| InstanceChange {
            from,
            to,
            server_id: None,
            required: false,
        })
    };

    match action {
        LifecycleAction::Start => {
            if agent != AgentStatus::Paused {
                return Err(OrchestratorError::Precondition("agent is not paused".into()));
            }
            Ok(LifecycleChange {
                agent_from: Some(AgentStatus::Paused),
                agent_to: AgentStatus::Active,
                instance: optional_instance(
                    vec![InstanceStatus::Stopped],
                    InstanceTarget::Status(InstanceStatus::Running),
                ),
                forbid_active_job: false,
            })
        }
        LifecycleAction::Stop => {
            if agent != AgentStatus::Active {
                return Err(OrchestratorError::Precondition("agent is not active".into()));
            }
            Ok(LifecycleChange {
                agent_from: Some(AgentStatus::Active),
                agent_to: AgentStatus::Paused,
                instance: optional_instance(
                    vec![InstanceStatus::Running],
                    InstanceTarget::Status(InstanceStatus::Stopped),
                ),
                forbid_active_job: false,
            })
        }
        LifecycleAction::Destroy => {
            if instance.is_none() && agent == AgentStatus::Draft {
                return Err(OrchestratorError::Precondition("agent has no instance to destroy".into()));
            }
            Ok(LifecycleChange {
                agent_from: Some(agent),
                agent_to: AgentStatus::Draft,
                instance: optional_instance(
                    vec![
                        InstanceStatus::Pending,
                        InstanceStatus::Provisioning,
                        InstanceStatus::Running,
                        InstanceStatus::Stopped,
                        InstanceStatus::Failed,
                    ],
                    InstanceTarget::Delete,
                ),
                forbid_active_job: true,
            })
        }
    }
}

fn remote_change(
    action: LifecycleAction,
    instance: &AgentInstance,
    server_id: &str,
) -> Result<LifecycleChange, OrchestratorError> {
    let (required, from_msg, target, agent_to) = match action {
        LifecycleAction::Start => (
            InstanceStatus::Stopped,
            "instance is not stopped",
            InstanceTarget::Status(InstanceStatus::Running),
            AgentStatus::Active,
        ),
        LifecycleAction::Stop => (
            InstanceStatus::Running,
            "instance is not running",
            InstanceTarget::Status(InstanceStatus::Stopped),
            AgentStatus::Paused,
        ),
        LifecycleAction::Destroy => (
            InstanceStatus::Running,
            "instance is not running",
            InstanceTarget::Delete,
            AgentStatus::Draft,
        ),
    };
    if instance.status != required {
        return Err(OrchestratorError::Precondition(from_msg.into()));
    }
    Ok(LifecycleChange {
        agent_from: None,
        agent_to,
        instance: Some(InstanceChange {
            from: vec![required],
            to: target,
            server_id: Some(server_id.to_string()),
            required: true,
        }),
        forbid_active_job: action == LifecycleAction::Destroy,
    })
}

async fn remote_call<F>(
    state: &AppState,
    action: LifecycleAction,
    server_id: &str,
    call: F,
) -> Result<(), OrchestratorError>
where
    F: Future<Output = anyhow::Result<()>>,
{
    match tokio::time::timeout(state.config.remote_call_timeout, call).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(
                "[lifecycle] {} {} via {} failed: {}",
                action.as_str(),
                server_id,
                state.infra.name(),
                e
            );
            Err(OrchestratorError::RemoteLifecycle(e.to_string()))
        }
        Err(_) => {
            tracing::error!(
                "[lifecycle] {} {} timed out after {:?}",
                action.as_str(),
                server_id,
                state.config.remote_call_timeout
            );
            Err(OrchestratorError::RemoteLifecycle(format!(
                "{} {} timed out after {}s",
                action.as_str(),
                server_id,
                state.config.remote_call_timeout.as_secs()
            )))
        }
    }
}
