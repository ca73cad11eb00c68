//! Callback transition table.
//!
//! `plan` is a pure function of `(current job status, message)`; `apply`
//! turns the outcome into conditional writes. Every write re-checks the
//! status it was planned against, so a callback racing another callback or
//! the heartbeat sweep either wins cleanly or becomes a no-op.

use agenthost_common::{
    AgentStatus, CallbackMessage, CallbackStatus, InstanceStatus, JobStatus, ProvisioningJob,
    ServerMetadata,
};
use chrono::{DateTime, Utc};

use crate::logger;
use crate::store::{JobPatch, Store, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Liveness only: `last_heartbeat_at` moves, status never does.
    TouchHeartbeat,
    /// Plain job status propagation (also used to refresh the run id in place).
    Advance { to: JobStatus, patch: JobPatch },
    /// `running` with full metadata: job, instance and agent in one unit.
    Activate {
        metadata: ServerMetadata,
        workflow_run_id: Option<String>,
    },
    /// Job -> failed; rollback follows when the write lands.
    Fail { patch: JobPatch },
    /// Acknowledged but not applied.
    Ignore(&'static str),
}

pub fn plan(current: JobStatus, msg: &CallbackMessage) -> Outcome {
    if current.is_terminal() {
        return Outcome::Ignore("job is terminal");
    }
    match msg {
        CallbackMessage::Heartbeat => Outcome::TouchHeartbeat,
        CallbackMessage::Status(update) => {
            let run_id = update.workflow_run_id.clone();
            match update.status {
                CallbackStatus::Provisioning => Outcome::Advance {
                    to: JobStatus::Provisioning,
                    patch: JobPatch {
                        workflow_run_id: run_id,
                        ..JobPatch::default()
                    },
                },
                CallbackStatus::Running => match &update.metadata {
                    Some(metadata) => Outcome::Activate {
                        metadata: metadata.clone(),
                        workflow_run_id: run_id,
                    },
                    None => Outcome::Advance {
                        to: JobStatus::Running,
                        patch: JobPatch {
                            workflow_run_id: run_id,
                            ..JobPatch::default()
                        },
                    },
                },
                CallbackStatus::Failed => Outcome::Fail {
                    patch: JobPatch {
                        workflow_run_id: run_id,
                        error: Some(
                            update
                                .error
                                .clone()
                                .unwrap_or_else(|| "provisioning workflow reported failure".to_string()),
                        ),
                        failed_step: update.failed_step.clone(),
                    },
                },
            }
        }
    }
}

fn message_label(msg: &CallbackMessage) -> &'static str {
    match msg {
        CallbackMessage::Heartbeat => "heartbeat",
        CallbackMessage::Status(update) => update.status.as_str(),
    }
}

/// Result of applying one callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub outcome: Outcome,
    /// False when the outcome was `Ignore` or the conditional write lost a race.
    pub applied: bool,
}

impl Applied {
    pub fn needs_rollback(&self) -> bool {
        self.applied && matches!(self.outcome, Outcome::Fail { .. })
    }
}

pub async fn apply(
    store: &dyn Store,
    job: &ProvisioningJob,
    msg: &CallbackMessage,
    now: DateTime<Utc>,
) -> StoreResult<Applied> {
    let outcome = plan(job.status, msg);
    let from = job.status.as_str();

    let applied = match &outcome {
        Outcome::Ignore(why) => {
            logger::log_ignored(job.id, from, message_label(msg), why);
            false
        }
        Outcome::TouchHeartbeat => {
            let touched = store.touch_heartbeat(job.id, now).await?;
            if touched {
                tracing::debug!("[webhook] heartbeat for job {}", job.id);
            } else {
                logger::log_ignored(job.id, from, "heartbeat", "job left the non-terminal states");
            }
            touched
        }
        Outcome::Advance { to, patch } => {
            let ok = store
                .transition_job(job.id, &JobStatus::NON_TERMINAL, *to, patch)
                .await?;
            logger::log_transition("job", job.id, from, to.as_str(), "webhook", ok);
            if ok {
                mirror_instance(store, job, *to).await?;
            }
            ok
        }
        Outcome::Activate {
            metadata,
            workflow_run_id,
        } => {
            let ok = store
                .activate_with_metadata(
                    job.id,
                    &JobStatus::NON_TERMINAL,
                    metadata,
                    workflow_run_id.as_deref(),
                )
                .await?;
            logger::log_transition("job", job.id, from, "running", "webhook_with_metadata", ok);
            if ok {
                tracing::info!(
                    "[webhook] agent {} now backed by server {} ({} / {})",
                    job.agent_id,
                    metadata.server_id,
                    metadata.server_ip,
                    metadata.tailscale_ip
                );
            }
            ok
        }
        Outcome::Fail { patch } => {
            let ok = store
                .transition_job(job.id, &JobStatus::NON_TERMINAL, JobStatus::Failed, patch)
                .await?;
            logger::log_transition("job", job.id, from, "failed", "webhook", ok);
            ok
        }
    };

    Ok(Applied { outcome, applied })
}

/// Keep a simulated instance in step with its job. Never touches server metadata.
async fn mirror_instance(store: &dyn Store, job: &ProvisioningJob, to: JobStatus) -> StoreResult<()> {
    const UNSTARTED: &[InstanceStatus] = &[InstanceStatus::Pending];
    const IN_PROGRESS: &[InstanceStatus] = &[InstanceStatus::Pending, InstanceStatus::Provisioning];

    let (from, target, reason) = match to {
        JobStatus::Provisioning => (UNSTARTED, InstanceStatus::Provisioning, "job_provisioning"),
        JobStatus::Running => (IN_PROGRESS, InstanceStatus::Running, "job_running"),
        JobStatus::Pending | JobStatus::Failed => return Ok(()),
    };

    let ok = store.transition_instance(job.agent_id, from, target).await?;
    logger::log_transition(
        "instance",
        job.agent_id,
        &logger::any_of(from, InstanceStatus::as_str),
        target.as_str(),
        reason,
        ok,
    );
    if ok && target == InstanceStatus::Running {
        store.set_agent_status(job.agent_id, AgentStatus::Active).await?;
    }
    Ok(())
}
