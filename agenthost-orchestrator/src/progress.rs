//! Advisory progress shown to the dashboard between webhook callbacks.
//!
//! The label is estimated from time since the job was created. It is only
//! ever written while the job is non-terminal, never moves backward, and
//! never touches status or server metadata.

use agenthost_common::{JobStatus, ProvisioningJob};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::logger;
use crate::store::{Store, StoreResult};

pub struct Step {
    pub key: &'static str,
    pub label: &'static str,
    /// Minimum seconds since job creation before this step is shown.
    pub after_secs: i64,
}

pub const STEPS: &[Step] = &[
    Step { key: "queued", label: "Queued", after_secs: 0 },
    Step { key: "dispatching", label: "Dispatching workflow", after_secs: 5 },
    Step { key: "creating_server", label: "Creating server", after_secs: 20 },
    Step { key: "installing_runtime", label: "Installing agent runtime", after_secs: 60 },
    Step { key: "joining_network", label: "Joining private network", after_secs: 150 },
    Step { key: "starting_agent", label: "Starting agent", after_secs: 240 },
];

/// Shown as the last entry of every projection; only reached by a `running` callback.
pub const READY_STEP: (&str, &str) = ("ready", "Agent ready");

pub fn step_for_elapsed(elapsed_secs: i64) -> &'static str {
    STEPS
        .iter()
        .rev()
        .find(|s| elapsed_secs >= s.after_secs)
        .map(|s| s.key)
        .unwrap_or(STEPS[0].key)
}

fn step_index(key: &str) -> Option<usize> {
    // The dispatcher reports its own failure as "dispatch".
    let key = if key == "dispatch" { "dispatching" } else { key };
    STEPS.iter().position(|s| s.key == key)
}

/// Advance `current_step` for a polled job. Returns the step written, if any.
///
/// A lost compare-and-set means a webhook or another poll moved the job
/// first; that is not an error.
pub async fn advance_at(
    store: &dyn Store,
    job: &ProvisioningJob,
    now: DateTime<Utc>,
) -> StoreResult<Option<&'static str>> {
    if job.status.is_terminal() {
        return Ok(None);
    }
    let elapsed = (now - job.created_at).num_seconds().max(0);
    let target = step_for_elapsed(elapsed);

    let current_idx = job.current_step.as_deref().and_then(step_index);
    let target_idx = step_index(target);
    if let (Some(current), Some(target)) = (current_idx, target_idx) {
        if target <= current {
            return Ok(None);
        }
    }

    let written = store
        .advance_step(
            job.id,
            &JobStatus::NON_TERMINAL,
            job.current_step.as_deref(),
            target,
        )
        .await?;
    if !written {
        logger::log_transition(
            "job_step",
            job.id,
            job.current_step.as_deref().unwrap_or("none"),
            target,
            "progress_poll",
            false,
        );
        return Ok(None);
    }
    tracing::debug!("[progress] job {} step -> {}", job.id, target);
    Ok(Some(target))
}

pub async fn advance(store: &dyn Store, job: &ProvisioningJob) -> StoreResult<Option<&'static str>> {
    advance_at(store, job, Utc::now()).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum StepState {
    Done,
    Active,
    Pending,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct StepView {
    pub key: String,
    pub label: String,
    pub state: StepState,
}

/// Ordered step list with completion state. Pure function of the job row.
pub fn project_steps(
    status: JobStatus,
    current_step: Option<&str>,
    failed_step: Option<&str>,
) -> Vec<StepView> {
    let current_idx = current_step.and_then(step_index).unwrap_or(0);
    let failed_idx = failed_step.and_then(step_index).unwrap_or(current_idx);

    let state_at = |i: usize| -> StepState {
        match status {
            JobStatus::Running => StepState::Done,
            JobStatus::Failed if i < failed_idx => StepState::Done,
            JobStatus::Failed if i == failed_idx => StepState::Failed,
            JobStatus::Failed => StepState::Pending,
            JobStatus::Pending | JobStatus::Provisioning if i < current_idx => StepState::Done,
            JobStatus::Pending | JobStatus::Provisioning if i == current_idx => StepState::Active,
            JobStatus::Pending | JobStatus::Provisioning => StepState::Pending,
        }
    };

    let mut steps: Vec<StepView> = STEPS
        .iter()
        .enumerate()
        .map(|(i, s)| StepView {
            key: s.key.to_string(),
            label: s.label.to_string(),
            state: state_at(i),
        })
        .collect();
    steps.push(StepView {
        key: READY_STEP.0.to_string(),
        label: READY_STEP.1.to_string(),
        state: if status == JobStatus::Running {
            StepState::Done
        } else {
            StepState::Pending
        },
    });
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use agenthost_common::AgentStatus;
    use chrono::Duration;
    use uuid::Uuid;

    #[test]
    fn thresholds() {
        assert_eq!(step_for_elapsed(0), "queued");
        assert_eq!(step_for_elapsed(4), "queued");
        assert_eq!(step_for_elapsed(5), "dispatching");
        assert_eq!(step_for_elapsed(59), "creating_server");
        assert_eq!(step_for_elapsed(150), "joining_network");
        assert_eq!(step_for_elapsed(10_000), "starting_agent");
    }

    #[test]
    fn running_projection_is_all_done() {
        let steps = project_steps(JobStatus::Running, Some("joining_network"), None);
        assert!(steps.iter().all(|s| s.state == StepState::Done));
        assert_eq!(steps.last().map(|s| s.key.as_str()), Some("ready"));
    }

    #[test]
    fn provisioning_projection_marks_active_step() {
        let steps = project_steps(JobStatus::Provisioning, Some("creating_server"), None);
        let states: Vec<StepState> = steps.iter().map(|s| s.state).collect();
        assert_eq!(
            states,
            vec![
                StepState::Done,
                StepState::Done,
                StepState::Active,
                StepState::Pending,
                StepState::Pending,
                StepState::Pending,
                StepState::Pending,
            ]
        );
    }

    #[test]
    fn failed_projection_uses_failed_step() {
        let steps = project_steps(JobStatus::Failed, Some("joining_network"), Some("dispatch"));
        assert_eq!(steps[0].state, StepState::Done);
        assert_eq!(steps[1].state, StepState::Failed);
        assert_eq!(steps[2].state, StepState::Pending);

        // Unknown failed_step label falls back to the last displayed step.
        let steps = project_steps(JobStatus::Failed, Some("installing_runtime"), Some("ansible"));
        assert_eq!(steps[3].state, StepState::Failed);
    }

    async fn job_created_ago(secs: i64) -> (MemoryStore, ProvisioningJob) {
        let store = MemoryStore::new();
        let agent_id = Uuid::new_v4();
        store.insert_agent(agent_id, AgentStatus::Draft);
        let mut job = ProvisioningJob::new(agent_id, "us-east", None);
        job.created_at = Utc::now() - Duration::seconds(secs);
        let job = store.create_job(&job).await.unwrap();
        (store, job)
    }

    #[tokio::test]
    async fn advances_and_mirrors_instance() {
        let (store, job) = job_created_ago(30).await;
        let written = advance(&store, &job).await.unwrap();
        assert_eq!(written, Some("creating_server"));

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.current_step.as_deref(), Some("creating_server"));
        let instance = store.get_instance(job.agent_id).await.unwrap().unwrap();
        assert_eq!(instance.current_step.as_deref(), Some("creating_server"));
    }

    #[tokio::test]
    async fn never_downgrades() {
        let (store, job) = job_created_ago(200).await;
        advance(&store, &job).await.unwrap();
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.current_step.as_deref(), Some("joining_network"));

        // A poll computed against an earlier clock must not move it back.
        let earlier = job.created_at + Duration::seconds(30);
        assert_eq!(advance_at(&store, &job, earlier).await.unwrap(), None);
        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.current_step.as_deref(), Some("joining_network"));
    }

    #[tokio::test]
    async fn stale_snapshot_loses_the_race() {
        let (store, job) = job_created_ago(70).await;
        let snapshot = job.clone();
        advance(&store, &job).await.unwrap();
        let writes = store.write_count();

        // Same snapshot (current_step None) from a second poller.
        assert_eq!(advance(&store, &snapshot).await.unwrap(), None);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn terminal_job_is_a_strict_no_op() {
        let (store, job) = job_created_ago(100).await;
        store
            .transition_job(
                job.id,
                &JobStatus::NON_TERMINAL,
                JobStatus::Failed,
                &crate::store::JobPatch::default(),
            )
            .await
            .unwrap();
        let writes = store.write_count();

        // Even a stale non-terminal snapshot cannot write once the row is terminal.
        assert_eq!(advance(&store, &job).await.unwrap(), None);
        let failed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(advance(&store, &failed).await.unwrap(), None);
        assert_eq!(store.write_count(), writes);
        assert_eq!(failed.current_step, None);
    }
}
