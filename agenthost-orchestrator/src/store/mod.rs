//! Job store: the only source of truth for provisioning state.
//!
//! Every mutating method is a compare-and-set. It returns `Ok(false)` when the
//! row was not in one of the expected states, which callers treat as "someone
//! else already moved it" rather than as an error.

use agenthost_common::{
    AgentInstance, AgentStatus, InstanceStatus, JobStatus, OrchestratorError, ProvisioningJob,
    ServerMetadata,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub type StoreResult<T> = Result<T, OrchestratorError>;

/// Optional fields carried by a job status change. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub workflow_run_id: Option<String>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstanceTarget {
    Status(InstanceStatus),
    /// Remove the row. The only path that clears server metadata.
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceChange {
    pub from: Vec<InstanceStatus>,
    pub to: InstanceTarget,
    /// Expected server binding; `None` matches only simulated rows.
    pub server_id: Option<String>,
    /// Abort the whole change when no instance row matches.
    pub required: bool,
}

/// Agent + instance update applied as one unit by lifecycle actions.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleChange {
    /// Expected agent status; `None` skips the agent-side check.
    pub agent_from: Option<AgentStatus>,
    pub agent_to: AgentStatus,
    pub instance: Option<InstanceChange>,
    /// Refuse with a conflict while a provisioning attempt is in flight.
    pub forbid_active_job: bool,
}

/// What `fail_attempt` did to the agent's rows.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AttemptCleanup {
    /// A newer job owns the agent's rows; nothing was written.
    pub superseded: bool,
    pub instance_failed: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a pending job and create (or reset) the agent's instance row.
    ///
    /// Fails with `Conflict` when the agent already has a non-terminal job or
    /// an instance bound to real infrastructure, `NotFound` for unknown agents.
    async fn create_job(&self, job: &ProvisioningJob) -> StoreResult<ProvisioningJob>;

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<ProvisioningJob>>;

    async fn latest_job_for_agent(&self, agent_id: Uuid) -> StoreResult<Option<ProvisioningJob>>;

    async fn get_instance(&self, agent_id: Uuid) -> StoreResult<Option<AgentInstance>>;

    async fn get_agent_status(&self, agent_id: Uuid) -> StoreResult<Option<AgentStatus>>;

    /// Set `last_heartbeat_at` on a non-terminal job. Status is never touched.
    async fn touch_heartbeat(&self, job_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool>;

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        patch: &JobPatch,
    ) -> StoreResult<bool>;

    /// Job -> running, instance bound to `metadata` and running, agent active.
    /// All three writes commit together or not at all.
    async fn activate_with_metadata(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        metadata: &ServerMetadata,
        workflow_run_id: Option<&str>,
    ) -> StoreResult<bool>;

    /// Advisory display label, conditional on both the job status and the
    /// label read by the caller. Does not bump `updated_at`, so polling never
    /// keeps an abandoned job alive.
    async fn advance_step(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        expected_step: Option<&str>,
        step: &str,
    ) -> StoreResult<bool>;

    async fn transition_instance(
        &self,
        agent_id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StoreResult<bool>;

    async fn set_agent_status(&self, agent_id: Uuid, to: AgentStatus) -> StoreResult<bool>;

    /// Instance (pending/provisioning) -> failed and agent -> error, as one
    /// unit, only while `job_id` is still the agent's latest job.
    async fn fail_attempt(&self, job_id: Uuid) -> StoreResult<AttemptCleanup>;

    async fn apply_lifecycle(&self, agent_id: Uuid, change: &LifecycleChange) -> StoreResult<bool>;

    /// Non-terminal jobs whose last sign of life (heartbeat or authoritative
    /// write) is older than `cutoff`.
    async fn stale_jobs(&self, cutoff: DateTime<Utc>, limit: i64) -> StoreResult<Vec<ProvisioningJob>>;
}

pub(crate) fn status_texts<S, F>(statuses: &[S], f: F) -> Vec<String>
where
    F: Fn(&S) -> &'static str,
{
    statuses.iter().map(|s| f(s).to_string()).collect()
}
