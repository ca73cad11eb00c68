use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use agenthost_common::{
    AgentInstance, AgentStatus, Backing, InstanceStatus, JobStatus, OrchestratorError,
    ProvisioningJob, ServerMetadata,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{AttemptCleanup, InstanceTarget, JobPatch, LifecycleChange, Store, StoreResult};

#[derive(Default)]
struct Inner {
    agents: HashMap<Uuid, AgentStatus>,
    /// Keyed by agent id: at most one instance per agent.
    instances: HashMap<Uuid, AgentInstance>,
    jobs: HashMap<Uuid, ProvisioningJob>,
}

impl Inner {
    fn has_active_job(&self, agent_id: Uuid) -> bool {
        self.jobs
            .values()
            .any(|j| j.agent_id == agent_id && !j.status.is_terminal())
    }
}

/// In-process store with the same compare-and-set rules as `PgStore`.
///
/// Multi-row operations stage their changes and only write them back once
/// every check passed, so an injected failure leaves nothing half-applied.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    writes: AtomicUsize,
    fail_agent_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an agent row; the agents table is owned by the dashboard in production.
    pub fn insert_agent(&self, agent_id: Uuid, status: AgentStatus) {
        self.lock().agents.insert(agent_id, status);
    }

    /// Seed an instance row directly.
    pub fn insert_instance(&self, instance: AgentInstance) {
        self.lock().instances.insert(instance.agent_id, instance);
    }

    /// Number of committed mutations so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make every agent status write fail with a store error until cleared.
    pub fn inject_agent_write_failure(&self, enabled: bool) {
        self.fail_agent_writes.store(enabled, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn committed(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn check_agent_write(&self) -> StoreResult<()> {
        if self.fail_agent_writes.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Store("injected agent write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, job: &ProvisioningJob) -> StoreResult<ProvisioningJob> {
        let mut inner = self.lock();
        if !inner.agents.contains_key(&job.agent_id) {
            return Err(OrchestratorError::NotFound(format!("agent {}", job.agent_id)));
        }
        if inner.has_active_job(job.agent_id) {
            return Err(OrchestratorError::Conflict(
                "a provisioning job is already in progress for this agent".into(),
            ));
        }

        let now = Utc::now();
        match inner.instances.get_mut(&job.agent_id) {
            Some(instance) => {
                if let Backing::Remote(meta) = &instance.backing {
                    return Err(OrchestratorError::Conflict(format!(
                        "agent already runs on server {}; destroy it first",
                        meta.server_id
                    )));
                }
                instance.status = InstanceStatus::Pending;
                instance.current_step = None;
                instance.started_at = None;
                instance.updated_at = now;
            }
            None => {
                inner
                    .instances
                    .insert(job.agent_id, AgentInstance::new(job.agent_id));
            }
        }

        let mut stored = job.clone();
        stored.status = JobStatus::Pending;
        inner.jobs.insert(stored.id, stored.clone());
        self.committed();
        Ok(stored)
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<ProvisioningJob>> {
        Ok(self.lock().jobs.get(&job_id).cloned())
    }

    async fn latest_job_for_agent(&self, agent_id: Uuid) -> StoreResult<Option<ProvisioningJob>> {
        Ok(self
            .lock()
            .jobs
            .values()
            .filter(|j| j.agent_id == agent_id)
            .max_by_key(|j| j.created_at)
            .cloned())
    }

    async fn get_instance(&self, agent_id: Uuid) -> StoreResult<Option<AgentInstance>> {
        Ok(self.lock().instances.get(&agent_id).cloned())
    }

    async fn get_agent_status(&self, agent_id: Uuid) -> StoreResult<Option<AgentStatus>> {
        Ok(self.lock().agents.get(&agent_id).copied())
    }

    async fn touch_heartbeat(&self, job_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.last_heartbeat_at = Some(at);
        self.committed();
        Ok(true)
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        patch: &JobPatch,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        job.status = to;
        if let Some(run_id) = &patch.workflow_run_id {
            job.workflow_run_id = Some(run_id.clone());
        }
        if let Some(error) = &patch.error {
            job.error = Some(error.clone());
        }
        if let Some(step) = &patch.failed_step {
            job.failed_step = Some(step.clone());
        }
        job.updated_at = Utc::now();
        self.committed();
        Ok(true)
    }

    async fn activate_with_metadata(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        metadata: &ServerMetadata,
        workflow_run_id: Option<&str>,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get(&job_id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) {
            return Ok(false);
        }
        let agent_id = job.agent_id;

        match inner.instances.get(&agent_id) {
            Some(instance) if !instance.backing.is_remote() => {}
            _ => {
                return Err(OrchestratorError::Conflict(format!(
                    "instance for agent {} is missing or already bound to a server",
                    agent_id
                )))
            }
        }
        if !inner.agents.contains_key(&agent_id) {
            return Err(OrchestratorError::NotFound(format!("agent {}", agent_id)));
        }
        self.check_agent_write()?;

        let now = Utc::now();
        if let Some(job) = inner.jobs.get_mut(&job_id) {
            job.status = JobStatus::Running;
            if let Some(run_id) = workflow_run_id {
                job.workflow_run_id = Some(run_id.to_string());
            }
            job.updated_at = now;
        }
        if let Some(instance) = inner.instances.get_mut(&agent_id) {
            instance.status = InstanceStatus::Running;
            instance.backing = Backing::Remote(metadata.clone());
            instance.started_at = Some(now);
            instance.updated_at = now;
        }
        inner.agents.insert(agent_id, AgentStatus::Active);
        self.committed();
        Ok(true)
    }

    async fn advance_step(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        expected_step: Option<&str>,
        step: &str,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !from.contains(&job.status) || job.current_step.as_deref() != expected_step {
            return Ok(false);
        }
        job.current_step = Some(step.to_string());
        let agent_id = job.agent_id;
        if let Some(instance) = inner.instances.get_mut(&agent_id) {
            if matches!(instance.status, InstanceStatus::Pending | InstanceStatus::Provisioning) {
                instance.current_step = Some(step.to_string());
            }
        }
        self.committed();
        Ok(true)
    }

    async fn transition_instance(
        &self,
        agent_id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StoreResult<bool> {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(&agent_id) else {
            return Ok(false);
        };
        if !from.contains(&instance.status) {
            return Ok(false);
        }
        instance.status = to;
        instance.updated_at = Utc::now();
        self.committed();
        Ok(true)
    }

    async fn set_agent_status(&self, agent_id: Uuid, to: AgentStatus) -> StoreResult<bool> {
        self.check_agent_write()?;
        let mut inner = self.lock();
        let Some(status) = inner.agents.get_mut(&agent_id) else {
            return Ok(false);
        };
        *status = to;
        self.committed();
        Ok(true)
    }

    async fn fail_attempt(&self, job_id: Uuid) -> StoreResult<AttemptCleanup> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get(&job_id) else {
            return Err(OrchestratorError::NotFound(format!("job {}", job_id)));
        };
        let (agent_id, created_at) = (job.agent_id, job.created_at);

        let superseded = inner
            .jobs
            .values()
            .any(|j| j.agent_id == agent_id && j.id != job_id && j.created_at > created_at);
        if superseded {
            return Ok(AttemptCleanup {
                superseded: true,
                instance_failed: false,
            });
        }
        if !inner.agents.contains_key(&agent_id) {
            return Ok(AttemptCleanup::default());
        }
        self.check_agent_write()?;

        let mut instance_failed = false;
        if let Some(instance) = inner.instances.get_mut(&agent_id) {
            if matches!(instance.status, InstanceStatus::Pending | InstanceStatus::Provisioning) {
                instance.status = InstanceStatus::Failed;
                instance.updated_at = Utc::now();
                instance_failed = true;
            }
        }
        inner.agents.insert(agent_id, AgentStatus::Error);
        self.committed();
        Ok(AttemptCleanup {
            superseded: false,
            instance_failed,
        })
    }

    async fn apply_lifecycle(&self, agent_id: Uuid, change: &LifecycleChange) -> StoreResult<bool> {
        let mut inner = self.lock();

        if change.forbid_active_job && inner.has_active_job(agent_id) {
            return Err(OrchestratorError::Conflict(
                "a provisioning job is in progress for this agent".into(),
            ));
        }

        let instance_matches = match (&change.instance, inner.instances.get(&agent_id)) {
            (None, _) => false,
            (Some(_), None) => false,
            (Some(expected), Some(instance)) => {
                expected.from.contains(&instance.status)
                    && expected.server_id.as_deref() == instance.backing.server_id()
            }
        };
        if let Some(expected) = &change.instance {
            if expected.required && !instance_matches {
                return Ok(false);
            }
        }

        match inner.agents.get(&agent_id) {
            None => return Ok(false),
            Some(current) => {
                if let Some(from) = change.agent_from {
                    if *current != from {
                        return Ok(false);
                    }
                }
            }
        }
        self.check_agent_write()?;

        if let (Some(expected), true) = (&change.instance, instance_matches) {
            match &expected.to {
                InstanceTarget::Status(to) => {
                    if let Some(instance) = inner.instances.get_mut(&agent_id) {
                        instance.status = *to;
                        instance.updated_at = Utc::now();
                    }
                }
                InstanceTarget::Delete => {
                    inner.instances.remove(&agent_id);
                }
            }
        }
        inner.agents.insert(agent_id, change.agent_to);
        self.committed();
        Ok(true)
    }

    async fn stale_jobs(&self, cutoff: DateTime<Utc>, limit: i64) -> StoreResult<Vec<ProvisioningJob>> {
        let inner = self.lock();
        let mut stale: Vec<ProvisioningJob> = inner
            .jobs
            .values()
            .filter(|j| !j.status.is_terminal())
            .filter(|j| {
                let last_seen = match j.last_heartbeat_at {
                    Some(hb) => hb.max(j.updated_at),
                    None => j.updated_at,
                };
                last_seen < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|j| j.created_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }
}
