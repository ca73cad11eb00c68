use agenthost_common::{
    AgentInstance, AgentStatus, Backing, InstanceStatus, JobStatus, OrchestratorError,
    ProvisioningJob, ServerMetadata,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use super::{
    status_texts, AttemptCleanup, InstanceTarget, JobPatch, LifecycleChange, Store,
    StoreResult,
};

const JOB_COLUMNS: &str = "id, agent_id, region, status, workflow_run_id, current_step, error, \
     failed_step, last_heartbeat_at, requested_by, created_at, updated_at";

const ACTIVE_JOB_EXISTS: &str = "SELECT EXISTS(
        SELECT 1 FROM provisioning_jobs
        WHERE agent_id = $1 AND status IN ('pending', 'provisioning')
    )";

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: Uuid,
    agent_id: Uuid,
    status: InstanceStatus,
    server_id: Option<String>,
    server_ip: Option<String>,
    tailscale_ip: Option<String>,
    current_step: Option<String>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl From<InstanceRow> for AgentInstance {
    fn from(row: InstanceRow) -> Self {
        AgentInstance {
            id: row.id,
            agent_id: row.agent_id,
            status: row.status,
            backing: Backing::from_columns(row.server_id, row.server_ip, row.tailscale_ip),
            current_step: row.current_step,
            started_at: row.started_at,
            updated_at: row.updated_at,
        }
    }
}

fn job_texts(statuses: &[JobStatus]) -> Vec<String> {
    status_texts(statuses, JobStatus::as_str)
}

fn instance_texts(statuses: &[InstanceStatus]) -> Vec<String> {
    status_texts(statuses, InstanceStatus::as_str)
}

/// Postgres-backed store. Uses `query()` rather than `query!()` so builds do
/// not need DATABASE_URL.
#[derive(Clone)]
pub struct PgStore {
    db: Pool<Postgres>,
}

impl PgStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../sqlx-migrations").run(&self.db).await
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_job(&self, job: &ProvisioningJob) -> StoreResult<ProvisioningJob> {
        let mut tx = self.db.begin().await?;

        // Lock the agent row so concurrent requests for the same agent serialize here.
        let agent: Option<AgentStatus> =
            sqlx::query_scalar("SELECT status FROM agents WHERE id = $1 FOR UPDATE")
                .bind(job.agent_id)
                .fetch_optional(&mut *tx)
                .await?;
        if agent.is_none() {
            return Err(OrchestratorError::NotFound(format!("agent {}", job.agent_id)));
        }

        let in_flight: bool = sqlx::query_scalar(ACTIVE_JOB_EXISTS)
            .bind(job.agent_id)
            .fetch_one(&mut *tx)
            .await?;
        if in_flight {
            return Err(OrchestratorError::Conflict(
                "a provisioning job is already in progress for this agent".into(),
            ));
        }

        let existing: Option<Option<String>> =
            sqlx::query_scalar("SELECT server_id FROM agent_instances WHERE agent_id = $1 FOR UPDATE")
                .bind(job.agent_id)
                .fetch_optional(&mut *tx)
                .await?;
        match existing {
            Some(Some(server_id)) => {
                return Err(OrchestratorError::Conflict(format!(
                    "agent already runs on server {}; destroy it first",
                    server_id
                )));
            }
            Some(None) => {
                sqlx::query(
                    "UPDATE agent_instances
                     SET status = 'pending', current_step = NULL, started_at = NULL, updated_at = NOW()
                     WHERE agent_id = $1",
                )
                .bind(job.agent_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO agent_instances (id, agent_id, status, updated_at)
                     VALUES ($1, $2, 'pending', NOW())",
                )
                .bind(Uuid::new_v4())
                .bind(job.agent_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        let insert = sqlx::query(
            "INSERT INTO provisioning_jobs
             (id, agent_id, region, status, requested_by, created_at, updated_at)
             VALUES ($1, $2, $3, 'pending', $4, $5, $5)",
        )
        .bind(job.id)
        .bind(job.agent_id)
        .bind(&job.region)
        .bind(job.requested_by.as_deref())
        .bind(job.created_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            // The partial unique index backs the in-flight check above.
            if let Some(db_err) = e.as_database_error() {
                if db_err.is_unique_violation() {
                    return Err(OrchestratorError::Conflict(
                        "a provisioning job is already in progress for this agent".into(),
                    ));
                }
            }
            return Err(e.into());
        }

        tx.commit().await?;

        self.get_job(job.id)
            .await?
            .ok_or_else(|| OrchestratorError::Store(format!("job {} vanished after insert", job.id)))
    }

    async fn get_job(&self, job_id: Uuid) -> StoreResult<Option<ProvisioningJob>> {
        let job = sqlx::query_as::<_, ProvisioningJob>(&format!(
            "SELECT {} FROM provisioning_jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn latest_job_for_agent(&self, agent_id: Uuid) -> StoreResult<Option<ProvisioningJob>> {
        let job = sqlx::query_as::<_, ProvisioningJob>(&format!(
            "SELECT {} FROM provisioning_jobs WHERE agent_id = $1 ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        ))
        .bind(agent_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(job)
    }

    async fn get_instance(&self, agent_id: Uuid) -> StoreResult<Option<AgentInstance>> {
        let row = sqlx::query_as::<_, InstanceRow>(
            "SELECT id, agent_id, status, server_id, server_ip, tailscale_ip, current_step, started_at, updated_at
             FROM agent_instances WHERE agent_id = $1",
        )
        .bind(agent_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(AgentInstance::from))
    }

    async fn get_agent_status(&self, agent_id: Uuid) -> StoreResult<Option<AgentStatus>> {
        let status = sqlx::query_scalar::<_, AgentStatus>("SELECT status FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.db)
            .await?;
        Ok(status)
    }

    async fn touch_heartbeat(&self, job_id: Uuid, at: DateTime<Utc>) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE provisioning_jobs
             SET last_heartbeat_at = $2
             WHERE id = $1 AND status IN ('pending', 'provisioning')",
        )
        .bind(job_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn transition_job(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        to: JobStatus,
        patch: &JobPatch,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE provisioning_jobs
             SET status = $2,
                 workflow_run_id = COALESCE($3, workflow_run_id),
                 error = COALESCE($4, error),
                 failed_step = COALESCE($5, failed_step),
                 updated_at = NOW()
             WHERE id = $1 AND status::text = ANY($6)",
        )
        .bind(job_id)
        .bind(to)
        .bind(patch.workflow_run_id.as_deref())
        .bind(patch.error.as_deref())
        .bind(patch.failed_step.as_deref())
        .bind(job_texts(from))
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn activate_with_metadata(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        metadata: &ServerMetadata,
        workflow_run_id: Option<&str>,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;

        let agent_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE provisioning_jobs
             SET status = 'running',
                 workflow_run_id = COALESCE($2, workflow_run_id),
                 updated_at = NOW()
             WHERE id = $1 AND status::text = ANY($3)
             RETURNING agent_id",
        )
        .bind(job_id)
        .bind(workflow_run_id)
        .bind(job_texts(from))
        .fetch_optional(&mut *tx)
        .await?;
        let Some(agent_id) = agent_id else {
            return Ok(false);
        };

        // server_id is written exactly once.
        let res = sqlx::query(
            "UPDATE agent_instances
             SET status = 'running',
                 server_id = $2,
                 server_ip = $3,
                 tailscale_ip = $4,
                 started_at = NOW(),
                 updated_at = NOW()
             WHERE agent_id = $1 AND server_id IS NULL",
        )
        .bind(agent_id)
        .bind(&metadata.server_id)
        .bind(&metadata.server_ip)
        .bind(&metadata.tailscale_ip)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Err(OrchestratorError::Conflict(format!(
                "instance for agent {} is missing or already bound to a server",
                agent_id
            )));
        }

        let res = sqlx::query("UPDATE agents SET status = 'active', updated_at = NOW() WHERE id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("agent {}", agent_id)));
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn advance_step(
        &self,
        job_id: Uuid,
        from: &[JobStatus],
        expected_step: Option<&str>,
        step: &str,
    ) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;

        let agent_id: Option<Uuid> = sqlx::query_scalar(
            "UPDATE provisioning_jobs
             SET current_step = $2
             WHERE id = $1
               AND status::text = ANY($3)
               AND current_step IS NOT DISTINCT FROM $4
             RETURNING agent_id",
        )
        .bind(job_id)
        .bind(step)
        .bind(job_texts(from))
        .bind(expected_step)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(agent_id) = agent_id else {
            return Ok(false);
        };

        sqlx::query(
            "UPDATE agent_instances
             SET current_step = $2
             WHERE agent_id = $1 AND status IN ('pending', 'provisioning')",
        )
        .bind(agent_id)
        .bind(step)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn transition_instance(
        &self,
        agent_id: Uuid,
        from: &[InstanceStatus],
        to: InstanceStatus,
    ) -> StoreResult<bool> {
        let res = sqlx::query(
            "UPDATE agent_instances
             SET status = $2, updated_at = NOW()
             WHERE agent_id = $1 AND status::text = ANY($3)",
        )
        .bind(agent_id)
        .bind(to)
        .bind(instance_texts(from))
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_agent_status(&self, agent_id: Uuid, to: AgentStatus) -> StoreResult<bool> {
        let res = sqlx::query("UPDATE agents SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(agent_id)
            .bind(to)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn fail_attempt(&self, job_id: Uuid) -> StoreResult<AttemptCleanup> {
        let mut tx = self.db.begin().await?;

        let job: Option<(Uuid, DateTime<Utc>)> =
            sqlx::query_as("SELECT agent_id, created_at FROM provisioning_jobs WHERE id = $1")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((agent_id, created_at)) = job else {
            return Err(OrchestratorError::NotFound(format!("job {}", job_id)));
        };

        // Same row lock as create_job: no new attempt can start until this commits.
        let agent: Option<AgentStatus> =
            sqlx::query_scalar("SELECT status FROM agents WHERE id = $1 FOR UPDATE")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await?;
        if agent.is_none() {
            return Ok(AttemptCleanup::default());
        }

        let superseded: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM provisioning_jobs
                WHERE agent_id = $1 AND id <> $2 AND created_at > $3
            )",
        )
        .bind(agent_id)
        .bind(job_id)
        .bind(created_at)
        .fetch_one(&mut *tx)
        .await?;
        if superseded {
            return Ok(AttemptCleanup {
                superseded: true,
                instance_failed: false,
            });
        }

        let res = sqlx::query(
            "UPDATE agent_instances
             SET status = 'failed', updated_at = NOW()
             WHERE agent_id = $1 AND status IN ('pending', 'provisioning')",
        )
        .bind(agent_id)
        .execute(&mut *tx)
        .await?;
        let instance_failed = res.rows_affected() > 0;

        sqlx::query("UPDATE agents SET status = 'error', updated_at = NOW() WHERE id = $1")
            .bind(agent_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(AttemptCleanup {
            superseded: false,
            instance_failed,
        })
    }

    async fn apply_lifecycle(&self, agent_id: Uuid, change: &LifecycleChange) -> StoreResult<bool> {
        let mut tx = self.db.begin().await?;

        if change.forbid_active_job {
            let in_flight: bool = sqlx::query_scalar(ACTIVE_JOB_EXISTS)
                .bind(agent_id)
                .fetch_one(&mut *tx)
                .await?;
            if in_flight {
                return Err(OrchestratorError::Conflict(
                    "a provisioning job is in progress for this agent".into(),
                ));
            }
        }

        if let Some(instance) = &change.instance {
            let res = match &instance.to {
                InstanceTarget::Status(to) => {
                    sqlx::query(
                        "UPDATE agent_instances
                         SET status = $2, updated_at = NOW()
                         WHERE agent_id = $1
                           AND status::text = ANY($3)
                           AND server_id IS NOT DISTINCT FROM $4",
                    )
                    .bind(agent_id)
                    .bind(*to)
                    .bind(instance_texts(&instance.from))
                    .bind(instance.server_id.as_deref())
                    .execute(&mut *tx)
                    .await?
                }
                InstanceTarget::Delete => {
                    sqlx::query(
                        "DELETE FROM agent_instances
                         WHERE agent_id = $1
                           AND status::text = ANY($2)
                           AND server_id IS NOT DISTINCT FROM $3",
                    )
                    .bind(agent_id)
                    .bind(instance_texts(&instance.from))
                    .bind(instance.server_id.as_deref())
                    .execute(&mut *tx)
                    .await?
                }
            };
            if instance.required && res.rows_affected() == 0 {
                return Ok(false);
            }
        }

        let res = sqlx::query(
            "UPDATE agents
             SET status = $2, updated_at = NOW()
             WHERE id = $1 AND ($3::text IS NULL OR status::text = $3)",
        )
        .bind(agent_id)
        .bind(change.agent_to)
        .bind(change.agent_from.map(|s| s.as_str()))
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            return Ok(false);
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn stale_jobs(&self, cutoff: DateTime<Utc>, limit: i64) -> StoreResult<Vec<ProvisioningJob>> {
        // GREATEST ignores NULL heartbeats.
        let jobs = sqlx::query_as::<_, ProvisioningJob>(&format!(
            "SELECT {} FROM provisioning_jobs
             WHERE status IN ('pending', 'provisioning')
               AND GREATEST(last_heartbeat_at, updated_at) < $1
             ORDER BY created_at ASC
             LIMIT $2",
            JOB_COLUMNS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.db)
        .await?;
        Ok(jobs)
    }
}
