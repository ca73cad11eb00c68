use std::sync::Arc;

use agenthost_common::{JobStatus, OrchestratorError};
use chrono::{DateTime, Utc};

use crate::app::AppState;
use crate::logger;
use crate::rollback;
use crate::store::JobPatch;

const SWEEP_BATCH: i64 = 50;

pub const TIMEOUT_ERROR: &str = "heartbeat timeout";

/// job-heartbeat-sweep: fails non-terminal jobs that went silent and rolls them back.
pub async fn run(state: Arc<AppState>) {
    let mut interval = tokio::time::interval(state.config.sweep_interval);
    tracing::info!(
        "[heartbeat_sweep] started (every {:?}, timeout {:?})",
        state.config.sweep_interval,
        state.config.heartbeat_timeout
    );

    loop {
        interval.tick().await;

        match sweep_once(&state, Utc::now()).await {
            Ok(count) if count > 0 => {
                tracing::info!("[heartbeat_sweep] {} abandoned job(s) failed", count)
            }
            Ok(_) => {}
            Err(e) => tracing::error!("[heartbeat_sweep] error: {}", e),
        }
    }
}

/// One pass. Returns how many jobs this pass moved to `failed`.
pub async fn sweep_once(state: &AppState, now: DateTime<Utc>) -> Result<usize, OrchestratorError> {
    let timeout = chrono::Duration::from_std(state.config.heartbeat_timeout)
        .map_err(|e| OrchestratorError::Validation(format!("heartbeat timeout out of range: {}", e)))?;
    let cutoff = now - timeout;

    let stale = state.store.stale_jobs(cutoff, SWEEP_BATCH).await?;
    let mut failed = 0;

    for job in stale {
        let patch = JobPatch {
            error: Some(TIMEOUT_ERROR.to_string()),
            failed_step: job.current_step.clone(),
            ..JobPatch::default()
        };
        // Only the status read moments ago; a webhook that landed since wins.
        let moved = state
            .store
            .transition_job(job.id, &[job.status], JobStatus::Failed, &patch)
            .await?;
        logger::log_transition("job", job.id, job.status.as_str(), "failed", "heartbeat_timeout", moved);
        if !moved {
            continue;
        }
        failed += 1;

        if let Err(e) = rollback::run(state, job.id).await {
            tracing::error!("[heartbeat_sweep] rollback for job {} failed: {}", job.id, e);
        }
    }

    Ok(failed)
}
