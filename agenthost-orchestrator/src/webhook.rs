//! Inbound callbacks from the provisioning workflow.

use agenthost_common::{CallbackPayload, OrchestratorError};
use chrono::Utc;
use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::app::AppState;
use crate::rollback;
use crate::state_machine::{self, Applied};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature-256";

/// Hex HMAC-SHA256 of `body`, as the workflow computes it.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Check `header` against the raw body. Accepts an optional `sha256=` prefix.
/// The digest comparison is constant time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> bool {
    let Some(header) = header.map(str::trim).filter(|h| !h.is_empty()) else {
        return false;
    };
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(provided) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Parse, classify and apply one already-authenticated callback.
///
/// Rollback runs after a landed `failed` transition; its errors are logged
/// and never change the result.
pub async fn process_callback(state: &AppState, body: &[u8]) -> Result<Applied, OrchestratorError> {
    let payload: CallbackPayload = serde_json::from_slice(body)
        .map_err(|e| OrchestratorError::MalformedCallback(format!("invalid JSON body: {}", e)))?;
    let (job_id, message) = payload.into_message()?;

    let job = state
        .store
        .get_job(job_id)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("job {}", job_id)))?;

    let applied = state_machine::apply(state.store.as_ref(), &job, &message, Utc::now()).await?;

    if applied.needs_rollback() {
        match rollback::run(state, job_id).await {
            Ok(report) if !report.teardown_errors.is_empty() => {
                tracing::warn!(
                    "[webhook] job {} rolled back with teardown errors: {:?}",
                    job_id,
                    report.teardown_errors
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!("[webhook] rollback for job {} failed: {}", job_id, e),
        }
    }

    Ok(applied)
}
