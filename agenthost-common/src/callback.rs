use serde::Deserialize;
use uuid::Uuid;

use crate::{OrchestratorError, ServerMetadata};

/// Raw webhook body as sent by the provisioning workflow.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct CallbackPayload {
    pub job_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
    pub workflow_run_id: Option<String>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub server_id: Option<String>,
    pub server_ip: Option<String>,
    pub tailscale_ip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Provisioning,
    Running,
    Failed,
}

impl CallbackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Provisioning => "provisioning",
            CallbackStatus::Running => "running",
            CallbackStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: CallbackStatus,
    pub workflow_run_id: Option<String>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    /// Present only when all three address fields were sent.
    pub metadata: Option<ServerMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackMessage {
    Heartbeat,
    Status(StatusUpdate),
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

impl CallbackPayload {
    /// Validate the correlation id and classify the message shape.
    pub fn into_message(self) -> Result<(Uuid, CallbackMessage), OrchestratorError> {
        let Some(raw_job_id) = non_empty(self.job_id) else {
            return Err(OrchestratorError::MalformedCallback("missing job_id".into()));
        };
        let job_id = Uuid::parse_str(&raw_job_id).map_err(|_| {
            OrchestratorError::MalformedCallback(format!("job_id '{}' is not a valid id", raw_job_id))
        })?;

        match non_empty(self.kind).map(|k| k.to_ascii_lowercase()).as_deref() {
            Some("heartbeat") => return Ok((job_id, CallbackMessage::Heartbeat)),
            Some(other) => {
                return Err(OrchestratorError::MalformedCallback(format!(
                    "unknown callback type '{}'",
                    other
                )))
            }
            None => {}
        }

        let Some(raw_status) = non_empty(self.status) else {
            return Err(OrchestratorError::MalformedCallback(
                "neither type nor status present".into(),
            ));
        };
        let status = match raw_status.to_ascii_lowercase().as_str() {
            "provisioning" => CallbackStatus::Provisioning,
            "running" => CallbackStatus::Running,
            "failed" => CallbackStatus::Failed,
            other => {
                return Err(OrchestratorError::MalformedCallback(format!(
                    "unknown status '{}'",
                    other
                )))
            }
        };

        let metadata = match (
            non_empty(self.server_id),
            non_empty(self.server_ip),
            non_empty(self.tailscale_ip),
        ) {
            (Some(server_id), Some(server_ip), Some(tailscale_ip)) => Some(ServerMetadata {
                server_id,
                server_ip,
                tailscale_ip,
            }),
            _ => None,
        };

        Ok((
            job_id,
            CallbackMessage::Status(StatusUpdate {
                status,
                workflow_run_id: non_empty(self.workflow_run_id),
                error: non_empty(self.error),
                failed_step: non_empty(self.failed_step),
                metadata,
            }),
        ))
    }
}
