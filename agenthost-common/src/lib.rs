use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod callback;
pub mod error;

pub use callback::{CallbackMessage, CallbackPayload, CallbackStatus, StatusUpdate};
pub use error::OrchestratorError;

// --- Enums ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,      // Job row created, workflow dispatched
    Provisioning, // Workflow reported it is building the machine
    Running,      // Terminal: machine is up
    Failed,       // Terminal: attempt is over
}

impl JobStatus {
    pub const NON_TERMINAL: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Provisioning];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(JobStatus::Pending),
            "provisioning" => Some(JobStatus::Provisioning),
            "running" => Some(JobStatus::Running),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Failed)
    }

    /// Position along `pending -> provisioning -> {running | failed}`.
    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Provisioning => 1,
            JobStatus::Running | JobStatus::Failed => 2,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Provisioning,
    Running,
    Stopped,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Provisioning => "provisioning",
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Failed => "failed",
        }
    }
}

/// Coarse agent status. The agents table belongs to the dashboard; this
/// service only keeps it in sync with instance transitions.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, utoipa::ToSchema)]
#[sqlx(type_name = "agent_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Draft,
    Active,
    Paused,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Draft => "draft",
            AgentStatus::Active => "active",
            AgentStatus::Paused => "paused",
            AgentStatus::Error => "error",
        }
    }
}

// --- Entities ---

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow, utoipa::ToSchema)]
pub struct ProvisioningJob {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub region: String,
    pub status: JobStatus,
    pub workflow_run_id: Option<String>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub failed_step: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub requested_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProvisioningJob {
    pub fn new(agent_id: Uuid, region: &str, requested_by: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            region: region.trim().to_string(),
            status: JobStatus::Pending,
            workflow_run_id: None,
            current_step: None,
            error: None,
            failed_step: None,
            last_heartbeat_at: None,
            requested_by: requested_by.map(|s| s.to_string()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Addresses reported by the workflow once the server is up.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, utoipa::ToSchema)]
pub struct ServerMetadata {
    pub server_id: String,
    pub server_ip: String,
    pub tailscale_ip: String,
}

/// What backs an agent instance. `Remote` is only ever constructed together
/// with the transition to `running`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum Backing {
    Simulated,
    Remote(ServerMetadata),
}

impl Backing {
    /// Rebuild from nullable columns. Anything short of a full triple is simulated.
    pub fn from_columns(
        server_id: Option<String>,
        server_ip: Option<String>,
        tailscale_ip: Option<String>,
    ) -> Self {
        match (server_id, server_ip, tailscale_ip) {
            (Some(server_id), Some(server_ip), Some(tailscale_ip)) if !server_id.is_empty() => {
                Backing::Remote(ServerMetadata {
                    server_id,
                    server_ip,
                    tailscale_ip,
                })
            }
            _ => Backing::Simulated,
        }
    }

    pub fn server_id(&self) -> Option<&str> {
        match self {
            Backing::Simulated => None,
            Backing::Remote(meta) => Some(meta.server_id.as_str()),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Backing::Remote(_))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AgentInstance {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub status: InstanceStatus,
    #[serde(flatten)]
    pub backing: Backing,
    pub current_step: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl AgentInstance {
    pub fn new(agent_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            status: InstanceStatus::Pending,
            backing: Backing::Simulated,
            current_step: None,
            started_at: None,
            updated_at: Utc::now(),
        }
    }
}

// --- Audit ---

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AgentStarted,
    AgentStopped,
    AgentDestroyed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::AgentStarted => "agent_started",
            AuditAction::AgentStopped => "agent_stopped",
            AuditAction::AgentDestroyed => "agent_destroyed",
        }
    }
}

/// Write-only record handed to the audit collaborator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditRecord {
    pub id: Uuid,
    pub category: String,
    pub action: AuditAction,
    pub agent_id: Uuid,
    pub previous_status: AgentStatus,
    pub had_infrastructure: bool,
    pub server_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn agent(
        action: AuditAction,
        agent_id: Uuid,
        previous_status: AgentStatus,
        backing: &Backing,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            category: "agent".to_string(),
            action,
            agent_id,
            previous_status,
            had_infrastructure: backing.is_remote(),
            server_id: backing.server_id().map(|s| s.to_string()),
            created_at: Utc::now(),
        }
    }

    /// Metadata blob stored alongside the record.
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "previousStatus": self.previous_status.as_str(),
            "hadInfrastructure": self.had_infrastructure,
            "serverId": self.server_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_parse_roundtrip() {
        for s in [
            JobStatus::Pending,
            JobStatus::Provisioning,
            JobStatus::Running,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(s.as_str()), Some(s));
            assert_eq!(JobStatus::parse(&s.as_str().to_uppercase()), Some(s));
        }
        assert_eq!(JobStatus::parse("stopped"), None);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Provisioning.is_terminal());
        assert!(JobStatus::Running.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn backing_requires_full_triple() {
        assert_eq!(
            Backing::from_columns(Some("srv-1".into()), None, Some("100.64.0.1".into())),
            Backing::Simulated
        );
        assert_eq!(
            Backing::from_columns(Some(String::new()), Some("1.2.3.4".into()), Some("100.64.0.1".into())),
            Backing::Simulated
        );
        let remote = Backing::from_columns(
            Some("srv-1".into()),
            Some("1.2.3.4".into()),
            Some("100.64.0.1".into()),
        );
        assert_eq!(remote.server_id(), Some("srv-1"));
        assert!(remote.is_remote());
    }

    #[test]
    fn audit_metadata_carries_infrastructure_flag() {
        let rec = AuditRecord::agent(
            AuditAction::AgentStopped,
            Uuid::new_v4(),
            AgentStatus::Active,
            &Backing::Simulated,
        );
        assert_eq!(rec.category, "agent");
        assert_eq!(rec.metadata()["hadInfrastructure"], false);
        assert_eq!(rec.metadata()["previousStatus"], "active");
    }
}
