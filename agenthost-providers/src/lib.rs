use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub mod github;
pub mod hetzner;

#[cfg(feature = "mock")]
pub mod mock;

/// Inputs handed to the external provisioning workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchRequest {
    pub job_id: String,
    pub agent_id: String,
    pub region: String,
    /// Where the workflow must send every heartbeat and status update for this job.
    pub callback_url: String,
}

/// Starts the external provisioning workflow.
///
/// Implementations make exactly one outbound call and never retry: a duplicate
/// dispatch would create a duplicate server.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn dispatch(&self, request: &DispatchRequest) -> Result<()>;
}

/// Remote server operations used by lifecycle actions and rollback.
#[async_trait]
pub trait InfraProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start_server(&self, server_id: &str) -> Result<()>;

    async fn stop_server(&self, server_id: &str) -> Result<()>;

    /// Deleting a server that no longer exists is a success.
    async fn destroy_server(&self, server_id: &str) -> Result<()>;

    // Optional: servers the workflow tagged with this job before it reported back.
    // Default implementation knows of none.
    async fn list_servers_for_job(&self, _job_id: &str) -> Result<Vec<String>> {
        Ok(vec![])
    }
}
