// Shared helpers for the integration tests. Everything runs in-process:
// MemoryStore plus the recording mock providers, no database or network.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use agenthost_common::{AgentStatus, JobStatus, ProvisioningJob, ServerMetadata};
use agenthost_orchestrator::app::AppState;
use agenthost_orchestrator::audit::MemoryAuditSink;
use agenthost_orchestrator::config::Config;
use agenthost_orchestrator::store::{MemoryStore, Store};
use agenthost_orchestrator::{build_app, webhook};
use agenthost_providers::mock::{MockDispatcher, MockInfraProvider};
use axum_test::{TestResponse, TestServer};
use uuid::Uuid;

pub const SECRET: &str = "whsec_integration";

pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub dispatcher: Arc<MockDispatcher>,
    pub infra: Arc<MockInfraProvider>,
    pub state: Arc<AppState>,
}

pub fn test_config() -> Config {
    let mut config = Config::from_lookup(|key| match key {
        "STORE" => Some("memory".to_string()),
        "WEBHOOK_SECRET" => Some(SECRET.to_string()),
        "PUBLIC_BASE_URL" => Some("https://orchestrator.test".to_string()),
        _ => None,
    })
    .unwrap();
    config.remote_call_timeout = Duration::from_millis(200);
    config
}

impl TestContext {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let dispatcher = Arc::new(MockDispatcher::new());
        let infra = Arc::new(MockInfraProvider::new());
        let state = AppState::new(
            store.clone(),
            audit.clone(),
            dispatcher.clone(),
            infra.clone(),
            test_config(),
        );
        Self {
            store,
            audit,
            dispatcher,
            infra,
            state,
        }
    }

    pub fn server(&self) -> TestServer {
        TestServer::new(build_app(self.state.clone())).unwrap()
    }

    pub fn agent(&self, status: AgentStatus) -> Uuid {
        let id = Uuid::new_v4();
        self.store.insert_agent(id, status);
        id
    }

    pub async fn job(&self, job_id: Uuid) -> ProvisioningJob {
        self.store.get_job(job_id).await.unwrap().unwrap()
    }

    pub async fn agent_status(&self, agent_id: Uuid) -> AgentStatus {
        self.store.get_agent_status(agent_id).await.unwrap().unwrap()
    }

    /// Queue a job through the HTTP surface and return it.
    pub async fn provision(&self, server: &TestServer, agent_id: Uuid) -> ProvisioningJob {
        let resp = server
            .post(&format!("/agents/{}/provision", agent_id))
            .json(&serde_json::json!({"region": "us-east", "requested_by": "user-1"}))
            .await;
        assert_eq!(resp.status_code(), 201, "{}", resp.text());
        let job: ProvisioningJob = resp.json();
        assert_eq!(job.status, JobStatus::Pending);
        job
    }

    /// Drive an agent all the way to a running remote instance.
    pub async fn provision_remote(&self, server: &TestServer) -> (Uuid, ProvisioningJob) {
        let agent_id = self.agent(AgentStatus::Draft);
        let job = self.provision(server, agent_id).await;
        let resp = send_callback(
            server,
            serde_json::json!({
                "job_id": job.id,
                "status": "running",
                "server_id": "srv-1",
                "server_ip": "1.2.3.4",
                "tailscale_ip": "100.64.0.1"
            }),
        )
        .await;
        assert_eq!(resp.status_code(), 200);
        (agent_id, job)
    }
}

pub fn sign(body: &[u8]) -> String {
    webhook::sign(SECRET.as_bytes(), body).unwrap()
}

/// POST a correctly signed callback.
pub async fn send_callback(server: &TestServer, body: serde_json::Value) -> TestResponse {
    let raw = serde_json::to_vec(&body).unwrap();
    send_raw_callback(server, &raw, Some(sign(&raw))).await
}

pub async fn send_raw_callback(server: &TestServer, raw: &[u8], signature: Option<String>) -> TestResponse {
    let mut req = server
        .post("/webhooks/provisioning")
        .content_type("application/json")
        .bytes(raw.to_vec().into());
    if let Some(sig) = signature {
        req = req.add_header("X-Signature-256", sig);
    }
    req.await
}

pub fn srv1() -> ServerMetadata {
    ServerMetadata {
        server_id: "srv-1".into(),
        server_ip: "1.2.3.4".into(),
        tailscale_ip: "100.64.0.1".into(),
    }
}
