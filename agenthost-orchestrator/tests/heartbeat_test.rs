// Integration tests for the heartbeat-timeout sweep.

mod common;

use agenthost_common::{AgentStatus, InstanceStatus, JobStatus};
use agenthost_orchestrator::heartbeat_job::{self, TIMEOUT_ERROR};
use agenthost_orchestrator::store::Store;
use chrono::{Duration, Utc};
use common::{send_callback, TestContext};
use serde_json::json;

#[tokio::test]
async fn test_silent_job_is_failed_and_rolled_back() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;
    // Poll once so the job carries a step label.
    server.get(&format!("/agents/{}/provisioning", agent_id)).await;
    ctx.infra.register_job_server(&job.id.to_string(), "srv-half-built");

    // Not stale yet.
    assert_eq!(heartbeat_job::sweep_once(&ctx.state, Utc::now()).await.unwrap(), 0);

    let later = Utc::now() + Duration::seconds(901);
    assert_eq!(heartbeat_job::sweep_once(&ctx.state, later).await.unwrap(), 1);

    let failed = ctx.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some(TIMEOUT_ERROR));
    assert_eq!(failed.failed_step.as_deref(), Some("queued"));

    assert!(ctx
        .infra
        .calls()
        .iter()
        .any(|c| c.op == "destroy" && c.target == "srv-half-built"));
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Error);

    // A second pass finds nothing.
    assert_eq!(heartbeat_job::sweep_once(&ctx.state, later).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recent_heartbeat_keeps_job_alive() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    let now = Utc::now();
    ctx.store
        .touch_heartbeat(job.id, now + Duration::seconds(600))
        .await
        .unwrap();

    // 15 minutes after creation but only 5 after the last heartbeat.
    let later = now + Duration::seconds(901);
    assert_eq!(heartbeat_job::sweep_once(&ctx.state, later).await.unwrap(), 0);
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_terminal_jobs_are_never_swept() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let (_, job) = ctx.provision_remote(&server).await;

    let later = Utc::now() + Duration::hours(2);
    assert_eq!(heartbeat_job::sweep_once(&ctx.state, later).await.unwrap(), 0);
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Running);
    assert!(ctx.infra.calls().is_empty());
}

#[tokio::test]
async fn test_late_success_after_timeout_is_ignored() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    let later = Utc::now() + Duration::seconds(1000);
    heartbeat_job::sweep_once(&ctx.state, later).await.unwrap();

    let resp = send_callback(
        &server,
        json!({
            "job_id": job.id,
            "status": "running",
            "server_id": "srv-1",
            "server_ip": "1.2.3.4",
            "tailscale_ip": "100.64.0.1"
        }),
    )
    .await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Failed);
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert!(!instance.backing.is_remote());
}
