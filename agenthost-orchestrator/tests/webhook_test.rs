// Integration tests for the provisioning webhook receiver.

mod common;

use std::time::Duration;

use agenthost_common::{AgentStatus, Backing, InstanceStatus, JobStatus};
use agenthost_orchestrator::store::Store;
use agenthost_orchestrator::{provisioning, rollback};
use common::{send_callback, send_raw_callback, sign, srv1, TestContext};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn test_full_provisioning_scenario() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);

    let job = ctx.provision(&server, agent_id).await;
    let calls = ctx.dispatcher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].job_id, job.id.to_string());
    assert_eq!(calls[0].region, "us-east");
    assert_eq!(calls[0].callback_url, "https://orchestrator.test/webhooks/provisioning");

    // Heartbeat: liveness only.
    let resp = send_callback(&server, json!({"job_id": job.id, "type": "heartbeat"})).await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.json::<serde_json::Value>(), json!({"received": true}));
    let after_hb = ctx.job(job.id).await;
    assert!(after_hb.last_heartbeat_at.is_some());
    assert_eq!(after_hb.status, JobStatus::Pending);

    // Running with full metadata: job, instance and agent together.
    let resp = send_callback(
        &server,
        json!({
            "job_id": job.id,
            "status": "running",
            "workflow_run_id": "123456",
            "server_id": "srv-1",
            "server_ip": "1.2.3.4",
            "tailscale_ip": "100.64.0.1"
        }),
    )
    .await;
    assert_eq!(resp.status_code(), 200);

    let done = ctx.job(job.id).await;
    assert_eq!(done.status, JobStatus::Running);
    assert_eq!(done.workflow_run_id.as_deref(), Some("123456"));
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.backing, Backing::Remote(srv1()));
    assert!(instance.started_at.is_some());
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Active);
}

#[tokio::test]
async fn test_provisioning_update_mirrors_instance() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    let resp = send_callback(
        &server,
        json!({"job_id": job.id, "status": "provisioning", "workflow_run_id": "77"}),
    )
    .await;
    assert_eq!(resp.status_code(), 200);

    let job = ctx.job(job.id).await;
    assert_eq!(job.status, JobStatus::Provisioning);
    assert_eq!(job.workflow_run_id.as_deref(), Some("77"));
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Provisioning);
    assert_eq!(instance.backing, Backing::Simulated);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_before_parsing() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;
    let writes = ctx.store.write_count();

    let raw = serde_json::to_vec(&json!({"job_id": job.id, "status": "failed"})).unwrap();

    let resp = send_raw_callback(&server, &raw, None).await;
    assert_eq!(resp.status_code(), 401);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "invalid_signature");

    let resp = send_raw_callback(&server, &raw, Some("sha256=deadbeef".to_string())).await;
    assert_eq!(resp.status_code(), 401);

    // Garbage body with no valid signature is still a 401, not a 400.
    let resp = send_raw_callback(&server, b"{not json", Some(sign(b"other"))).await;
    assert_eq!(resp.status_code(), 401);

    assert_eq!(ctx.store.write_count(), writes);
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Pending);
}

#[tokio::test]
async fn test_prefixed_signature_is_accepted() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    let raw = serde_json::to_vec(&json!({"job_id": job.id, "type": "heartbeat"})).unwrap();
    let resp = send_raw_callback(&server, &raw, Some(format!("sha256={}", sign(&raw)))).await;
    assert_eq!(resp.status_code(), 200);
}

#[tokio::test]
async fn test_malformed_bodies_touch_nothing() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;
    let writes = ctx.store.write_count();

    // Valid signature, no job_id.
    let resp = send_callback(&server, json!({"status": "running"})).await;
    assert_eq!(resp.status_code(), 400);
    let body: serde_json::Value = resp.json();
    assert_eq!(body["error"], "malformed_callback");

    // Neither type nor status.
    let resp = send_callback(&server, json!({"job_id": job.id})).await;
    assert_eq!(resp.status_code(), 400);

    // Unknown status value.
    let resp = send_callback(&server, json!({"job_id": job.id, "status": "stopped"})).await;
    assert_eq!(resp.status_code(), 400);

    // Invalid JSON, correctly signed.
    let raw = b"{\"job_id\":";
    let resp = send_raw_callback(&server, raw, Some(sign(raw))).await;
    assert_eq!(resp.status_code(), 400);

    assert_eq!(ctx.store.write_count(), writes);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let writes = ctx.store.write_count();

    let resp = send_callback(&server, json!({"job_id": Uuid::new_v4(), "status": "running"})).await;
    assert_eq!(resp.status_code(), 404);
    assert_eq!(ctx.store.write_count(), writes);
}

#[tokio::test]
async fn test_failed_update_runs_rollback_and_swallows_teardown_errors() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    ctx.infra.register_job_server(&job.id.to_string(), "srv-orphan");
    ctx.infra.fail_op("destroy");

    let resp = send_callback(
        &server,
        json!({
            "job_id": job.id,
            "status": "failed",
            "error": "terraform apply exited 1",
            "failed_step": "creating_server"
        }),
    )
    .await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(resp.json::<serde_json::Value>(), json!({"received": true}));

    let failed = ctx.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("terraform apply exited 1"));
    assert_eq!(failed.failed_step.as_deref(), Some("creating_server"));

    // Teardown was attempted against the labelled server.
    let ops: Vec<(&str, String)> = ctx.infra.calls().into_iter().map(|c| (c.op, c.target)).collect();
    assert!(ops.contains(&("destroy", "srv-orphan".to_string())));

    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.backing, Backing::Simulated);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Error);
}

#[tokio::test]
async fn test_failed_update_without_remote_resource() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;
    ctx.infra.fail_op("list");

    let resp = send_callback(&server, json!({"job_id": job.id, "status": "failed"})).await;
    assert_eq!(resp.status_code(), 200);
    assert_eq!(ctx.job(job.id).await.status, JobStatus::Failed);
    assert!(ctx.infra.calls().iter().all(|c| c.op != "destroy"));
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Error);
}

#[tokio::test]
async fn test_terminal_jobs_ignore_late_messages() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let (agent_id, job) = ctx.provision_remote(&server).await;
    let writes = ctx.store.write_count();

    for body in [
        json!({"job_id": job.id, "type": "heartbeat"}),
        json!({"job_id": job.id, "status": "provisioning"}),
        json!({"job_id": job.id, "status": "failed", "error": "late"}),
        json!({
            "job_id": job.id,
            "status": "running",
            "server_id": "srv-2",
            "server_ip": "5.6.7.8",
            "tailscale_ip": "100.64.0.2"
        }),
    ] {
        let resp = send_callback(&server, body).await;
        assert_eq!(resp.status_code(), 200);
    }

    assert_eq!(ctx.store.write_count(), writes);
    let job = ctx.job(job.id).await;
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.last_heartbeat_at.is_none());
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.backing, Backing::Remote(srv1()));
    assert!(ctx.infra.calls().is_empty());
}

#[tokio::test]
async fn test_activation_is_atomic_under_agent_write_fault() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    ctx.store.inject_agent_write_failure(true);
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
    assert_eq!(resp.status_code(), 500);

    assert_eq!(ctx.job(job.id).await.status, JobStatus::Pending);
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.backing, Backing::Simulated);
    assert_eq!(instance.status, InstanceStatus::Pending);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Draft);

    // The workflow retries once the store recovers.
    ctx.store.inject_agent_write_failure(false);
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
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Active);
}

#[tokio::test]
async fn test_running_without_metadata_keeps_instance_simulated() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    let resp = send_callback(&server, json!({"job_id": job.id, "status": "running"})).await;
    assert_eq!(resp.status_code(), 200);

    assert_eq!(ctx.job(job.id).await.status, JobStatus::Running);
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.backing, Backing::Simulated);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Active);
}

#[tokio::test]
async fn test_partial_metadata_never_binds_a_server() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;

    let resp = send_callback(
        &server,
        json!({
            "job_id": job.id,
            "status": "running",
            "server_id": "srv-1",
            "server_ip": "1.2.3.4",
            "tailscale_ip": ""
        }),
    )
    .await;
    assert_eq!(resp.status_code(), 200);

    assert_eq!(ctx.job(job.id).await.status, JobStatus::Running);
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.backing, Backing::Simulated);
    assert!(instance.backing.server_id().is_none());
}

#[tokio::test]
async fn test_slow_rollback_does_not_clobber_newer_attempt() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let first = ctx.provision(&server, agent_id).await;
    ctx.infra.set_delay(Duration::from_millis(150));

    // The failed callback is acknowledged while its teardown is still listing servers.
    let (resp, second) = tokio::join!(
        send_callback(&server, json!({"job_id": first.id, "status": "failed"})),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            provisioning::queue_provisioning(&ctx.state, agent_id, "us-east", None).await
        }
    );
    assert_eq!(resp.status_code(), 200);
    let second = second.unwrap();

    assert_eq!(ctx.job(first.id).await.status, JobStatus::Failed);
    assert_eq!(ctx.job(second.id).await.status, JobStatus::Pending);
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Pending);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Draft);
}

#[tokio::test]
async fn test_rollback_of_superseded_job_leaves_rows_alone() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let first = ctx.provision(&server, agent_id).await;
    send_callback(&server, json!({"job_id": first.id, "status": "failed"})).await;
    ctx.store.set_agent_status(agent_id, AgentStatus::Draft).await.unwrap();
    ctx.provision(&server, agent_id).await;
    ctx.infra.register_job_server(&first.id.to_string(), "srv-orphan");
    let writes = ctx.store.write_count();

    let report = rollback::run(&ctx.state, first.id).await.unwrap();
    assert!(report.superseded);
    assert!(!report.instance_failed);
    assert_eq!(report.torn_down, vec!["srv-orphan".to_string()]);

    // Servers labelled with the old job still go; local rows stay with the new one.
    assert_eq!(ctx.store.write_count(), writes);
    let instance = ctx.store.get_instance(agent_id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Pending);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Draft);
}

#[tokio::test]
async fn test_rollback_bounds_server_listing() {
    let ctx = TestContext::new();
    let server = ctx.server();
    let agent_id = ctx.agent(AgentStatus::Draft);
    let job = ctx.provision(&server, agent_id).await;
    ctx.infra.set_delay(Duration::from_millis(500));

    let report = rollback::run(&ctx.state, job.id).await.unwrap();
    assert_eq!(report.teardown_errors, vec!["list: timed out".to_string()]);
    assert!(report.torn_down.is_empty());
    assert!(report.instance_failed);
    assert_eq!(ctx.agent_status(agent_id).await, AgentStatus::Error);
}
