//! In-process doubles that record every call. Used by tests and `PROVIDER=mock` runs.

use crate::{DispatchRequest, InfraProvider, WorkflowDispatcher};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Default)]
pub struct MockDispatcher {
    calls: Mutex<Vec<DispatchRequest>>,
    reject_with: Mutex<Option<String>>,
}

impl MockDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following dispatch fail with this message.
    pub fn reject(&self, message: &str) {
        *self.reject_with.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.to_string());
    }

    pub fn accept(&self) {
        *self.reject_with.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn calls(&self) -> Vec<DispatchRequest> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl WorkflowDispatcher for MockDispatcher {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        let rejection = self
            .reject_with
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match rejection {
            Some(msg) => Err(anyhow::anyhow!("workflow dispatch rejected: {}", msg)),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfraCall {
    pub op: &'static str,
    pub target: String,
}

#[derive(Default)]
pub struct MockInfraProvider {
    calls: Mutex<Vec<InfraCall>>,
    failing_ops: Mutex<HashSet<&'static str>>,
    job_servers: Mutex<HashMap<String, Vec<String>>>,
    delay: Mutex<Option<Duration>>,
}

impl MockInfraProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `op` ("start", "stop", "destroy", "list") fail from now on.
    pub fn fail_op(&self, op: &'static str) {
        self.failing_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(op);
    }

    /// Pretend the workflow already created `server_id` for `job_id`.
    pub fn register_job_server(&self, job_id: &str, server_id: &str) {
        self.job_servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(job_id.to_string())
            .or_default()
            .push(server_id.to_string());
    }

    /// Slow every call down, to exercise caller timeouts.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> Vec<InfraCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn record(&self, op: &'static str, target: &str) -> Result<()> {
        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(InfraCall {
                op,
                target: target.to_string(),
            });
        if self
            .failing_ops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(op)
        {
            return Err(anyhow::anyhow!("mock provider: {} {} failed", op, target));
        }
        Ok(())
    }
}

#[async_trait]
impl InfraProvider for MockInfraProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start_server(&self, server_id: &str) -> Result<()> {
        self.record("start", server_id).await
    }

    async fn stop_server(&self, server_id: &str) -> Result<()> {
        self.record("stop", server_id).await
    }

    async fn destroy_server(&self, server_id: &str) -> Result<()> {
        self.record("destroy", server_id).await
    }

    async fn list_servers_for_job(&self, job_id: &str) -> Result<Vec<String>> {
        self.record("list", job_id).await?;
        Ok(self
            .job_servers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }
}
