use crate::{DispatchRequest, WorkflowDispatcher};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;

const GITHUB_API: &str = "https://api.github.com";

/// Triggers a GitHub Actions `workflow_dispatch` run.
pub struct GithubDispatcher {
    client: Client,
    api_base: String,
    token: String,
    repository: String,
    workflow: String,
    git_ref: String,
}

impl GithubDispatcher {
    pub fn new(token: String, repository: String, workflow: String, git_ref: String) -> Result<Self> {
        // One attempt only, so a stalled API must not hang the caller.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .user_agent("agenthost-orchestrator")
            .build()?;
        Ok(Self {
            client,
            api_base: GITHUB_API.to_string(),
            token: token.trim().to_string(),
            repository: repository.trim().to_string(),
            workflow: workflow.trim().to_string(),
            git_ref: git_ref.trim().to_string(),
        })
    }

    /// Point the dispatcher at a different API host (GitHub Enterprise, local fakes).
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn dispatch_url(&self) -> String {
        format!(
            "{}/repos/{}/actions/workflows/{}/dispatches",
            self.api_base, self.repository, self.workflow
        )
    }
}

/// GitHub answers a queued dispatch with 204; some proxies rewrite it to 202.
pub fn is_accepted(status: u16) -> bool {
    matches!(status, 202 | 204)
}

#[async_trait]
impl WorkflowDispatcher for GithubDispatcher {
    fn name(&self) -> &'static str {
        "github"
    }

    async fn dispatch(&self, request: &DispatchRequest) -> Result<()> {
        let url = self.dispatch_url();
        let body = json!({
            "ref": self.git_ref,
            "inputs": {
                "job_id": request.job_id,
                "agent_id": request.agent_id,
                "region": request.region,
                "callback_url": request.callback_url,
            }
        });

        tracing::info!(
            "[github] POST {} - dispatching job {} (agent={}, region={})",
            url,
            request.job_id,
            request.agent_id,
            request.region
        );

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .json(&body)
            .send()
            .await?;

        let status_code = resp.status().as_u16();
        if !is_accepted(status_code) {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!(
                "[github] POST {} rejected: status={} body={}",
                url,
                status_code,
                text
            );
            return Err(anyhow::anyhow!(
                "workflow dispatch rejected: status={} body={}",
                status_code,
                text
            ));
        }

        tracing::info!("[github] dispatch accepted for job {} (status={})", request.job_id, status_code);
        Ok(())
    }
}
