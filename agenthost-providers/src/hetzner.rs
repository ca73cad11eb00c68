use crate::InfraProvider;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

const HCLOUD_API: &str = "https://api.hetzner.cloud/v1";

/// Label the provisioning workflow puts on every server it creates.
pub const JOB_LABEL: &str = "agenthost-job";

pub struct HetznerProvider {
    client: Client,
    api_base: String,
    token: String,
}

#[derive(Deserialize)]
struct ServerList {
    servers: Vec<ServerRef>,
}

#[derive(Deserialize)]
struct ServerRef {
    id: u64,
}

impl HetznerProvider {
    pub fn new(token: String) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            api_base: HCLOUD_API.to_string(),
            token: token.trim().to_string(),
        })
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    async fn server_action(&self, server_id: &str, action: &str) -> Result<()> {
        let url = format!("{}/servers/{}/actions/{}", self.api_base, server_id, action);
        tracing::info!("[hetzner] POST {} - server_id={}", url, server_id);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("[hetzner] POST {} failed: status={} body={}", url, status.as_u16(), text);
            return Err(anyhow::anyhow!(
                "hetzner {} failed: status={} body={}",
                action,
                status.as_u16(),
                text
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl InfraProvider for HetznerProvider {
    fn name(&self) -> &'static str {
        "hetzner"
    }

    async fn start_server(&self, server_id: &str) -> Result<()> {
        self.server_action(server_id, "poweron").await
    }

    async fn stop_server(&self, server_id: &str) -> Result<()> {
        // ACPI shutdown so the agent runtime can flush its state.
        self.server_action(server_id, "shutdown").await
    }

    async fn destroy_server(&self, server_id: &str) -> Result<()> {
        let url = format!("{}/servers/{}", self.api_base, server_id);
        tracing::info!("[hetzner] DELETE {} - server_id={}", url, server_id);

        let resp = self
            .client
            .delete(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 404 {
            tracing::warn!("[hetzner] server {} already gone", server_id);
            return Ok(());
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "hetzner delete failed: status={} body={}",
                status.as_u16(),
                text
            ));
        }
        Ok(())
    }

    async fn list_servers_for_job(&self, job_id: &str) -> Result<Vec<String>> {
        let url = format!("{}/servers", self.api_base);
        let selector = format!("{}={}", JOB_LABEL, job_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .query(&[("label_selector", selector.as_str())])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "hetzner list servers failed: status={} body={}",
                status.as_u16(),
                text
            ));
        }

        let list: ServerList = resp.json().await?;
        Ok(list.servers.into_iter().map(|s| s.id.to_string()).collect())
    }
}
