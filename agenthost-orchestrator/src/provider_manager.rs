use std::sync::Arc;

use agenthost_providers::github::GithubDispatcher;
use agenthost_providers::hetzner::HetznerProvider;
use agenthost_providers::{InfraProvider, WorkflowDispatcher};
use anyhow::{anyhow, Result};

use crate::config::Config;

pub struct ProviderManager;

impl ProviderManager {
    pub fn dispatcher(config: &Config) -> Result<Arc<dyn WorkflowDispatcher>> {
        match config.dispatcher.as_str() {
            "github" => {
                let gh = config.github.clone().ok_or_else(|| {
                    anyhow!("DISPATCHER=github needs GITHUB_TOKEN and GITHUB_REPOSITORY")
                })?;
                Ok(Arc::new(GithubDispatcher::new(
                    gh.token,
                    gh.repository,
                    gh.workflow,
                    gh.git_ref,
                )?))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(agenthost_providers::mock::MockDispatcher::new())),
            other => Err(anyhow!("unsupported DISPATCHER '{}'", other)),
        }
    }

    pub fn infra(config: &Config) -> Result<Arc<dyn InfraProvider>> {
        match config.provider.as_str() {
            "hetzner" => {
                let token = config
                    .hetzner_token
                    .clone()
                    .ok_or_else(|| anyhow!("PROVIDER=hetzner needs HETZNER_API_TOKEN"))?;
                Ok(Arc::new(HetznerProvider::new(token)?))
            }
            #[cfg(feature = "provider-mock")]
            "mock" => Ok(Arc::new(agenthost_providers::mock::MockInfraProvider::new())),
            other => Err(anyhow!(
                "unsupported PROVIDER '{}' (mock needs the provider-mock feature)",
                other
            )),
        }
    }
}
