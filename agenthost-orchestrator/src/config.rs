use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Clone, Debug)]
pub struct GithubSettings {
    pub token: String,
    pub repository: String,
    pub workflow: String,
    pub git_ref: String,
}

/// Runtime configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub store: StoreBackend,
    pub database_url: Option<String>,
    pub webhook_secret: String,
    /// Externally reachable base URL; the webhook callback URL is derived from it.
    pub public_base_url: String,
    pub dispatcher: String,
    pub github: Option<GithubSettings>,
    pub provider: String,
    pub hetzner_token: Option<String>,
    pub remote_call_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub sweep_interval: Duration,
    pub bind_addr: SocketAddr,
    /// Agents created at startup when STORE=memory (local runs only).
    pub seed_agent_ids: Vec<Uuid>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let store = match get("STORE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => return Err(anyhow!("STORE must be 'postgres' or 'memory', got '{}'", other)),
        };
        let database_url = get("DATABASE_URL");
        if store == StoreBackend::Postgres && database_url.is_none() {
            return Err(anyhow!("DATABASE_URL must be set when STORE=postgres"));
        }

        let webhook_secret = read_secret(&lookup, "WEBHOOK_SECRET")?
            .ok_or_else(|| anyhow!("WEBHOOK_SECRET (or WEBHOOK_SECRET_FILE) must be set"))?;

        let public_base_url = get("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8001".to_string())
            .trim_end_matches('/')
            .to_string();

        let dispatcher = get("DISPATCHER")
            .unwrap_or_else(|| "github".to_string())
            .to_ascii_lowercase();
        let github = match (read_secret(&lookup, "GITHUB_TOKEN")?, get("GITHUB_REPOSITORY")) {
            (Some(token), Some(repository)) => Some(GithubSettings {
                token,
                repository,
                workflow: get("GITHUB_WORKFLOW").unwrap_or_else(|| "provision-agent.yml".to_string()),
                git_ref: get("GITHUB_REF").unwrap_or_else(|| "main".to_string()),
            }),
            _ => None,
        };

        let provider = get("PROVIDER")
            .unwrap_or_else(|| "hetzner".to_string())
            .to_ascii_lowercase();
        let hetzner_token = read_secret(&lookup, "HETZNER_API_TOKEN")?;

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8001".to_string())
            .parse::<SocketAddr>()
            .context("BIND_ADDR must be host:port")?;

        let seed_agent_ids = get("SEED_AGENT_IDS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Uuid::parse_str(s).with_context(|| format!("SEED_AGENT_IDS: '{}' is not a uuid", s)))
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            store,
            database_url,
            webhook_secret,
            public_base_url,
            dispatcher,
            github,
            provider,
            hetzner_token,
            remote_call_timeout: secs(&get, "REMOTE_CALL_TIMEOUT_SECS", 30)?,
            heartbeat_timeout: secs(&get, "HEARTBEAT_TIMEOUT_SECS", 900)?,
            sweep_interval: secs(&get, "SWEEP_INTERVAL_SECS", 60)?,
            bind_addr,
            seed_agent_ids,
        })
    }

    pub fn callback_url(&self) -> String {
        format!("{}/webhooks/provisioning", self.public_base_url)
    }
}

fn secs<G>(get: &G, key: &str, default: u64) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(Duration::from_secs(default)),
        Some(v) => {
            let n = v
                .parse::<u64>()
                .with_context(|| format!("{} must be a number of seconds", key))?;
            if n == 0 {
                return Err(anyhow!("{} must be greater than zero", key));
            }
            Ok(Duration::from_secs(n))
        }
    }
}

/// Prefer `<KEY>_FILE` (Docker/K8s secrets), fall back to `<KEY>`.
fn read_secret<F>(lookup: &F, key: &str) -> Result<Option<String>>
where
    F: Fn(&str) -> Option<String>,
{
    let file_key = format!("{}_FILE", key);
    if let Some(path) = lookup(&file_key).filter(|p| !p.trim().is_empty()) {
        let value = fs::read_to_string(path.trim())
            .with_context(|| format!("failed to read {} from {}", key, path.trim()))?;
        let value = value.trim().to_string();
        return Ok(if value.is_empty() { None } else { Some(value) });
    }
    Ok(lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty()))
}
