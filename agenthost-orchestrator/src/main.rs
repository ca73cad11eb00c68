use std::sync::Arc;

use agenthost_common::AgentStatus;
use agenthost_orchestrator::app::AppState;
use agenthost_orchestrator::audit::{AuditSink, MemoryAuditSink, PgAuditSink};
use agenthost_orchestrator::config::{Config, StoreBackend};
use agenthost_orchestrator::provider_manager::ProviderManager;
use agenthost_orchestrator::store::{MemoryStore, PgStore, Store};
use agenthost_orchestrator::{build_app, heartbeat_job};
use anyhow::{anyhow, Context, Result};
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;

    let (store, audit): (Arc<dyn Store>, Arc<dyn AuditSink>) = match config.store {
        StoreBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
                .context("failed to connect to Postgres")?;
            sqlx::query("SELECT 1").execute(&pool).await?;
            tracing::info!("[startup] connected to database");

            let store = PgStore::new(pool.clone());
            // Source of truth is /sqlx-migrations at the workspace root.
            store
                .run_migrations()
                .await
                .context("failed to run migrations")?;
            let audit: Arc<dyn AuditSink> = Arc::new(PgAuditSink::new(pool));
            let store: Arc<dyn Store> = Arc::new(store);
            (store, audit)
        }
        StoreBackend::Memory => {
            tracing::warn!("[startup] STORE=memory: state is lost on restart");
            let store = MemoryStore::new();
            for agent_id in &config.seed_agent_ids {
                store.insert_agent(*agent_id, AgentStatus::Draft);
            }
            let audit: Arc<dyn AuditSink> = Arc::new(MemoryAuditSink::new());
            let store: Arc<dyn Store> = Arc::new(store);
            (store, audit)
        }
    };

    let dispatcher = ProviderManager::dispatcher(&config)?;
    let infra = ProviderManager::infra(&config)?;
    tracing::info!(
        "[startup] dispatcher={} provider={} callback_url={}",
        dispatcher.name(),
        infra.name(),
        config.callback_url()
    );

    let bind_addr = config.bind_addr;
    let state = AppState::new(store, audit, dispatcher, infra, config);

    let sweep_state = state.clone();
    tokio::spawn(async move {
        heartbeat_job::run(sweep_state).await;
    });

    let app = build_app(state);
    tracing::info!("[startup] orchestrator listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
