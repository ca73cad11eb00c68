use std::sync::Mutex;

use agenthost_common::AuditRecord;
use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::store::StoreResult;

/// Write-only audit collaborator. Display of the log lives elsewhere.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> StoreResult<()>;
}

pub struct PgAuditSink {
    db: Pool<Postgres>,
}

impl PgAuditSink {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn record(&self, record: &AuditRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO audit_logs (id, category, action, agent_id, metadata, created_at)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(&record.category)
        .bind(record.action.as_str())
        .bind(record.agent_id)
        .bind(record.metadata())
        .bind(record.created_at)
        .execute(&self.db)
        .await?;
        tracing::debug!(
            "[audit] {} for agent {}",
            record.action.as_str(),
            record.agent_id
        );
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &AuditRecord) -> StoreResult<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }
}
