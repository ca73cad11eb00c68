use std::sync::Arc;

use agenthost_providers::{InfraProvider, WorkflowDispatcher};

use crate::audit::AuditSink;
use crate::config::Config;
use crate::store::Store;

/// Everything a request handler or background job needs.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub audit: Arc<dyn AuditSink>,
    pub dispatcher: Arc<dyn WorkflowDispatcher>,
    pub infra: Arc<dyn InfraProvider>,
    pub config: Config,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        audit: Arc<dyn AuditSink>,
        dispatcher: Arc<dyn WorkflowDispatcher>,
        infra: Arc<dyn InfraProvider>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            audit,
            dispatcher,
            infra,
            config,
        })
    }
}
