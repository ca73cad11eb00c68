use agenthost_common::{AgentStatus, InstanceStatus, JobStatus, ProvisioningJob};
use utoipa::OpenApi;

use crate::handlers::{agents, webhook, ErrorBody};
use crate::lifecycle::LifecycleOutcome;
use crate::progress::{StepState, StepView};

#[derive(OpenApi)]
#[openapi(
    paths(
        webhook::receive_callback,
        agents::provision_agent,
        agents::provisioning_status,
        agents::start_agent,
        agents::stop_agent,
        agents::destroy_instance
    ),
    components(
        schemas(
            ProvisioningJob,
            JobStatus,
            InstanceStatus,
            AgentStatus,
            agents::ProvisionRequest,
            agents::InstanceView,
            agents::StatusView,
            StepView,
            StepState,
            LifecycleOutcome,
            webhook::WebhookAck,
            ErrorBody
        )
    ),
    tags(
        (name = "agenthost-orchestrator", description = "Agent provisioning and lifecycle")
    )
)]
pub struct ApiDoc;
