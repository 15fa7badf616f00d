//! Types and client trait for a managed, stateful agent service (threads,
//! runs, run steps) that executes a turn on the server side and pauses in
//! `requires_action` when it needs a locally executed tool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::{AgentId, RunId, ThreadId};
use crate::messages::{Message, Role};
use crate::provider::RawToolCall;
use crate::tools::{ToolDefinition, ToolResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    #[serde(rename = "in_progress", alias = "running")]
    Running,
    RequiresAction,
    Cancelling,
    Completed,
    #[serde(alias = "incomplete")]
    Failed,
    Cancelled,
    Expired,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub code: String,
    pub message: String,
}

/// Snapshot of a run as last reported by the service.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentRun {
    pub id: RunId,
    pub thread_id: ThreadId,
    pub status: RunStatus,
    /// Populated only while `status == RequiresAction`.
    pub required_tool_calls: Vec<RawToolCall>,
    pub last_error: Option<RunError>,
    pub created_at: DateTime<Utc>,
}

/// One step of a run. `tool_calls` keeps the service's raw payloads; they
/// are the input for citation extraction.
#[derive(Clone, Debug, PartialEq)]
pub struct RunStep {
    pub id: String,
    pub status: String,
    pub step_type: String,
    pub last_error: Option<RunError>,
    pub tool_calls: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AgentMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Everything needed to create an agent on the service. `key` is the stable
/// identity used for caching the created agent.
#[derive(Clone, Debug, PartialEq)]
pub struct AgentDefinition {
    pub key: String,
    pub name: String,
    pub model: String,
    pub instructions: String,
    pub tools: Vec<ToolDefinition>,
    /// Service-hosted tools (e.g. grounding or index search) passed through as-is.
    pub hosted_tools: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentHandle {
    pub id: AgentId,
    pub key: String,
}

#[async_trait]
pub trait AgentService: Send + Sync {
    async fn create_agent(&self, definition: &AgentDefinition) -> Result<AgentHandle, GatewayError>;

    /// Create a thread seeded with `conversation` and start a run on it.
    async fn create_run(
        &self,
        agent: &AgentHandle,
        conversation: &[Message],
    ) -> Result<AgentRun, GatewayError>;

    async fn get_run(&self, thread_id: &ThreadId, run_id: &RunId) -> Result<AgentRun, GatewayError>;

    async fn submit_tool_outputs(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        outputs: &[ToolResult],
    ) -> Result<AgentRun, GatewayError>;

    async fn list_run_steps(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
    ) -> Result<Vec<RunStep>, GatewayError>;

    async fn list_messages(&self, thread_id: &ThreadId) -> Result<Vec<AgentMessage>, GatewayError>;
}
