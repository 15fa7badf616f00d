use std::time::Duration;

use serde::{Deserialize, Serialize};

use grounded_core::agent::RunStatus;
use grounded_core::errors::GatewayError;
use grounded_core::ids::RunId;

/// Why an exchange could not produce an answer.
///
/// Tool failures never show up here: they are folded into error
/// `ToolResult`s and the exchange carries on.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("transport error: {0}")]
    Transport(#[from] GatewayError),

    #[error("agent run {run_id} did not finish within {}s", .waited.as_secs_f64())]
    AgentTimeout { run_id: RunId, waited: Duration },

    #[error("agent run {run_id} ended as {}: {details}", .status.as_str())]
    AgentRunFailed {
        run_id: RunId,
        status: RunStatus,
        details: String,
    },

    #[error("agent service error: {0}")]
    AgentService(GatewayError),

    #[error("exchange cancelled")]
    Cancelled,
}

/// Outcome class reported to callers. Only an agent timeout maps to
/// `Timeout`, so callers can tell "try again later" from a hard failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeStatus {
    Success,
    Error,
    Timeout,
}

impl OrchestratorError {
    pub fn status(&self) -> ExchangeStatus {
        match self {
            Self::AgentTimeout { .. } => ExchangeStatus::Timeout,
            _ => ExchangeStatus::Error,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(e) | Self::AgentService(e) => e.error_kind(),
            Self::AgentTimeout { .. } => "agent_timeout",
            Self::AgentRunFailed { .. } => "agent_run_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A citation strategy could not read a payload it claimed. Logged and
/// skipped; never surfaced to the caller.
#[derive(Debug, thiserror::Error)]
pub enum CitationError {
    #[error("payload for {strategy} is not valid: {reason}")]
    InvalidPayload {
        strategy: &'static str,
        reason: String,
    },
}
