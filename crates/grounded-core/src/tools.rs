use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::ids::ToolCallId;

/// A complete tool invocation requested by the model. Immutable once built.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: ToolCallId,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Outcome of one tool call, matched back to its call by `tool_call_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl ToolResult {
    pub fn success(call: &ToolCall, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: output.into(),
            is_error: false,
            duration,
        }
    }

    pub fn failure(call: &ToolCall, error: &ToolError, duration: Duration) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: error.to_string(),
            is_error: true,
            duration,
        }
    }
}

/// What a tool hands back. `is_error` lets a tool report a soft failure
/// (e.g. an upstream 404) with a body the model can read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Context available to tools during execution.
#[derive(Clone, Debug)]
pub struct ToolContext {
    pub tool_call_id: ToolCallId,
    pub cancel: CancellationToken,
}

/// Tool definition sent to the model as part of the request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// Trait implemented by each locally dispatched tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters_schema(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters_schema: self.parameters_schema(),
        }
    }
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("malformed arguments for {name}: {reason}")]
    MalformedCall { name: String, reason: String },
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("internal error: tool crashed")]
    Panicked,
}

impl ToolError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::UnknownTool(_) => "unknown_tool",
            Self::MalformedCall { .. } => "malformed_tool_call",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::Upstream { .. } => "upstream_status",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Panicked => "panicked",
        }
    }
}

/// Serde helper for Duration as milliseconds.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call() -> ToolCall {
        ToolCall {
            id: ToolCallId::from_raw("call_1"),
            name: "search_web".into(),
            arguments: json!({"query": "Tokyo weather"}),
        }
    }

    #[test]
    fn failure_result_embeds_error_text() {
        let err = ToolError::Upstream {
            status: 503,
            body: "busy".into(),
        };
        let result = ToolResult::failure(&call(), &err, Duration::ZERO);
        assert!(result.is_error);
        assert_eq!(result.tool_call_id.as_str(), "call_1");
        assert!(result.output.contains("503"), "got: {}", result.output);
    }

    #[test]
    fn result_duration_serializes_as_ms() {
        let result = ToolResult::success(&call(), "ok", Duration::from_millis(1234));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["duration"], 1234);
        assert_eq!(json["is_error"], false);
    }

    #[test]
    fn timeout_display_uses_seconds() {
        let err = ToolError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1.5s");
        assert_eq!(err.error_kind(), "timeout");
    }

    #[test]
    fn output_constructors() {
        assert!(!ToolOutput::text("x").is_error);
        assert!(ToolOutput::error("x").is_error);
    }
}
