use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ids::ToolCallId;
use crate::tools::{ToolCall, ToolResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        })
    }
}

/// One entry of the conversation history.
///
/// Assistant messages may carry the tool calls they emitted; every `Tool`
/// message must answer one of those ids (see [`sanitize_history`]).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Message {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        #[serde(default)]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: ToolCallId,
        content: String,
    },
}

// --- Convenience constructors ---

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message::System {
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Message::Assistant {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Assistant turn that requested tools. Empty text becomes `null` content.
    pub fn assistant_tool_calls(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        let text = text.into();
        Message::Assistant {
            content: if text.is_empty() { None } else { Some(text) },
            tool_calls,
        }
    }

    pub fn tool(tool_call_id: ToolCallId, content: impl Into<String>) -> Self {
        Message::Tool {
            tool_call_id,
            content: content.into(),
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Message::System { content } | Message::User { content } => Some(content),
            Message::Tool { content, .. } => Some(content),
            Message::Assistant { content, .. } => content.as_deref(),
        }
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Assistant { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }
}

/// Error results are prefixed with `[error]` so the model can tell a failed
/// call from an empty answer.
impl From<&ToolResult> for Message {
    fn from(result: &ToolResult) -> Self {
        let content = if result.is_error {
            format!("[error] {}", result.output)
        } else {
            result.output.clone()
        };
        Message::tool(result.tool_call_id.clone(), content)
    }
}

/// Prepare caller-supplied history for a provider request.
///
/// Tool messages that do not answer a call id emitted by an earlier
/// assistant message are dropped. When `system_prompt` is given and the
/// history has no system message, it is inserted at the front.
pub fn sanitize_history(messages: Vec<Message>, system_prompt: Option<&str>) -> Vec<Message> {
    let mut emitted: HashSet<ToolCallId> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len() + 1);

    for msg in messages {
        match &msg {
            Message::Assistant { tool_calls, .. } => {
                emitted.extend(tool_calls.iter().map(|tc| tc.id.clone()));
            }
            Message::Tool { tool_call_id, .. } if !emitted.contains(tool_call_id) => {
                debug!(tool_call_id = %tool_call_id, "dropping orphaned tool message");
                continue;
            }
            _ => {}
        }
        out.push(msg);
    }

    if let Some(prompt) = system_prompt {
        if !out.iter().any(|m| m.role() == Role::System) {
            out.insert(0, Message::system(prompt));
        }
    }
    out
}
