use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::GatewayError;
use crate::ids::ToolCallId;

/// Raw incremental chunk as delivered by a chat-completions style provider.
/// Only the stream reader looks inside; everything downstream consumes
/// [`StreamEvent`]s.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderDelta {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<DeltaChoice>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: DeltaBody,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeltaBody {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallChunk>,
}

/// Tool-call fragment. Providers send `id` and `name` on the first fragment
/// of a call only; later fragments are keyed by `index`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallChunk {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionChunk>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionChunk {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

impl ProviderDelta {
    pub fn text(content: impl Into<String>) -> Self {
        Self::with_choice(DeltaChoice {
            delta: DeltaBody {
                content: Some(content.into()),
                ..DeltaBody::default()
            },
            ..DeltaChoice::default()
        })
    }

    pub fn tool_call(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) -> Self {
        Self::with_choice(DeltaChoice {
            delta: DeltaBody {
                tool_calls: vec![ToolCallChunk {
                    index,
                    id: id.map(str::to_string),
                    function: Some(FunctionChunk {
                        name: name.map(str::to_string),
                        arguments: arguments.map(str::to_string),
                    }),
                }],
                ..DeltaBody::default()
            },
            ..DeltaChoice::default()
        })
    }

    pub fn finish(reason: &str) -> Self {
        Self::with_choice(DeltaChoice {
            finish_reason: Some(reason.to_string()),
            ..DeltaChoice::default()
        })
    }

    fn with_choice(choice: DeltaChoice) -> Self {
        Self {
            id: None,
            choices: vec![choice],
        }
    }
}

/// Lazy, single-use sequence of raw provider chunks.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<ProviderDelta, GatewayError>> + Send>>;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn from_wire(s: &str) -> Self {
        match s {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Normalized events produced by the stream reader. Strict ordering contract:
///
/// (Text | ToolCallDelta)* → (End | Error)
///
/// Nothing follows the terminal event.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Text {
        delta: String,
    },
    ToolCallDelta {
        id: ToolCallId,
        name: Option<String>,
        arguments: Option<String>,
    },
    End {
        reason: FinishReason,
    },
    Error {
        error: GatewayError,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End { .. } | Self::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_wire_chunk_with_tool_call() {
        let delta: ProviderDelta = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "delta": {
                    "tool_calls": [{
                        "index": 0,
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "search_web", "arguments": ""}
                    }]
                },
                "finish_reason": null
            }]
        }))
        .unwrap();
        let chunk = &delta.choices[0].delta.tool_calls[0];
        assert_eq!(chunk.id.as_deref(), Some("call_1"));
        assert_eq!(
            chunk.function.as_ref().and_then(|f| f.name.as_deref()),
            Some("search_web")
        );
    }

    #[test]
    fn parses_sparse_chunk() {
        let delta: ProviderDelta =
            serde_json::from_value(json!({"choices": [{"delta": {}}]})).unwrap();
        assert_eq!(delta.choices[0].delta, DeltaBody::default());
        assert!(delta.choices[0].finish_reason.is_none());
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("tool_calls"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("function_call"), FinishReason::ToolCalls);
        assert_eq!(
            FinishReason::from_wire("weird"),
            FinishReason::Other("weird".into())
        );
    }

    #[test]
    fn terminal_classification() {
        assert!(StreamEvent::End { reason: FinishReason::Stop }.is_terminal());
        assert!(StreamEvent::Error { error: GatewayError::Cancelled }.is_terminal());
        assert!(!StreamEvent::Text { delta: "x".into() }.is_terminal());
    }
}
