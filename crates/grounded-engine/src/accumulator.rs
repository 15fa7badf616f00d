use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use grounded_core::ids::ToolCallId;
use grounded_core::provider::RawToolCall;
use grounded_core::stream::StreamEvent;
use grounded_core::tools::{ToolCall, ToolError, ToolResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccumulatorState {
    /// No tool-call delta seen yet.
    Initial,
    /// Tool-call deltas are arriving.
    Streaming,
    /// A text delta or an end signal closed the tool-call phase.
    Completed,
}

/// A tool call whose buffered arguments never became valid JSON, or that
/// never received a name.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MalformedToolCall {
    pub id: ToolCallId,
    pub name: Option<String>,
    pub arguments: String,
    pub reason: String,
}

impl MalformedToolCall {
    pub fn to_error(&self) -> ToolError {
        ToolError::MalformedCall {
            name: self.name.clone().unwrap_or_default(),
            reason: self.reason.clone(),
        }
    }

    /// Error result for services that insist on an output for every call id.
    pub fn to_result(&self) -> ToolResult {
        let err = self.to_error();
        ToolResult {
            tool_call_id: self.id.clone(),
            tool_name: self.name.clone().unwrap_or_default(),
            output: err.to_string(),
            is_error: true,
            duration: Duration::ZERO,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Drained {
    pub calls: Vec<ToolCall>,
    pub malformed: Vec<MalformedToolCall>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.malformed.is_empty()
    }
}

#[derive(Debug, Default)]
struct Fragment {
    name: String,
    arguments: String,
}

/// Buffers partial tool-call fragments per call id until the tool-call
/// phase completes. One accumulator belongs to one exchange.
#[derive(Debug)]
pub struct ToolCallAccumulator {
    state: AccumulatorState,
    order: Vec<ToolCallId>,
    buffers: HashMap<ToolCallId, Fragment>,
}

impl Default for ToolCallAccumulator {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self {
            state: AccumulatorState::Initial,
            order: Vec::new(),
            buffers: HashMap::new(),
        }
    }

    pub fn state(&self) -> AccumulatorState {
        self.state
    }

    pub fn feed(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::Text { .. } => {
                if self.state == AccumulatorState::Streaming {
                    self.state = AccumulatorState::Completed;
                }
            }
            StreamEvent::ToolCallDelta {
                id,
                name,
                arguments,
            } => {
                if self.state == AccumulatorState::Completed {
                    warn!(tool_call_id = %id, "tool-call delta after the tool phase closed, ignoring");
                    return;
                }
                self.state = AccumulatorState::Streaming;
                if !self.buffers.contains_key(id) {
                    self.order.push(id.clone());
                }
                let fragment = self.buffers.entry(id.clone()).or_default();
                if let Some(name) = name {
                    fragment.name.push_str(name);
                }
                if let Some(args) = arguments {
                    fragment.arguments.push_str(args);
                }
            }
            StreamEvent::End { .. } => {
                if self.state == AccumulatorState::Streaming {
                    self.state = AccumulatorState::Completed;
                }
            }
            StreamEvent::Error { .. } => {}
        }
    }

    /// Take every buffered call, in first-seen order, and reset.
    pub fn drain(&mut self) -> Drained {
        let mut drained = Drained::default();
        for id in self.order.drain(..) {
            let Some(fragment) = self.buffers.remove(&id) else {
                continue;
            };
            let name = (!fragment.name.is_empty()).then_some(fragment.name);
            push_parsed(&mut drained, id, name, fragment.arguments);
        }
        self.buffers.clear();
        self.state = AccumulatorState::Initial;
        drained
    }
}

/// Parse tool calls that arrived whole (blocking completions, agent
/// `requires_action` payloads). Same rules as [`ToolCallAccumulator::drain`].
pub fn parse_raw_calls(raw: &[RawToolCall]) -> Drained {
    let mut drained = Drained::default();
    for call in raw {
        let name = (!call.name.is_empty()).then(|| call.name.clone());
        push_parsed(
            &mut drained,
            ToolCallId::from_raw(call.id.clone()),
            name,
            call.arguments.clone(),
        );
    }
    drained
}

fn push_parsed(drained: &mut Drained, id: ToolCallId, name: Option<String>, arguments: String) {
    let Some(name) = name else {
        warn!(tool_call_id = %id, "tool call without a name");
        drained.malformed.push(MalformedToolCall {
            id,
            name: None,
            arguments,
            reason: "missing tool name".into(),
        });
        return;
    };

    match parse_arguments(&arguments) {
        Ok(value) => drained.calls.push(ToolCall {
            id,
            name,
            arguments: value,
        }),
        Err(e) => {
            warn!(tool_call_id = %id, tool = %name, error = %e, "malformed tool-call arguments");
            drained.malformed.push(MalformedToolCall {
                id,
                name: Some(name),
                arguments,
                reason: e.to_string(),
            });
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(Default::default()));
    }
    serde_json::from_str(raw)
}
