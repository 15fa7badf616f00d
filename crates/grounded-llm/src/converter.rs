use serde::Deserialize;
use serde_json::{json, Value};

use grounded_core::errors::GatewayError;
use grounded_core::messages::Message;
use grounded_core::provider::{ChatRequest, ChatResponse, RawToolCall};
use grounded_core::stream::FinishReason;
use grounded_core::tools::{ToolCall, ToolDefinition};

/// Convert a [`ChatRequest`] into a chat-completions request body.
pub fn build_request_body(request: &ChatRequest, model: &str, stream: bool) -> Value {
    let mut body = json!({
        "model": model,
        "messages": convert_messages(&request.messages),
    });

    if stream {
        body["stream"] = json!(true);
    }

    // Sampling params serialize sparsely; merge whatever is set.
    if let Ok(Value::Object(params)) = serde_json::to_value(&request.sampling) {
        for (key, value) in params {
            body[key] = value;
        }
    }

    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools.iter().map(convert_tool).collect::<Vec<_>>());
    }

    body
}

fn convert_messages(messages: &[Message]) -> Vec<Value> {
    messages.iter().map(convert_message).collect()
}

fn convert_message(msg: &Message) -> Value {
    match msg {
        Message::System { content } => json!({"role": "system", "content": content}),
        Message::User { content } => json!({"role": "user", "content": content}),
        Message::Assistant {
            content,
            tool_calls,
        } => {
            let mut value = json!({"role": "assistant", "content": content});
            if !tool_calls.is_empty() {
                value["tool_calls"] =
                    json!(tool_calls.iter().map(convert_tool_call).collect::<Vec<_>>());
            }
            value
        }
        Message::Tool {
            tool_call_id,
            content,
        } => json!({
            "role": "tool",
            "tool_call_id": tool_call_id.as_str(),
            "content": content,
        }),
    }
}

fn convert_tool_call(tc: &ToolCall) -> Value {
    json!({
        "id": tc.id.as_str(),
        "type": "function",
        "function": {
            "name": tc.name,
            "arguments": tc.arguments.to_string(),
        },
    })
}

fn convert_tool(def: &ToolDefinition) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": def.name,
            "description": def.description,
            "parameters": def.parameters_schema,
        },
    })
}

/// Parse a non-streamed chat-completions response body.
pub fn parse_chat_response(body: &str) -> Result<ChatResponse, GatewayError> {
    let parsed: CompletionBody = serde_json::from_str(body)
        .map_err(|e| GatewayError::Decode(format!("chat response: {e}")))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::Decode("chat response has no choices".into()))?;

    Ok(ChatResponse {
        content: choice.message.content,
        tool_calls: choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| RawToolCall {
                id: tc.id,
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect(),
        finish_reason: choice
            .finish_reason
            .as_deref()
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop),
    })
}

// --- Deserialization types for blocking responses ---

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<CompletionToolCall>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    id: String,
    function: CompletionFunction,
}

#[derive(Deserialize)]
struct CompletionFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}
