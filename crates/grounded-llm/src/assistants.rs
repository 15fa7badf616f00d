//! HTTP client for an Assistants-style agent service (assistants, threads,
//! runs, run steps).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument};

use grounded_core::agent::{
    AgentDefinition, AgentHandle, AgentMessage, AgentRun, AgentService, RunError, RunStatus,
    RunStep,
};
use grounded_core::errors::GatewayError;
use grounded_core::ids::{AgentId, RunId, ThreadId};
use grounded_core::messages::{Message, Role};
use grounded_core::provider::RawToolCall;
use grounded_core::tools::ToolResult;

use crate::client::error_for_status;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct AssistantsClient {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl AssistantsClient {
    pub fn new(base_url: impl Into<String>, api_key: Option<SecretString>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let req = req.header("OpenAI-Beta", "assistants=v2");
        match &self.api_key {
            Some(key) => req.bearer_auth(key.expose_secret()),
            None => req,
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, GatewayError> {
        let req = self.authorize(self.client.get(format!("{}{path}", self.base_url)));
        self.execute(req).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, GatewayError> {
        let req = self.authorize(self.client.post(format!("{}{path}", self.base_url)).json(body));
        self.execute(req).await
    }

    async fn execute<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, GatewayError> {
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                GatewayError::Timeout(REQUEST_TIMEOUT)
            } else {
                GatewayError::Transport(e.to_string())
            }
        })?;
        let resp = error_for_status(resp).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| GatewayError::Decode(e.to_string()))
    }
}

#[async_trait]
impl AgentService for AssistantsClient {
    #[instrument(skip(self, definition), fields(key = %definition.key))]
    async fn create_agent(&self, definition: &AgentDefinition) -> Result<AgentHandle, GatewayError> {
        let mut tools: Vec<Value> = definition
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters_schema,
                    }
                })
            })
            .collect();
        tools.extend(definition.hosted_tools.iter().cloned());

        let body = json!({
            "model": definition.model,
            "name": definition.name,
            "instructions": definition.instructions,
            "tools": tools,
        });
        let created: WireObject = self.post("/assistants", &body).await?;
        debug!(agent_id = %created.id, "agent created");
        Ok(AgentHandle {
            id: AgentId::from_raw(created.id),
            key: definition.key.clone(),
        })
    }

    #[instrument(skip(self, agent, conversation), fields(agent_id = %agent.id))]
    async fn create_run(
        &self,
        agent: &AgentHandle,
        conversation: &[Message],
    ) -> Result<AgentRun, GatewayError> {
        // Threads only hold user/assistant turns.
        let messages: Vec<Value> = conversation
            .iter()
            .filter_map(|m| match (m.role(), m.content()) {
                (Role::User | Role::Assistant, Some(text)) if !text.is_empty() => {
                    Some(json!({"role": m.role().to_string(), "content": text}))
                }
                _ => None,
            })
            .collect();
        let body = json!({
            "assistant_id": agent.id.as_str(),
            "thread": {"messages": messages},
        });
        let run: WireRun = self.post("/threads/runs", &body).await?;
        Ok(run.into())
    }

    async fn get_run(&self, thread_id: &ThreadId, run_id: &RunId) -> Result<AgentRun, GatewayError> {
        let run: WireRun = self
            .get(&format!("/threads/{thread_id}/runs/{run_id}"))
            .await?;
        Ok(run.into())
    }

    #[instrument(skip(self, outputs), fields(thread_id = %thread_id, run_id = %run_id, count = outputs.len()))]
    async fn submit_tool_outputs(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
        outputs: &[ToolResult],
    ) -> Result<AgentRun, GatewayError> {
        let tool_outputs: Vec<Value> = outputs
            .iter()
            .map(|r| json!({"tool_call_id": r.tool_call_id.as_str(), "output": r.output}))
            .collect();
        let run: WireRun = self
            .post(
                &format!("/threads/{thread_id}/runs/{run_id}/submit_tool_outputs"),
                &json!({"tool_outputs": tool_outputs}),
            )
            .await?;
        Ok(run.into())
    }

    async fn list_run_steps(
        &self,
        thread_id: &ThreadId,
        run_id: &RunId,
    ) -> Result<Vec<RunStep>, GatewayError> {
        let page: WireList<WireStep> = self
            .get(&format!("/threads/{thread_id}/runs/{run_id}/steps?order=asc"))
            .await?;
        Ok(page.data.into_iter().map(Into::into).collect())
    }

    async fn list_messages(&self, thread_id: &ThreadId) -> Result<Vec<AgentMessage>, GatewayError> {
        let page: WireList<WireMessage> = self
            .get(&format!("/threads/{thread_id}/messages?order=desc"))
            .await?;
        Ok(page.data.into_iter().filter_map(WireMessage::into_message).collect())
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
}

// --- Wire types ---

#[derive(Deserialize)]
struct WireObject {
    id: String,
}

#[derive(Deserialize)]
struct WireList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Deserialize)]
struct WireRun {
    id: String,
    thread_id: String,
    status: RunStatus,
    #[serde(default)]
    required_action: Option<WireRequiredAction>,
    #[serde(default)]
    last_error: Option<RunError>,
    #[serde(default)]
    created_at: i64,
}

#[derive(Deserialize)]
struct WireRequiredAction {
    submit_tool_outputs: WireSubmitToolOutputs,
}

#[derive(Deserialize)]
struct WireSubmitToolOutputs {
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

impl From<WireRun> for AgentRun {
    fn from(run: WireRun) -> Self {
        let required_tool_calls = run
            .required_action
            .map(|a| {
                a.submit_tool_outputs
                    .tool_calls
                    .into_iter()
                    .map(|tc| RawToolCall {
                        id: tc.id,
                        name: tc.function.name,
                        arguments: tc.function.arguments,
                    })
                    .collect()
            })
            .unwrap_or_default();
        AgentRun {
            id: RunId::from_raw(run.id),
            thread_id: ThreadId::from_raw(run.thread_id),
            status: run.status,
            required_tool_calls,
            last_error: run.last_error,
            created_at: timestamp(run.created_at),
        }
    }
}

#[derive(Deserialize)]
struct WireStep {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default, rename = "type")]
    step_type: String,
    #[serde(default)]
    last_error: Option<RunError>,
    #[serde(default)]
    step_details: Option<Value>,
}

impl From<WireStep> for RunStep {
    fn from(step: WireStep) -> Self {
        let tool_calls = step
            .step_details
            .as_ref()
            .and_then(|d| d.get("tool_calls"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        RunStep {
            id: step.id,
            status: step.status,
            step_type: step.step_type,
            last_error: step.last_error,
            tool_calls,
        }
    }
}

#[derive(Deserialize)]
struct WireMessage {
    id: String,
    role: Role,
    #[serde(default)]
    created_at: i64,
    #[serde(default)]
    content: Vec<Value>,
}

impl WireMessage {
    fn into_message(self) -> Option<AgentMessage> {
        let text: Vec<&str> = self
            .content
            .iter()
            .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|part| part.pointer("/text/value").and_then(Value::as_str))
            .collect();
        if text.is_empty() {
            return None;
        }
        Some(AgentMessage {
            id: self.id,
            role: self.role,
            content: text.join("\n"),
            created_at: timestamp(self.created_at),
        })
    }
}
