use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use grounded_core::config::ConfigProvider;
use grounded_core::tools::{ToolCall, ToolDefinition, ToolError, ToolResult};

use super::ToolExecutor;

/// Posts each call to a remote tool endpoint as `{toolName, arguments}` and
/// expects `{output}` back.
pub struct RemoteToolExecutor {
    client: reqwest::Client,
    endpoint: String,
    function_key: Option<SecretString>,
    definitions: Vec<ToolDefinition>,
    config: Arc<dyn ConfigProvider>,
}

#[derive(Deserialize)]
struct RemoteResponse {
    #[serde(default)]
    output: Value,
}

impl RemoteToolExecutor {
    pub fn new(
        endpoint: impl Into<String>,
        definitions: Vec<ToolDefinition>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            function_key: None,
            definitions,
            config,
        }
    }

    /// Sent as `x-functions-key` on every request.
    pub fn with_function_key(mut self, key: SecretString) -> Self {
        self.function_key = Some(key);
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn post(&self, call: &ToolCall) -> Result<String, ToolError> {
        let mut request = self.client.post(&self.endpoint).json(&json!({
            "toolName": call.name,
            "arguments": call.arguments,
        }));
        if let Some(key) = &self.function_key {
            request = request.header("x-functions-key", key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("request failed: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("reading response: {e}")))?;
        if !status.is_success() {
            return Err(ToolError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RemoteResponse = serde_json::from_str(&body)
            .map_err(|e| ToolError::ExecutionFailed(format!("invalid response body: {e}")))?;
        Ok(match parsed.output {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        })
    }

    async fn run_one(&self, call: ToolCall, cancel: &CancellationToken) -> ToolResult {
        let timeout = self.config.tool_timeout();
        let start = Instant::now();
        // Dropping the request future on cancel or timeout aborts it locally;
        // the endpoint may still finish the work.
        let outcome = tokio::select! {
            r = tokio::time::timeout(timeout, self.post(&call)) => r,
            _ = cancel.cancelled() => Ok(Err(ToolError::Cancelled)),
        };
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(output)) => ToolResult::success(&call, output, duration),
            Ok(Err(e)) => {
                warn!(tool = %call.name, error_kind = e.error_kind(), error = %e, "remote tool failed");
                ToolResult::failure(&call, &e, duration)
            }
            Err(_) => {
                warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "remote tool timed out");
                ToolResult::failure(&call, &ToolError::Timeout(timeout), duration)
            }
        }
    }
}

#[async_trait]
impl ToolExecutor for RemoteToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    #[instrument(skip_all, fields(calls = calls.len(), endpoint = %self.endpoint))]
    async fn execute(&self, calls: Vec<ToolCall>, cancel: &CancellationToken) -> Vec<ToolResult> {
        join_all(calls.into_iter().map(|call| self.run_one(call, cancel))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use grounded_core::config::Settings;
    use grounded_core::ids::ToolCallId;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor(server: &MockServer, timeout_ms: u64) -> RemoteToolExecutor {
        let settings = Settings {
            tool_timeout_ms: timeout_ms,
            ..Settings::default()
        };
        RemoteToolExecutor::new(format!("{}/tools", server.uri()), vec![], Arc::new(settings))
    }

    fn call(id: &str, query: &str) -> ToolCall {
        ToolCall {
            id: ToolCallId::from_raw(id),
            name: "search_web".into(),
            arguments: json!({"query": query}),
        }
    }

    #[tokio::test]
    async fn posts_name_and_arguments() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tools"))
            .and(header("x-functions-key", "fn-key"))
            .and(body_partial_json(json!({
                "toolName": "search_web",
                "arguments": {"query": "Tokyo weather"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": "18C"})))
            .expect(1)
            .mount(&server)
            .await;

        let results = executor(&server, 5_000)
            .with_function_key(SecretString::from("fn-key"))
            .execute(vec![call("call_1", "Tokyo weather")], &CancellationToken::new())
            .await;
        assert_eq!(results[0].output, "18C");
        assert!(!results[0].is_error);
    }

    #[tokio::test]
    async fn structured_output_is_serialized() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": {"results": [{"url": "https://a.example"}]}})),
            )
            .mount(&server)
            .await;

        let results = executor(&server, 5_000)
            .execute(vec![call("call_1", "q")], &CancellationToken::new())
            .await;
        let parsed: Value = serde_json::from_str(&results[0].output).unwrap();
        assert_eq!(parsed["results"][0]["url"], "https://a.example");
    }

    #[tokio::test]
    async fn non_success_embeds_upstream_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"arguments": {"query": "bad"}})))
            .respond_with(ResponseTemplate::new(502).set_body_string("gateway down"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({"arguments": {"query": "good"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"output": "ok"})))
            .mount(&server)
            .await;

        let results = executor(&server, 5_000)
            .execute(
                vec![call("call_1", "bad"), call("call_2", "good")],
                &CancellationToken::new(),
            )
            .await;
        assert!(results[0].is_error);
        assert_eq!(results[0].output, "upstream returned HTTP 502: gateway down");
        assert!(!results[1].is_error);
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"output": "late"}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let results = executor(&server, 100)
            .execute(vec![call("call_1", "q")], &CancellationToken::new())
            .await;
        assert!(results[0].is_error);
        assert_eq!(results[0].output, "timed out after 0.1s");
    }

    #[tokio::test]
    async fn cancelled_before_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let results = executor(&server, 10_000)
            .execute(vec![call("call_1", "q")], &cancel)
            .await;
        assert_eq!(results[0].output, "cancelled");
    }
}
