use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use tracing::{debug, warn};

use grounded_core::tools::{Tool, ToolContext, ToolError, ToolOutput};

pub const TOOL_NAME: &str = "search_internal_documents";
const DEFAULT_TOP: u64 = 5;

/// Searches the internal document index through an HTTP search proxy.
///
/// Failures are reported to the model as `{"error": .., "results": []}` so
/// it can say the search failed instead of inventing sources. Requests carry
/// no client-side timeout; the executor's per-call deadline bounds them.
pub struct SearchProxyTool {
    client: reqwest::Client,
    url: String,
    key: Option<SecretString>,
    default_top: u64,
}

impl SearchProxyTool {
    pub fn new(url: impl Into<String>, key: Option<SecretString>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("grounded/0.1")
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
            key,
            default_top: DEFAULT_TOP,
        }
    }

    pub fn with_default_top(mut self, top: u64) -> Self {
        self.default_top = top.max(1);
        self
    }

    async fn search(&self, query: &str, top: u64, filters: Option<&Value>) -> Result<Value, String> {
        let mut body = json!({"query": query, "top": top});
        if let Some(filters) = filters {
            body["filters"] = filters.clone();
        }

        let mut request = self.client.post(&self.url).json(&body);
        if let Some(key) = &self.key {
            request = request.header("x-functions-key", key.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("search proxy request failed: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!(
                "search proxy failed with status {}: {text}",
                status.as_u16()
            ));
        }
        response
            .json::<Value>()
            .await
            .map_err(|e| format!("search proxy returned invalid JSON: {e}"))
    }
}

#[async_trait]
impl Tool for SearchProxyTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Search internal company documents and knowledge base"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["query"],
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search query text to find relevant documents"
                },
                "top": {
                    "type": "integer",
                    "description": "Maximum number of results to return (default: 5)",
                    "default": DEFAULT_TOP
                },
                "filters": {
                    "type": "object",
                    "description": "Optional search filters",
                    "additionalProperties": true
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
        let query = args["query"]
            .as_str()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ToolError::InvalidArguments("missing required parameter: query".into()))?;
        let top = args["top"].as_u64().filter(|t| *t > 0).unwrap_or(self.default_top);
        let filters = args.get("filters").filter(|f| f.is_object());

        debug!(query, top, "searching internal documents");
        let outcome = tokio::select! {
            r = self.search(query, top, filters) => r,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Cancelled),
        };

        match outcome {
            Ok(results) => Ok(ToolOutput::text(results.to_string())),
            Err(message) => {
                warn!(error = %message, "internal document search failed");
                Ok(ToolOutput::error(
                    json!({"error": message, "results": []}).to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounded_core::ids::ToolCallId;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{body_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> ToolContext {
        ToolContext {
            tool_call_id: ToolCallId::from_raw("call_1"),
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn posts_query_with_function_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("x-functions-key", "proxy-key"))
            .and(body_json(json!({"query": "vacation policy", "top": 3, "filters": {"dept": "hr"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{"title": "Leave rules", "url": "https://intra.example/leave"}],
                "count": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let tool = SearchProxyTool::new(server.uri(), Some(SecretString::from("proxy-key")));
        let out = tool
            .execute(
                json!({"query": "vacation policy", "top": 3, "filters": {"dept": "hr"}}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(!out.is_error);
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["count"], 1);
    }

    #[tokio::test]
    async fn default_top_applies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!({"query": "q", "top": 5})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"results": []})))
            .expect(1)
            .mount(&server)
            .await;

        let tool = SearchProxyTool::new(server.uri(), None);
        let out = tool.execute(json!({"query": "q"}), &ctx()).await.unwrap();
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn upstream_failure_becomes_error_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("index offline"))
            .mount(&server)
            .await;

        let tool = SearchProxyTool::new(server.uri(), None);
        let out = tool.execute(json!({"query": "q"}), &ctx()).await.unwrap();
        assert!(out.is_error);
        let parsed: Value = serde_json::from_str(&out.content).unwrap();
        assert_eq!(parsed["results"], json!([]));
        assert!(parsed["error"].as_str().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn slow_proxy_runs_until_the_caller_stops_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"results": []}))
                    .set_delay(std::time::Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let tool = SearchProxyTool::new(server.uri(), None);
        let ctx = ctx();
        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = tool.execute(json!({"query": "q"}), &ctx).await.unwrap_err();
        assert!(matches!(err, ToolError::Cancelled));
    }

    #[tokio::test]
    async fn missing_query_is_invalid() {
        let tool = SearchProxyTool::new("http://unused.invalid", None);
        let err = tool.execute(json!({"top": 2}), &ctx()).await.unwrap_err();
        assert!(matches!(err, ToolError::InvalidArguments(_)));
    }
}
