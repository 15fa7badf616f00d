use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, error, instrument, warn};

use grounded_core::config::ConfigProvider;
use grounded_core::tools::{
    Tool, ToolCall, ToolContext, ToolDefinition, ToolError, ToolResult,
};

use super::ToolExecutor;
use crate::registry::ToolRegistry;

/// Dispatches calls to tools in a [`ToolRegistry`]. Each call runs on its
/// own task under the configured per-call timeout. Tasks are aborted when
/// the token fires or when the `execute` future is dropped.
pub struct LocalToolExecutor {
    registry: Arc<ToolRegistry>,
    config: Arc<dyn ConfigProvider>,
}

impl LocalToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, config: Arc<dyn ConfigProvider>) -> Self {
        Self { registry, config }
    }
}

#[async_trait]
impl ToolExecutor for LocalToolExecutor {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.registry.definitions()
    }

    #[instrument(skip_all, fields(calls = calls.len()))]
    async fn execute(&self, calls: Vec<ToolCall>, cancel: &CancellationToken) -> Vec<ToolResult> {
        let timeout = self.config.tool_timeout();
        let runs = calls.into_iter().map(|call| {
            let tool = self.registry.get(&call.name);
            run_one(tool, call, timeout, cancel.clone())
        });
        join_all(runs).await
    }
}

async fn run_one(
    tool: Option<Arc<dyn Tool>>,
    call: ToolCall,
    timeout: Duration,
    cancel: CancellationToken,
) -> ToolResult {
    let start = Instant::now();
    let Some(tool) = tool else {
        warn!(tool = %call.name, tool_call_id = %call.id, "unknown tool requested");
        return ToolResult::failure(&call, &ToolError::UnknownTool(call.name.clone()), start.elapsed());
    };

    let ctx = ToolContext {
        tool_call_id: call.id.clone(),
        cancel: cancel.child_token(),
    };
    let task_ctx = ctx.clone();
    let args = call.arguments.clone();
    let mut handle = AbortOnDropHandle::new(tokio::spawn(async move {
        tokio::time::timeout(
            timeout,
            AssertUnwindSafe(tool.execute(args, &task_ctx)).catch_unwind(),
        )
        .await
    }));

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = cancel.cancelled() => {
            ctx.cancel.cancel();
            handle.abort();
            debug!(tool = %call.name, "tool call cancelled");
            return ToolResult::failure(&call, &ToolError::Cancelled, start.elapsed());
        }
    };
    let duration = start.elapsed();

    match joined {
        Ok(Ok(Ok(Ok(output)))) => ToolResult {
            is_error: output.is_error,
            ..ToolResult::success(&call, output.content, duration)
        },
        Ok(Ok(Ok(Err(e)))) => {
            warn!(tool = %call.name, error_kind = e.error_kind(), error = %e, "tool failed");
            ToolResult::failure(&call, &e, duration)
        }
        Ok(Ok(Err(panic))) => {
            error!(tool = %call.name, panic = %panic_message(&panic), "tool panicked during execution");
            ToolResult::failure(&call, &ToolError::Panicked, duration)
        }
        Ok(Err(_)) => {
            warn!(tool = %call.name, timeout_ms = timeout.as_millis() as u64, "tool timed out");
            ToolResult::failure(&call, &ToolError::Timeout(timeout), duration)
        }
        Err(join_err) => {
            error!(tool = %call.name, error = %join_err, "tool task failed");
            ToolResult::failure(
                &call,
                &ToolError::ExecutionFailed("tool task failed".into()),
                duration,
            )
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use grounded_core::config::Settings;
    use grounded_core::ids::ToolCallId;
    use grounded_core::tools::ToolOutput;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the query"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Ok(ToolOutput::text(args["query"].as_str().unwrap_or_default()))
        }
    }

    struct FailTool;

    #[async_trait]
    impl Tool for FailTool {
        fn name(&self) -> &str {
            "fail"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            Err(ToolError::ExecutionFailed("backend unavailable".into()))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl Tool for PanicTool {
        fn name(&self) -> &str {
            "panic"
        }
        fn description(&self) -> &str {
            "Panics"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            panic!("boom");
        }
    }

    struct SlowTool;

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps for a long time"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(ToolOutput::text("late"))
        }
    }

    fn executor(timeout_ms: u64) -> LocalToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(FailTool));
        registry.register(Arc::new(PanicTool));
        registry.register(Arc::new(SlowTool));
        let settings = Settings {
            tool_timeout_ms: timeout_ms,
            ..Settings::default()
        };
        LocalToolExecutor::new(Arc::new(registry), Arc::new(settings))
    }

    fn call(id: &str, name: &str) -> ToolCall {
        ToolCall {
            id: ToolCallId::from_raw(id),
            name: name.into(),
            arguments: json!({"query": id}),
        }
    }

    #[tokio::test]
    async fn one_failure_is_isolated() {
        let calls = vec![
            call("call_1", "echo"),
            call("call_2", "fail"),
            call("call_3", "echo"),
            call("call_4", "echo"),
        ];
        let results = executor(1_000).execute(calls, &CancellationToken::new()).await;

        assert_eq!(results.len(), 4);
        assert_eq!(results.iter().filter(|r| r.is_error).count(), 1);
        assert!(results[1].is_error);
        assert!(results[1].output.contains("backend unavailable"));
        let ids: Vec<_> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3", "call_4"]);
        assert_eq!(results[3].output, "call_4");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let results = executor(1_000)
            .execute(vec![call("call_1", "nope")], &CancellationToken::new())
            .await;
        assert!(results[0].is_error);
        assert_eq!(results[0].output, "unknown tool: nope");
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let results = executor(1_000)
            .execute(
                vec![call("call_1", "panic"), call("call_2", "echo")],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(results[0].output, "internal error: tool crashed");
        assert!(!results[1].is_error);
    }

    #[tokio::test]
    async fn timeout_comes_from_config() {
        tokio::time::pause();
        let results = executor(50)
            .execute(
                vec![call("call_1", "slow"), call("call_2", "echo")],
                &CancellationToken::new(),
            )
            .await;
        assert!(results[0].is_error);
        assert_eq!(results[0].output, "timed out after 0.05s");
        assert!(!results[1].is_error);
    }

    #[tokio::test]
    async fn cancellation_reaches_in_flight_calls() {
        tokio::time::pause();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let results = executor(60_000)
            .execute(vec![call("call_1", "slow")], &cancel)
            .await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_error);
        assert_eq!(results[0].output, "cancelled");
    }

    struct CountingTool {
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for CountingTool {
        fn name(&self) -> &str {
            "counting"
        }
        fn description(&self) -> &str {
            "Sleeps, then records that it finished"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<ToolOutput, ToolError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text("done"))
        }
    }

    #[tokio::test]
    async fn dropping_execute_aborts_tool_tasks() {
        tokio::time::pause();
        let finished = Arc::new(AtomicUsize::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CountingTool {
            finished: finished.clone(),
        }));
        let executor = LocalToolExecutor::new(Arc::new(registry), Arc::new(Settings::default()));
        let cancel = CancellationToken::new();

        tokio::select! {
            _ = executor.execute(vec![call("call_1", "counting")], &cancel) => {
                panic!("tool should still be sleeping");
            }
            _ = tokio::time::sleep(Duration::from_millis(10)) => {}
        }
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
