use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use grounded_core::agent::{AgentHandle, AgentMessage, AgentRun, AgentService, RunStatus, RunStep};
use grounded_core::config::ConfigProvider;
use grounded_core::errors::GatewayError;
use grounded_core::messages::{Message, Role};
use grounded_core::tools::ToolResult;

use crate::accumulator::{parse_raw_calls, MalformedToolCall};
use crate::error::OrchestratorError;
use crate::executor::ToolExecutor;

/// Reply used when a completed run left no assistant message behind.
pub const NO_REPLY_TEXT: &str = "Sorry, no answer could be retrieved for this request.";

/// A run that reached `completed`, plus what the caller needs from it.
#[derive(Clone, Debug)]
pub struct CompletedRun {
    pub run: AgentRun,
    pub reply: String,
    pub steps: Vec<RunStep>,
    pub tool_results: Vec<ToolResult>,
    pub malformed_calls: Vec<MalformedToolCall>,
}

/// Drives one managed agent run: submit, poll, answer `requires_action`
/// with locally executed tools, and collect the reply.
pub struct AgentRunCoordinator {
    service: Arc<dyn AgentService>,
    executor: Arc<dyn ToolExecutor>,
    config: Arc<dyn ConfigProvider>,
}

#[derive(Default)]
struct PollLog {
    tool_results: Vec<ToolResult>,
    malformed: Vec<MalformedToolCall>,
}

impl AgentRunCoordinator {
    pub fn new(
        service: Arc<dyn AgentService>,
        executor: Arc<dyn ToolExecutor>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            service,
            executor,
            config,
        }
    }

    /// Start a run on a fresh thread seeded with `conversation`.
    #[instrument(skip_all, fields(agent_id = %agent.id, messages = conversation.len()))]
    pub async fn submit(
        &self,
        agent: &AgentHandle,
        conversation: &[Message],
    ) -> Result<AgentRun, OrchestratorError> {
        let run = self
            .service
            .create_run(agent, conversation)
            .await
            .map_err(OrchestratorError::AgentService)?;
        info!(run_id = %run.id, thread_id = %run.thread_id, "agent run submitted");
        Ok(run)
    }

    /// Poll until the run is terminal. Exceeding the configured poll timeout
    /// is an [`OrchestratorError::AgentTimeout`]; the run is never reported
    /// as finished when it was not.
    pub async fn await_completion(
        &self,
        run: AgentRun,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, OrchestratorError> {
        let mut log = PollLog::default();
        self.await_terminal(run, cancel, &mut log).await
    }

    /// Submit, wait, and gather the reply. A run ending in anything but
    /// `completed` becomes [`OrchestratorError::AgentRunFailed`].
    #[instrument(skip_all, fields(agent_id = %agent.id))]
    pub async fn run_to_completion(
        &self,
        agent: &AgentHandle,
        conversation: &[Message],
        cancel: &CancellationToken,
    ) -> Result<CompletedRun, OrchestratorError> {
        let run = self.submit(agent, conversation).await?;
        let mut log = PollLog::default();
        let run = self.await_terminal(run, cancel, &mut log).await?;

        let steps = match self.service.list_run_steps(&run.thread_id, &run.id).await {
            Ok(steps) => steps,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "could not list run steps");
                Vec::new()
            }
        };

        if run.status != RunStatus::Completed {
            let details = failure_details(&run, &steps);
            warn!(run_id = %run.id, status = run.status.as_str(), details = %details, "agent run did not complete");
            return Err(OrchestratorError::AgentRunFailed {
                run_id: run.id,
                status: run.status,
                details,
            });
        }

        let messages = self
            .service
            .list_messages(&run.thread_id)
            .await
            .map_err(OrchestratorError::AgentService)?;
        let reply = latest_reply(&messages, &run).unwrap_or_else(|| {
            warn!(run_id = %run.id, "no assistant reply found for run");
            NO_REPLY_TEXT.to_string()
        });

        Ok(CompletedRun {
            run,
            reply,
            steps,
            tool_results: log.tool_results,
            malformed_calls: log.malformed,
        })
    }

    async fn await_terminal(
        &self,
        run: AgentRun,
        cancel: &CancellationToken,
        log: &mut PollLog,
    ) -> Result<AgentRun, OrchestratorError> {
        let limit = self.config.agent_poll_timeout();
        let run_id = run.id.clone();
        match tokio::time::timeout(limit, self.poll(run, cancel, log)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(run_id = %run_id, waited_ms = limit.as_millis() as u64, "agent run timed out");
                Err(OrchestratorError::AgentTimeout {
                    run_id,
                    waited: limit,
                })
            }
        }
    }

    #[instrument(skip_all, fields(run_id = %run.id, thread_id = %run.thread_id))]
    async fn poll(
        &self,
        mut run: AgentRun,
        cancel: &CancellationToken,
        log: &mut PollLog,
    ) -> Result<AgentRun, OrchestratorError> {
        let interval = self.config.agent_poll_interval();
        // Call ids of the last action answered, so a stale `requires_action`
        // read is not answered twice.
        let mut answered: Option<Vec<String>> = None;

        loop {
            if run.status.is_terminal() {
                debug!(status = run.status.as_str(), "agent run finished");
                return Ok(run);
            }

            if run.status == RunStatus::RequiresAction {
                let ids: Vec<String> = run.required_tool_calls.iter().map(|c| c.id.clone()).collect();
                if answered.as_ref() != Some(&ids) {
                    let outputs = self.resolve_action(&run, cancel, log).await?;
                    run = cancellable(
                        cancel,
                        self.service.submit_tool_outputs(&run.thread_id, &run.id, &outputs),
                    )
                    .await?;
                    answered = Some(ids);
                    continue;
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            }
            run = cancellable(cancel, self.service.get_run(&run.thread_id, &run.id)).await?;
        }
    }

    /// Execute every call the run is waiting on as one batch. Results come
    /// back in the order the service listed the calls.
    async fn resolve_action(
        &self,
        run: &AgentRun,
        cancel: &CancellationToken,
        log: &mut PollLog,
    ) -> Result<Vec<ToolResult>, OrchestratorError> {
        let drained = parse_raw_calls(&run.required_tool_calls);
        info!(
            calls = drained.calls.len(),
            malformed = drained.malformed.len(),
            "agent run requires action"
        );

        let mut outputs = self.executor.execute(drained.calls, cancel).await;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        outputs.extend(drained.malformed.iter().map(MalformedToolCall::to_result));
        outputs.sort_by_key(|r| {
            run.required_tool_calls
                .iter()
                .position(|c| c.id == r.tool_call_id.as_str())
                .unwrap_or(usize::MAX)
        });

        log.tool_results.extend(outputs.iter().cloned());
        log.malformed.extend(drained.malformed);
        Ok(outputs)
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, OrchestratorError> {
    tokio::select! {
        r = fut => r.map_err(OrchestratorError::AgentService),
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
    }
}

/// Newest non-empty assistant message written since the run started.
fn latest_reply(messages: &[AgentMessage], run: &AgentRun) -> Option<String> {
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant && m.created_at >= run.created_at)
        .filter(|m| !m.content.trim().is_empty())
        .max_by_key(|m| m.created_at)
        .map(|m| m.content.clone())
}

/// Human-readable reasons for a failed run: the run's own error first, then
/// every failed step's error.
pub fn failure_details(run: &AgentRun, steps: &[RunStep]) -> String {
    let mut parts = Vec::new();
    if let Some(e) = &run.last_error {
        parts.push(format!("{}: {}", e.code, e.message));
    }
    for step in steps.iter().filter(|s| s.status == "failed") {
        match &step.last_error {
            Some(e) => parts.push(format!("step {} ({}): {}: {}", step.id, step.step_type, e.code, e.message)),
            None => parts.push(format!("step {} ({}) failed", step.id, step.step_type)),
        }
    }
    if parts.is_empty() {
        "no error details reported".to_string()
    } else {
        parts.join("; ")
    }
}
