use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use grounded_core::agent::{
    AgentDefinition, AgentHandle, AgentMessage, AgentRun, AgentService, RunError, RunStatus,
    RunStep,
};
use grounded_core::errors::GatewayError;
use grounded_core::ids::{AgentId, RunId, ThreadId};
use grounded_core::messages::Message;
use grounded_core::provider::RawToolCall;
use grounded_core::tools::ToolResult;

/// What one `get_run` poll reports.
#[derive(Clone, Debug)]
pub struct MockRunState {
    pub status: RunStatus,
    pub required_tool_calls: Vec<RawToolCall>,
    pub last_error: Option<RunError>,
}

impl MockRunState {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status,
            required_tool_calls: Vec::new(),
            last_error: None,
        }
    }

    pub fn requires_action(calls: Vec<RawToolCall>) -> Self {
        Self {
            status: RunStatus::RequiresAction,
            required_tool_calls: calls,
            last_error: None,
        }
    }

    pub fn failed(code: &str, message: &str) -> Self {
        Self {
            status: RunStatus::Failed,
            required_tool_calls: Vec::new(),
            last_error: Some(RunError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Scripted agent service. `get_run` walks the scripted states in order and
/// keeps reporting the last one once the script runs out.
pub struct MockAgentService {
    states: Mutex<VecDeque<MockRunState>>,
    last_state: Mutex<Option<MockRunState>>,
    steps: Vec<RunStep>,
    messages: Vec<AgentMessage>,
    create_run_error: Option<GatewayError>,
    submissions: Mutex<Vec<Vec<ToolResult>>>,
    conversations: Mutex<Vec<Vec<Message>>>,
    polls: AtomicUsize,
    agents_created: AtomicUsize,
}

impl MockAgentService {
    pub fn new(states: Vec<MockRunState>) -> Self {
        Self {
            states: Mutex::new(states.into()),
            last_state: Mutex::new(None),
            steps: Vec::new(),
            messages: Vec::new(),
            create_run_error: None,
            submissions: Mutex::new(Vec::new()),
            conversations: Mutex::new(Vec::new()),
            polls: AtomicUsize::new(0),
            agents_created: AtomicUsize::new(0),
        }
    }

    pub fn with_steps(mut self, steps: Vec<RunStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_messages(mut self, messages: Vec<AgentMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn failing_create_run(mut self, error: GatewayError) -> Self {
        self.create_run_error = Some(error);
        self
    }

    /// Every `submit_tool_outputs` batch, in call order.
    pub fn submissions(&self) -> Vec<Vec<ToolResult>> {
        self.submissions.lock().clone()
    }

    /// Conversations passed to `create_run`.
    pub fn conversations(&self) -> Vec<Vec<Message>> {
        self.conversations.lock().clone()
    }

    pub fn poll_count(&self) -> usize {
        self.polls.load(Ordering::Relaxed)
    }

    pub fn agents_created(&self) -> usize {
        self.agents_created.load(Ordering::Relaxed)
    }

    fn run(state: MockRunState) -> AgentRun {
        AgentRun {
            id: RunId::from_raw("run_mock"),
            thread_id: ThreadId::from_raw("thread_mock"),
            status: state.status,
            required_tool_calls: state.required_tool_calls,
            last_error: state.last_error,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
impl AgentService for MockAgentService {
    async fn create_agent(&self, definition: &AgentDefinition) -> Result<AgentHandle, GatewayError> {
        let n = self.agents_created.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(AgentHandle {
            id: AgentId::from_raw(format!("asst_mock_{n}")),
            key: definition.key.clone(),
        })
    }

    async fn create_run(
        &self,
        _agent: &AgentHandle,
        conversation: &[Message],
    ) -> Result<AgentRun, GatewayError> {
        if let Some(e) = &self.create_run_error {
            return Err(e.clone());
        }
        self.conversations.lock().push(conversation.to_vec());
        Ok(Self::run(MockRunState::status(RunStatus::Queued)))
    }

    async fn get_run(&self, _thread_id: &ThreadId, _run_id: &RunId) -> Result<AgentRun, GatewayError> {
        self.polls.fetch_add(1, Ordering::Relaxed);
        let next = self.states.lock().pop_front();
        let mut last = self.last_state.lock();
        let state = match next {
            Some(state) => {
                *last = Some(state.clone());
                state
            }
            None => last
                .clone()
                .unwrap_or_else(|| MockRunState::status(RunStatus::Running)),
        };
        Ok(Self::run(state))
    }

    async fn submit_tool_outputs(
        &self,
        _thread_id: &ThreadId,
        _run_id: &RunId,
        outputs: &[ToolResult],
    ) -> Result<AgentRun, GatewayError> {
        self.submissions.lock().push(outputs.to_vec());
        Ok(Self::run(MockRunState::status(RunStatus::Queued)))
    }

    async fn list_run_steps(
        &self,
        _thread_id: &ThreadId,
        _run_id: &RunId,
    ) -> Result<Vec<RunStep>, GatewayError> {
        Ok(self.steps.clone())
    }

    async fn list_messages(&self, _thread_id: &ThreadId) -> Result<Vec<AgentMessage>, GatewayError> {
        Ok(self.messages.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeats_last_state_when_script_runs_out() {
        let svc = MockAgentService::new(vec![
            MockRunState::status(RunStatus::Running),
            MockRunState::status(RunStatus::Completed),
        ]);
        let (t, r) = (ThreadId::from_raw("t"), RunId::from_raw("r"));
        assert_eq!(svc.get_run(&t, &r).await.unwrap().status, RunStatus::Running);
        assert_eq!(svc.get_run(&t, &r).await.unwrap().status, RunStatus::Completed);
        assert_eq!(svc.get_run(&t, &r).await.unwrap().status, RunStatus::Completed);
        assert_eq!(svc.poll_count(), 3);
    }

    #[tokio::test]
    async fn empty_script_reports_running() {
        let svc = MockAgentService::new(vec![]);
        let run = svc
            .get_run(&ThreadId::from_raw("t"), &RunId::from_raw("r"))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }
}
