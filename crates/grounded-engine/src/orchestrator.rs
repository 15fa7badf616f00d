use std::future::Future;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, instrument, warn};

use grounded_core::agent::{AgentDefinition, AgentService};
use grounded_core::config::ConfigProvider;
use grounded_core::errors::GatewayError;
use grounded_core::ids::{ExchangeId, RunId, ThreadId};
use grounded_core::messages::{sanitize_history, Message};
use grounded_core::provider::{ChatProvider, ChatRequest, SamplingParams};
use grounded_core::stream::{DeltaStream, StreamEvent};
use grounded_core::tools::{ToolCall, ToolResult};
use grounded_llm::TokenStreamReader;

use crate::accumulator::{parse_raw_calls, MalformedToolCall, ToolCallAccumulator};
use crate::cache::AgentCache;
use crate::citations::{render, Citation, CitationNormalizer};
use crate::coordinator::AgentRunCoordinator;
use crate::error::{ExchangeStatus, OrchestratorError};
use crate::executor::ToolExecutor;

/// Result of a finished exchange.
#[derive(Clone, Debug, Serialize)]
pub struct CompletionOutcome {
    pub exchange_id: ExchangeId,
    pub content: String,
    pub citations: Vec<Citation>,
    pub citations_html: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<ThreadId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub malformed_calls: Vec<MalformedToolCall>,
}

/// What callers get back from an exchange, success or not.
#[derive(Clone, Debug, Serialize)]
pub struct ExchangeReport {
    pub status: ExchangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CompletionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl ExchangeReport {
    pub fn from_result(result: Result<CompletionOutcome, OrchestratorError>) -> Self {
        match result {
            Ok(outcome) => Self {
                status: ExchangeStatus::Success,
                outcome: Some(outcome),
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                status: e.status(),
                outcome: None,
                error: Some(e.to_string()),
                error_kind: Some(e.error_kind()),
            },
        }
    }
}

/// One item of a streamed exchange.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamChunk {
    Text(String),
    /// Sent once, after the last text chunk, when the exchange found sources.
    Citations {
        citations: Vec<Citation>,
        html: String,
    },
    /// Tool calls dropped because their arguments never parsed. Sent once,
    /// before tools run on the direct path and after the text on the agent
    /// path.
    MalformedCalls(Vec<MalformedToolCall>),
}

/// Managed-agent path: the agent runs tools itself and is polled for the
/// answer instead of streaming it.
struct AgentBackend {
    service: Arc<dyn AgentService>,
    coordinator: AgentRunCoordinator,
    cache: Arc<AgentCache>,
    definition: AgentDefinition,
}

/// Drives one exchange end to end: send the conversation, collect tool
/// calls, execute them, resubmit, and normalize citations.
#[derive(Clone)]
pub struct ConversationOrchestrator {
    provider: Arc<dyn ChatProvider>,
    executor: Arc<dyn ToolExecutor>,
    config: Arc<dyn ConfigProvider>,
    normalizer: Arc<CitationNormalizer>,
    agent: Option<Arc<AgentBackend>>,
    system_prompt: Option<String>,
    sampling: SamplingParams,
}

impl ConversationOrchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        executor: Arc<dyn ToolExecutor>,
        config: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            provider,
            executor,
            config,
            normalizer: Arc::new(CitationNormalizer::default()),
            agent: None,
            system_prompt: None,
            sampling: SamplingParams::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingParams) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_citations(mut self, normalizer: CitationNormalizer) -> Self {
        self.normalizer = Arc::new(normalizer);
        self
    }

    /// Route exchanges through a managed agent. `cache` is shared with other
    /// orchestrators built by the same caller.
    pub fn with_agent(
        mut self,
        service: Arc<dyn AgentService>,
        cache: Arc<AgentCache>,
        definition: AgentDefinition,
    ) -> Self {
        let coordinator = AgentRunCoordinator::new(
            Arc::clone(&service),
            Arc::clone(&self.executor),
            Arc::clone(&self.config),
        );
        self.agent = Some(Arc::new(AgentBackend {
            service,
            coordinator,
            cache,
            definition,
        }));
        self
    }

    pub fn streaming_enabled(&self) -> bool {
        self.config.streaming_enabled()
    }

    pub fn sampling(&self) -> &SamplingParams {
        &self.sampling
    }

    /// Run the exchange to completion and return the final answer.
    #[instrument(skip_all, fields(exchange_id = tracing::field::Empty, messages = messages.len()))]
    pub async fn complete_blocking(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> Result<CompletionOutcome, OrchestratorError> {
        let exchange_id = ExchangeId::new();
        tracing::Span::current().record("exchange_id", tracing::field::display(&exchange_id));
        let messages = sanitize_history(messages, self.system_prompt.as_deref());

        if let Some(agent) = &self.agent {
            return self.run_agent(agent, exchange_id, &messages, cancel).await;
        }

        let request = ChatRequest::new(messages.clone())
            .with_tools(self.executor.definitions())
            .with_sampling(self.sampling.clone());
        let response = transport(cancel, self.provider.create_chat_blocking(&request)).await?;

        let drained = parse_raw_calls(&response.tool_calls);
        let first_text = response.content.unwrap_or_default();
        if drained.calls.is_empty() {
            debug!("no tool calls, exchange done");
            return Ok(self.outcome(exchange_id, first_text, Vec::new(), drained.malformed));
        }

        let (follow_up, results) = self
            .execute_tools(&messages, &first_text, drained.calls, cancel)
            .await?;
        let citations = self.citations_from_results(&results);

        let response = transport(cancel, self.provider.create_chat_blocking(&follow_up)).await?;
        if !response.tool_calls.is_empty() {
            warn!(calls = response.tool_calls.len(), "tool calls in follow-up response ignored");
        }
        Ok(self.outcome(
            exchange_id,
            response.content.unwrap_or_default(),
            citations,
            drained.malformed,
        ))
    }

    /// Stream the exchange. Text from the first response and from the
    /// follow-up after tool execution arrives as one continuous sequence.
    /// An error item is terminal. Dropping the stream cancels in-flight
    /// tool calls.
    pub fn complete_streaming(
        &self,
        messages: Vec<Message>,
        cancel: &CancellationToken,
    ) -> BoxStream<'static, Result<StreamChunk, OrchestratorError>> {
        let exchange_id = ExchangeId::new();
        info!(exchange_id = %exchange_id, messages = messages.len(), "streaming exchange started");
        let cancel = cancel.child_token();
        let exchange = Exchange {
            orchestrator: self.clone(),
            exchange_id,
            messages: sanitize_history(messages, self.system_prompt.as_deref()),
            _guard: cancel.clone().drop_guard(),
            cancel,
            phase: Phase::Start,
        };
        stream::unfold(exchange, |mut exchange| async move {
            let item = exchange.advance().await?;
            Some((item, exchange))
        })
        .boxed()
    }

    async fn run_agent(
        &self,
        agent: &AgentBackend,
        exchange_id: ExchangeId,
        messages: &[Message],
        cancel: &CancellationToken,
    ) -> Result<CompletionOutcome, OrchestratorError> {
        let handle = agent
            .cache
            .get_or_create(&agent.definition, agent.service.as_ref())
            .await
            .map_err(OrchestratorError::AgentService)?;
        let done = agent
            .coordinator
            .run_to_completion(&handle, messages, cancel)
            .await?;

        let payloads: Vec<Value> = done
            .steps
            .iter()
            .flat_map(|s| s.tool_calls.iter().cloned())
            .collect();
        let citations = self.normalizer.extract(&payloads);
        let mut outcome = self.outcome(exchange_id, done.reply, citations, done.malformed_calls);
        outcome.run_id = Some(done.run.id);
        outcome.thread_id = Some(done.run.thread_id);
        Ok(outcome)
    }

    /// Execute `calls` and build the follow-up request. The follow-up carries
    /// no tool definitions: one tool round per exchange.
    async fn execute_tools(
        &self,
        messages: &[Message],
        first_text: &str,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) -> Result<(ChatRequest, Vec<ToolResult>), OrchestratorError> {
        info!(calls = calls.len(), "executing tool calls");
        let results = self.executor.execute(calls.clone(), cancel).await;
        if cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        let failed = results.iter().filter(|r| r.is_error).count();
        if failed > 0 {
            warn!(failed, total = results.len(), "some tool calls failed, resubmitting anyway");
        }

        let mut follow_up = messages.to_vec();
        follow_up.push(Message::assistant_tool_calls(first_text, calls));
        follow_up.extend(results.iter().map(Message::from));
        let request = ChatRequest::new(follow_up).with_sampling(self.sampling.clone());
        Ok((request, results))
    }

    fn citations_from_results(&self, results: &[ToolResult]) -> Vec<Citation> {
        let outputs: Vec<&str> = results.iter().map(|r| r.output.as_str()).collect();
        self.normalizer.extract_texts(&outputs)
    }

    fn outcome(
        &self,
        exchange_id: ExchangeId,
        content: String,
        citations: Vec<Citation>,
        malformed_calls: Vec<MalformedToolCall>,
    ) -> CompletionOutcome {
        CompletionOutcome {
            exchange_id,
            content,
            citations_html: render(&citations),
            citations,
            run_id: None,
            thread_id: None,
            malformed_calls,
        }
    }
}

async fn transport<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, GatewayError>>,
) -> Result<T, OrchestratorError> {
    tokio::select! {
        r = fut => r.map_err(OrchestratorError::Transport),
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
    }
}

type Reader = TokenStreamReader<DeltaStream>;

enum Phase {
    Start,
    First {
        reader: Reader,
        accumulator: ToolCallAccumulator,
        text: String,
    },
    Tools {
        calls: Vec<ToolCall>,
        text: String,
    },
    Follow {
        reader: Reader,
        citations: Vec<Citation>,
    },
    Finish {
        citations: Vec<Citation>,
        malformed: Vec<MalformedToolCall>,
    },
    Done,
}

/// State of one streamed exchange, advanced one item at a time.
struct Exchange {
    orchestrator: ConversationOrchestrator,
    exchange_id: ExchangeId,
    messages: Vec<Message>,
    cancel: CancellationToken,
    _guard: DropGuard,
    phase: Phase,
}

impl Exchange {
    /// Produce the next item, or `None` once the exchange is over. After an
    /// error the phase stays `Done`.
    async fn advance(&mut self) -> Option<Result<StreamChunk, OrchestratorError>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Done => return None,

                Phase::Start => {
                    if let Some(agent) = self.orchestrator.agent.clone() {
                        let result = self
                            .orchestrator
                            .run_agent(&agent, self.exchange_id.clone(), &self.messages, &self.cancel)
                            .await;
                        return Some(result.map(|outcome| {
                            self.phase = Phase::Finish {
                                citations: outcome.citations,
                                malformed: outcome.malformed_calls,
                            };
                            StreamChunk::Text(outcome.content)
                        }));
                    }

                    let request = ChatRequest::new(self.messages.clone())
                        .with_tools(self.orchestrator.executor.definitions())
                        .with_sampling(self.orchestrator.sampling.clone());
                    match transport(&self.cancel, self.orchestrator.provider.create_chat_stream(&request)).await {
                        Ok(deltas) => {
                            self.phase = Phase::First {
                                reader: TokenStreamReader::new(deltas),
                                accumulator: ToolCallAccumulator::new(),
                                text: String::new(),
                            }
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }

                Phase::First {
                    mut reader,
                    mut accumulator,
                    mut text,
                } => {
                    let event = match next_event(&mut reader, &self.cancel).await {
                        Ok(event) => event,
                        Err(e) => return Some(Err(e)),
                    };
                    if let Some(event) = &event {
                        accumulator.feed(event);
                    }
                    match event {
                        Some(StreamEvent::Text { delta }) => {
                            text.push_str(&delta);
                            self.phase = Phase::First {
                                reader,
                                accumulator,
                                text,
                            };
                            return Some(Ok(StreamChunk::Text(delta)));
                        }
                        Some(StreamEvent::ToolCallDelta { .. }) => {
                            self.phase = Phase::First {
                                reader,
                                accumulator,
                                text,
                            };
                        }
                        Some(StreamEvent::Error { error }) => {
                            warn!(exchange_id = %self.exchange_id, error_kind = error.error_kind(), "first stream failed");
                            return Some(Err(OrchestratorError::Transport(error)));
                        }
                        Some(StreamEvent::End { .. }) | None => {
                            let drained = accumulator.drain();
                            if !drained.malformed.is_empty() {
                                warn!(count = drained.malformed.len(), "malformed tool calls excluded from follow-up");
                            }
                            self.phase = if drained.calls.is_empty() {
                                Phase::Finish {
                                    citations: Vec::new(),
                                    malformed: Vec::new(),
                                }
                            } else {
                                Phase::Tools {
                                    calls: drained.calls,
                                    text,
                                }
                            };
                            if !drained.malformed.is_empty() {
                                return Some(Ok(StreamChunk::MalformedCalls(drained.malformed)));
                            }
                        }
                    }
                }

                Phase::Tools { calls, text } => {
                    let orchestrator = &self.orchestrator;
                    let (follow_up, results) = match orchestrator
                        .execute_tools(&self.messages, &text, calls, &self.cancel)
                        .await
                    {
                        Ok(r) => r,
                        Err(e) => return Some(Err(e)),
                    };
                    let citations = orchestrator.citations_from_results(&results);
                    match transport(&self.cancel, orchestrator.provider.create_chat_stream(&follow_up)).await {
                        Ok(deltas) => {
                            self.phase = Phase::Follow {
                                reader: TokenStreamReader::new(deltas),
                                citations,
                            }
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }

                Phase::Follow {
                    mut reader,
                    citations,
                } => {
                    let event = match next_event(&mut reader, &self.cancel).await {
                        Ok(event) => event,
                        Err(e) => return Some(Err(e)),
                    };
                    match event {
                        Some(StreamEvent::Text { delta }) => {
                            self.phase = Phase::Follow { reader, citations };
                            return Some(Ok(StreamChunk::Text(delta)));
                        }
                        Some(StreamEvent::ToolCallDelta { id, .. }) => {
                            warn!(tool_call_id = %id, "tool call in follow-up stream ignored");
                            self.phase = Phase::Follow { reader, citations };
                        }
                        Some(StreamEvent::Error { error }) => {
                            warn!(exchange_id = %self.exchange_id, error_kind = error.error_kind(), "follow-up stream failed");
                            return Some(Err(OrchestratorError::Transport(error)));
                        }
                        Some(StreamEvent::End { .. }) | None => {
                            self.phase = Phase::Finish {
                                citations,
                                malformed: Vec::new(),
                            };
                        }
                    }
                }

                Phase::Finish { citations, malformed } => {
                    if !malformed.is_empty() {
                        self.phase = Phase::Finish {
                            citations,
                            malformed: Vec::new(),
                        };
                        return Some(Ok(StreamChunk::MalformedCalls(malformed)));
                    }
                    debug!(exchange_id = %self.exchange_id, citations = citations.len(), "streaming exchange done");
                    if citations.is_empty() {
                        return None;
                    }
                    let html = render(&citations);
                    return Some(Ok(StreamChunk::Citations { citations, html }));
                }
            }
        }
    }
}

async fn next_event(
    reader: &mut Reader,
    cancel: &CancellationToken,
) -> Result<Option<StreamEvent>, OrchestratorError> {
    tokio::select! {
        event = reader.next() => Ok(event),
        _ = cancel.cancelled() => Err(OrchestratorError::Cancelled),
    }
}
