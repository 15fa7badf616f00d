use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use grounded_core::errors::GatewayError;
use grounded_core::provider::{ChatProvider, ChatRequest, ChatResponse};
use grounded_core::stream::{DeltaStream, ProviderDelta};

/// One item of a scripted stream.
#[derive(Clone, Debug)]
pub enum MockChunk {
    Delta(ProviderDelta),
    /// Yield a transport error mid-stream.
    Fail(GatewayError),
    /// Never yield again (for cancellation and timeout tests).
    Hang,
}

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Answer `create_chat_stream` with this sequence.
    Stream(Vec<MockChunk>),
    /// Answer `create_chat_blocking` with this response.
    Blocking(ChatResponse),
    /// Fail the call itself.
    Error(GatewayError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// A text answer split into the given chunks, ending with `stop`.
    pub fn stream_text(chunks: &[&str]) -> Self {
        let mut items: Vec<MockChunk> = chunks
            .iter()
            .map(|c| MockChunk::Delta(ProviderDelta::text(*c)))
            .collect();
        items.push(MockChunk::Delta(ProviderDelta::finish("stop")));
        Self::Stream(items)
    }

    /// A single tool call whose arguments arrive split into `arg_chunks`.
    pub fn stream_tool_call(id: &str, name: &str, arg_chunks: &[&str]) -> Self {
        let mut items = vec![MockChunk::Delta(ProviderDelta::tool_call(
            0,
            Some(id),
            Some(name),
            Some(""),
        ))];
        items.extend(
            arg_chunks
                .iter()
                .map(|c| MockChunk::Delta(ProviderDelta::tool_call(0, None, None, Some(*c)))),
        );
        items.push(MockChunk::Delta(ProviderDelta::finish("tool_calls")));
        Self::Stream(items)
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that answers calls from a queue of scripted responses and
/// records every request it receives.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received so far, in call order.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self, request: &ChatRequest) -> Result<MockResponse, GatewayError> {
        let idx = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len() - 1
        };
        self.responses.lock().pop_front().ok_or_else(|| {
            GatewayError::InvalidRequest(format!("MockProvider: no response configured for call {idx}"))
        })
    }
}

enum Resolved {
    Stream(Vec<MockChunk>),
    Blocking(ChatResponse),
    Error(GatewayError),
}

/// Resolve a MockResponse, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve(mut response: MockResponse) -> Resolved {
    loop {
        match response {
            MockResponse::Stream(chunks) => return Resolved::Stream(chunks),
            MockResponse::Blocking(resp) => return Resolved::Blocking(resp),
            MockResponse::Error(e) => return Resolved::Error(e),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                response = *inner;
            }
        }
    }
}

fn into_stream(chunks: Vec<MockChunk>) -> DeltaStream {
    let s = stream::iter(chunks).flat_map(|chunk| -> BoxStream<'static, Result<ProviderDelta, GatewayError>> {
        match chunk {
            MockChunk::Delta(d) => stream::once(async move { Ok(d) }).boxed(),
            MockChunk::Fail(e) => stream::once(async move { Err(e) }).boxed(),
            MockChunk::Hang => stream::pending().boxed(),
        }
    });
    Box::pin(s)
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn create_chat_stream(&self, request: &ChatRequest) -> Result<DeltaStream, GatewayError> {
        match resolve(self.next_response(request)?).await {
            Resolved::Stream(chunks) => Ok(into_stream(chunks)),
            Resolved::Error(e) => Err(e),
            Resolved::Blocking(_) => Err(GatewayError::InvalidRequest(
                "MockProvider: blocking response scripted for a stream call".into(),
            )),
        }
    }

    async fn create_chat_blocking(&self, request: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        match resolve(self.next_response(request)?).await {
            Resolved::Blocking(resp) => Ok(resp),
            Resolved::Error(e) => Err(e),
            Resolved::Stream(_) => Err(GatewayError::InvalidRequest(
                "MockProvider: stream response scripted for a blocking call".into(),
            )),
        }
    }
}
