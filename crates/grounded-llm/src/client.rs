use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Future, Stream};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use grounded_core::errors::GatewayError;
use grounded_core::provider::{ChatProvider, ChatRequest, ChatResponse};
use grounded_core::stream::{DeltaStream, ProviderDelta};

use crate::converter;
use crate::sse::{self, SseFrame};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiChatProvider {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
}

impl OpenAiChatProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url, model, api_key))
    }

    /// Use a caller-owned client (and its connection pool).
    pub fn with_client(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<SecretString>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> RequestBuilder {
        let body = converter::build_request_body(request, &self.model, stream);
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("content-type", "application/json");
        if stream {
            req = req.header("accept", "text/event-stream");
        }
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req.json(&body)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, GatewayError> {
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        error_for_status(resp).await
    }
}

/// Map a non-2xx response to a classified error.
pub(crate) async fn error_for_status(resp: Response) -> Result<Response, GatewayError> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let retry_after = resp
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = resp.text().await.unwrap_or_default();
    Err(GatewayError::from_status_with_retry(status, body, retry_after))
}

#[async_trait]
impl ChatProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, request), fields(model = %self.model, messages = request.messages.len()))]
    async fn create_chat_stream(&self, request: &ChatRequest) -> Result<DeltaStream, GatewayError> {
        let resp = self.send(self.build_request(request, true)).await?;
        debug!("chat stream opened");
        Ok(Box::pin(SseDeltaStream::new(resp.bytes_stream())))
    }

    #[instrument(skip(self, request), fields(model = %self.model, messages = request.messages.len()))]
    async fn create_chat_blocking(&self, request: &ChatRequest) -> Result<ChatResponse, GatewayError> {
        let resp = self.send(self.build_request(request, false)).await?;
        let body = resp
            .text()
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        converter::parse_chat_response(&body)
    }
}

/// Wraps a byte stream from reqwest and yields decoded provider chunks.
/// Includes an idle timeout: if no data arrives within `idle_duration`, the
/// stream yields an error and ends.
struct SseDeltaStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    /// Raw bytes of the unfinished frame. Decoded only once a whole frame
    /// has arrived, so a character split across reads stays intact.
    buffer: BytesMut,
    pending: VecDeque<Result<ProviderDelta, GatewayError>>,
    finished: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl SseDeltaStream {
    fn new(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: BytesMut::with_capacity(8192),
            pending: VecDeque::new(),
            finished: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    /// Decode one complete frame of raw bytes.
    fn push_raw(&mut self, raw: &[u8]) {
        match std::str::from_utf8(raw) {
            Ok(text) => self.push_frames(text),
            Err(e) => {
                self.pending
                    .push_back(Err(GatewayError::Decode(format!("invalid UTF-8 in stream frame: {e}"))));
                self.finished = true;
            }
        }
    }

    /// Decode frames from `raw`. Stops at `[DONE]` or the first in-band error.
    fn push_frames(&mut self, raw: &str) {
        for data in sse::parse_sse_lines(raw) {
            if self.finished {
                return;
            }
            match sse::decode_frame(&data) {
                SseFrame::Delta(delta) => self.pending.push_back(Ok(delta)),
                SseFrame::Done => self.finished = true,
                SseFrame::Error(e) => {
                    self.pending.push_back(Err(e));
                    self.finished = true;
                }
            }
        }
    }
}

impl Stream for SseDeltaStream {
    type Item = Result<ProviderDelta, GatewayError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    // Data received, reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    // CR never occurs inside a multi-byte sequence or a JSON string.
                    self.buffer.extend(bytes.iter().copied().filter(|&b| b != b'\r'));

                    while let Some(pos) = frame_end(&self.buffer) {
                        let frame = self.buffer.split_to(pos + 2);
                        self.push_raw(&frame);
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    let remaining = self.buffer.split();
                    if !remaining.iter().all(u8::is_ascii_whitespace) {
                        self.push_raw(&remaining);
                    }
                    self.finished = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

/// Index of the blank line that ends the first complete frame.
fn frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use grounded_core::messages::Message;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAiChatProvider {
        OpenAiChatProvider::new(
            server.uri(),
            "gpt-test",
            Some(SecretString::from("sk-test")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn streams_deltas_until_done() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            ": keep-alive\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let stream = provider(&server)
            .create_chat_stream(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 2);
        let second = items[1].as_ref().unwrap();
        assert_eq!(second.choices[0].delta.content.as_deref(), Some("lo"));
        assert_eq!(second.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn unauthorized_maps_to_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = match provider(&server)
            .create_chat_stream(&ChatRequest::new(vec![Message::user("hi")]))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, GatewayError::Authentication(ref b) if b == "bad key"));
    }

    #[tokio::test]
    async fn rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "3"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .create_chat_blocking(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap_err();
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn blocking_completion_parses_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "It is sunny."},
                    "finish_reason": "stop"
                }]
            })))
            .mount(&server)
            .await;

        let resp = provider(&server)
            .create_chat_blocking(&ChatRequest::new(vec![Message::user("weather?")]))
            .await
            .unwrap();
        assert_eq!(resp.content.as_deref(), Some("It is sunny."));
    }

    #[tokio::test]
    async fn in_band_error_ends_stream() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"par\"}}]}\n\n",
            "data: {\"error\":{\"message\":\"boom\",\"type\":\"server_error\"}}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"never\"}}]}\n\n",
        );
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let items: Vec<_> = provider(&server)
            .create_chat_stream(&ChatRequest::new(vec![Message::user("hi")]))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(GatewayError::Server { .. })));
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<Bytes, reqwest::Error>>();
        let mut stream = Box::pin(SseDeltaStream::with_idle_timeout(
            byte_stream,
            Duration::from_secs(5),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;

        let item = stream.next().await;
        assert!(
            matches!(&item, Some(Err(GatewayError::StreamInterrupted(msg))) if msg.contains("idle timeout")),
            "expected idle timeout error, got: {item:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_reassembled() {
        let chunks = vec![
            Ok(Bytes::from("data: {\"choices\":[{\"delta\":{\"con")),
            Ok(Bytes::from("tent\":\"ok\"}}]}\r\n\r\ndata: [DONE]\r\n\r\n")),
        ];
        let stream = SseDeltaStream::new(futures::stream::iter(chunks));
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap().choices[0].delta.content.as_deref(),
            Some("ok")
        );
    }

    #[tokio::test]
    async fn character_split_across_reads_is_not_corrupted() {
        let frame = "data: {\"choices\":[{\"delta\":{\"content\":\"18°C 東京\"}}]}\n\n".as_bytes();
        let degree = frame.iter().position(|&b| b == 0xC2).unwrap();
        let chunks = vec![
            Ok(Bytes::copy_from_slice(&frame[..degree + 1])),
            Ok(Bytes::copy_from_slice(&frame[degree + 1..])),
            Ok(Bytes::from("data: [DONE]\n\n")),
        ];
        let items: Vec<_> = SseDeltaStream::new(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_ref().unwrap().choices[0].delta.content.as_deref(),
            Some("18°C 東京")
        );
    }

    #[tokio::test]
    async fn invalid_utf8_frame_is_a_decode_error() {
        let chunks = vec![Ok(Bytes::from_static(b"data: {\"x\":\"\xff\"}\n\n"))];
        let items: Vec<_> = SseDeltaStream::new(futures::stream::iter(chunks)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(GatewayError::Decode(_))));
    }
}
