//! Server-sent-event framing for chat-completions streams.

use serde::Deserialize;

use grounded_core::errors::GatewayError;
use grounded_core::stream::ProviderDelta;

const DONE_SENTINEL: &str = "[DONE]";

/// One decoded SSE `data:` payload.
#[derive(Debug)]
pub enum SseFrame {
    Delta(ProviderDelta),
    /// The `[DONE]` sentinel: no more frames follow.
    Done,
    /// An in-band error object sent by the provider mid-stream.
    Error(GatewayError),
}

/// Split raw SSE text into `data` payloads, one per event. Multi-line data
/// fields are joined with `\n`; comments and other fields are skipped.
pub fn parse_sse_lines(raw: &str) -> Vec<String> {
    let mut payloads = Vec::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if line.is_empty() {
            if let Some(data) = current.take() {
                payloads.push(data);
            }
            continue;
        }
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.strip_prefix(' ').unwrap_or(data);
            match current.as_mut() {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(data);
                }
                None => current = Some(data.to_string()),
            }
        }
    }

    // Handle trailing event without blank line
    if let Some(data) = current {
        payloads.push(data);
    }
    payloads
}

/// Decode one `data` payload.
pub fn decode_frame(data: &str) -> SseFrame {
    let data = data.trim();
    if data == DONE_SENTINEL {
        return SseFrame::Done;
    }
    if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
        return SseFrame::Error(classify_stream_error(envelope.error));
    }
    match serde_json::from_str::<ProviderDelta>(data) {
        Ok(delta) => SseFrame::Delta(delta),
        Err(e) => SseFrame::Error(GatewayError::Decode(format!("{e}: {data}"))),
    }
}

fn classify_stream_error(error: ErrorBody) -> GatewayError {
    let message = error.message.unwrap_or_else(|| "unknown stream error".into());
    match error.code.as_deref().or(error.kind.as_deref()) {
        Some("rate_limit_exceeded" | "rate_limit_error" | "429") => {
            GatewayError::RateLimited { retry_after: None }
        }
        Some("invalid_api_key" | "authentication_error" | "401") => {
            GatewayError::Authentication(message)
        }
        Some("server_error" | "overloaded_error") => GatewayError::Server {
            status: 500,
            body: message,
        },
        _ => GatewayError::StreamInterrupted(message),
    }
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}
