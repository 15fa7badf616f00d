use std::time::Duration;

/// Failures talking to the model provider or the agent service.
///
/// Auth and rate-limit rejections keep their own variants so callers can
/// tell them apart from plain transport faults. Nothing in this workspace
/// retries on its own; `is_retryable` is advice for the caller.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    // Upstream rejected the request
    #[error("upstream authentication failed: {0}")]
    Authentication(String),
    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("upstream server error {status}: {body}")]
    Server { status: u16, body: String },

    // Transport
    #[error("transport error: {0}")]
    Transport(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),
    #[error("malformed upstream payload: {0}")]
    Decode(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::Server { .. }
                | Self::Transport(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Authentication(_) | Self::InvalidRequest(_))
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "upstream_auth",
            Self::RateLimited { .. } => "upstream_rate_limit",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Server { .. } => "upstream_server",
            Self::Transport(_) => "transport",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Decode(_) => "decode",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        Self::from_status_with_retry(status, body, None)
    }

    /// Like `from_status`, carrying a parsed `Retry-After` for 429s.
    pub fn from_status_with_retry(status: u16, body: String, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::Authentication(body),
            429 => Self::RateLimited { retry_after },
            400 | 404 | 422 => Self::InvalidRequest(body),
            500..=599 => Self::Server { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}
