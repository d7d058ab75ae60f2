use crate::memory::MemoryError;

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("inference error: {0}")]
    Inference(#[from] InferenceError),
    #[error("completion cancelled")]
    Cancelled,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),
    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("service reported {kind}: {message}")]
    Remote { kind: String, message: String },
    #[error("runtime invoke failed: {0}")]
    Runtime(String),
    #[error("credentials unavailable: {0}")]
    Credentials(String),
    #[error("failed to parse response: {0}")]
    Parse(String),
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("request cancelled")]
    Cancelled,
}

impl InferenceError {
    /// Whether another attempt could plausibly succeed.
    ///
    /// Every transport-level failure (including any non-2xx status) is retried
    /// per policy. Local failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Request(_)
                | Self::Api { .. }
                | Self::Remote { .. }
                | Self::Runtime(_)
                | Self::Stream(_)
        )
    }

    /// HTTP status, when the failure came from an HTTP response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Build an API error from a non-2xx body, preferring the service's
    /// `{"type":"error","error":{"message":..}}` envelope over the raw text.
    pub fn from_response_body(status: u16, body: &str) -> Self {
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| body.to_string());
        Self::Api { status, message }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed event payload {line:?}: {source}")]
    Json {
        line: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("stream ended while tool call {name} ({id}) was still streaming")]
    IncompleteToolCall { id: String, name: String },
}
