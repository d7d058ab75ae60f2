pub mod anthropic;
pub mod bedrock;
pub mod vertex;
pub mod wire;

mod http;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::InferenceError;
use crate::events::EventStream;
use crate::types::{CompletionRequest, CompletionResponse};

/// Pure LLM API call. No history, no tool execution.
/// Request in, response (or event stream) out. Retries live inside.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn infer(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError>;

    /// Open a streaming response. Errors before the first byte are retried;
    /// errors after that arrive through the stream.
    async fn infer_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, InferenceError>;
}

#[async_trait]
impl InferenceProvider for Box<dyn InferenceProvider> {
    async fn infer(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError> {
        (**self).infer(request, cancel).await
    }

    async fn infer_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        (**self).infer_stream(request, cancel).await
    }
}

#[async_trait]
impl InferenceProvider for Arc<dyn InferenceProvider> {
    async fn infer(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError> {
        (**self).infer(request, cancel).await
    }

    async fn infer_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        (**self).infer_stream(request, cancel).await
    }
}

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
pub use vertex::{StaticToken, TokenSource, VertexProvider};
