//! Managed-runtime topology: the Messages body goes through the AWS SDK's
//! invoke operations, with credentials and signing handled by the SDK.

use async_trait::async_trait;
use aws_sdk_bedrockruntime::error::DisplayErrorContext;
use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::ResponseStream;
use aws_sdk_bedrockruntime::Client as BedrockClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::wire::{parse_response, MessagesBody};
use super::InferenceProvider;
use crate::cache::encode_body;
use crate::decoder::{decode_payloads, EventDecoder, IncompleteToolPolicy};
use crate::error::InferenceError;
use crate::events::EventStream;
use crate::retry::RetryExecutor;
use crate::types::{CompletionRequest, CompletionResponse};

const BEDROCK_VERSION: &str = "bedrock-2023-05-31";

pub struct BedrockProvider {
    client: BedrockClient,
    executor: RetryExecutor,
    incomplete_tools: IncompleteToolPolicy,
}

impl BedrockProvider {
    pub fn new(client: BedrockClient) -> Self {
        Self {
            client,
            executor: RetryExecutor::default(),
            incomplete_tools: IncompleteToolPolicy::default(),
        }
    }

    /// Load credentials and region from the standard AWS provider chain.
    pub async fn from_env(region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        Self::new(BedrockClient::new(&config))
    }

    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_incomplete_tool_policy(mut self, policy: IncompleteToolPolicy) -> Self {
        self.incomplete_tools = policy;
        self
    }

    /// Serialized invoke body. The model id travels outside the body and the
    /// streaming flag is implied by the operation.
    pub fn build_body(request: &CompletionRequest) -> Result<Vec<u8>, InferenceError> {
        let mut body = MessagesBody::new(request).without_model(BEDROCK_VERSION);
        body.stream = None;
        encode_body(&body, &request.cache).map_err(|e| InferenceError::Parse(e.to_string()))
    }

    async fn invoke(&self, request: &CompletionRequest) -> Result<CompletionResponse, InferenceError> {
        let body = Self::build_body(request)?;
        let output = self
            .client
            .invoke_model()
            .model_id(&request.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(|e| {
                error!(model = %request.model, error = %DisplayErrorContext(&e), "invoke_model failed");
                InferenceError::Runtime(DisplayErrorContext(&e).to_string())
            })?;
        parse_response(output.body().as_ref())
    }

    async fn invoke_stream(&self, request: &CompletionRequest) -> Result<EventStream, InferenceError> {
        let body = Self::build_body(request)?;
        let output = self
            .client
            .invoke_model_with_response_stream()
            .model_id(&request.model)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send()
            .await
            .map_err(|e| {
                error!(model = %request.model, error = %DisplayErrorContext(&e), "invoke_model_with_response_stream failed");
                InferenceError::Runtime(DisplayErrorContext(&e).to_string())
            })?;

        let payloads = futures::stream::unfold(Some(output.body), |receiver| async move {
            let mut receiver = receiver?;
            loop {
                match receiver.recv().await {
                    Ok(Some(ResponseStream::Chunk(part))) => {
                        let Some(bytes) = part.bytes() else { continue };
                        let payload = String::from_utf8_lossy(bytes.as_ref()).into_owned();
                        return Some((Ok(payload), Some(receiver)));
                    }
                    Ok(Some(other)) => {
                        debug!(event = ?other, "ignoring non-chunk stream event");
                    }
                    Ok(None) => return None,
                    Err(e) => {
                        let err = InferenceError::Stream(DisplayErrorContext(&e).to_string());
                        return Some((Err(err), None));
                    }
                }
            }
        });

        Ok(decode_payloads(
            payloads,
            EventDecoder::new().with_policy(self.incomplete_tools),
        ))
    }
}

#[async_trait]
impl InferenceProvider for BedrockProvider {
    async fn infer(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError> {
        self.executor
            .execute(cancel, |_| self.invoke(request))
            .await
    }

    async fn infer_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        self.executor
            .execute(cancel, |_| self.invoke_stream(request))
            .await
    }
}
