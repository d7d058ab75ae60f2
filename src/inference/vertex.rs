//! Region-rotating gateway topology. The model is addressed by URL; each
//! attempt goes to the region currently selected in the shared [`RegionSet`].

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::http;
use super::wire::MessagesBody;
use super::InferenceProvider;
use crate::cache::encode_body;
use crate::decoder::IncompleteToolPolicy;
use crate::error::InferenceError;
use crate::events::EventStream;
use crate::retry::{RegionSet, RetryExecutor, RetryPolicy};
use crate::types::{CompletionRequest, CompletionResponse};

const VERTEX_VERSION: &str = "vertex-2023-10-16";
const GLOBAL_REGION: &str = "global";

/// Supplies bearer tokens for the gateway.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String, InferenceError>;
}

/// A fixed token, e.g. from `gcloud auth print-access-token`.
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String, InferenceError> {
        if self.0.is_empty() {
            return Err(InferenceError::Credentials("empty access token".into()));
        }
        Ok(self.0.clone())
    }
}

/// Reads the token from an environment variable on every call, so an
/// external refresher can rotate it under a running process.
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl TokenSource for EnvToken {
    async fn token(&self) -> Result<String, InferenceError> {
        std::env::var(&self.var)
            .ok()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| InferenceError::Credentials(format!("{} is not set", self.var)))
    }
}

pub struct VertexProvider {
    client: reqwest::Client,
    project_id: String,
    regions: Arc<RegionSet>,
    token: Arc<dyn TokenSource>,
    executor: RetryExecutor,
    incomplete_tools: IncompleteToolPolicy,
}

impl VertexProvider {
    pub fn new(
        project_id: impl Into<String>,
        regions: RegionSet,
        token: Arc<dyn TokenSource>,
    ) -> Self {
        let regions = Arc::new(regions);
        Self {
            client: reqwest::Client::new(),
            project_id: project_id.into(),
            executor: RetryExecutor::default().with_regions(regions.clone()),
            regions,
            token,
            incomplete_tools: IncompleteToolPolicy::default(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Replace the retry policy. Region rotation stays attached.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        let cancellation = self.executor.cancellation();
        self.executor = RetryExecutor::new(policy)
            .with_regions(self.regions.clone())
            .with_cancellation(cancellation);
        self
    }

    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor.with_regions(self.regions.clone());
        self
    }

    pub fn with_incomplete_tool_policy(mut self, policy: IncompleteToolPolicy) -> Self {
        self.incomplete_tools = policy;
        self
    }

    pub fn regions(&self) -> &RegionSet {
        &self.regions
    }

    /// Endpoint for `model` in `region`.
    pub fn endpoint(&self, region: &str, model: &str, stream: bool) -> String {
        let host = if region == GLOBAL_REGION {
            "aiplatform.googleapis.com".to_string()
        } else {
            format!("{region}-aiplatform.googleapis.com")
        };
        let method = if stream { "streamRawPredict" } else { "rawPredict" };
        format!(
            "https://{host}/v1/projects/{}/locations/{region}/publishers/anthropic/models/{model}:{method}",
            self.project_id
        )
    }

    /// Build the request for the currently selected region.
    pub async fn build_request(
        &self,
        request: &CompletionRequest,
    ) -> Result<reqwest::Request, InferenceError> {
        let token = self.token.token().await?;
        let region = self.regions.current();
        let url = self.endpoint(region, &request.model, request.stream);
        debug!(region, "routing request");

        let body = MessagesBody::new(request).without_model(VERTEX_VERSION);
        let body = encode_body(&body, &request.cache)
            .map_err(|e| InferenceError::Parse(e.to_string()))?;

        let mut built = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body)
            .build()
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        if request.stream {
            http::mark_streaming(&mut built);
        }
        Ok(built)
    }
}

#[async_trait]
impl InferenceProvider for VertexProvider {
    async fn infer(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError> {
        let mut request = request.clone();
        request.stream = false;

        self.executor
            .execute(cancel, |_| {
                let request = &request;
                async move {
                    let built = self.build_request(request).await?;
                    let resp = http::send(&self.client, built).await?;
                    http::read_completion(resp).await
                }
            })
            .await
    }

    async fn infer_stream(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        let mut request = request.clone();
        request.stream = true;

        self.executor
            .execute(cancel, |_| {
                let request = &request;
                async move {
                    let built = self.build_request(request).await?;
                    let resp = http::send(&self.client, built).await?;
                    Ok(http::event_stream(resp, self.incomplete_tools))
                }
            })
            .await
    }
}
