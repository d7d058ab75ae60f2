use async_trait::async_trait;
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::http;
use super::wire::MessagesBody;
use super::InferenceProvider;
use crate::cache::{encode_body, CacheTtl};
use crate::decoder::IncompleteToolPolicy;
use crate::error::InferenceError;
use crate::events::EventStream;
use crate::retry::RetryExecutor;
use crate::types::{CompletionRequest, CompletionResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";
const EXTENDED_TTL_BETA: &str = "extended-cache-ttl-2025-04-11";
const INTERLEAVED_THINKING_BETA: &str = "interleaved-thinking-2025-05-14";

/// Direct Messages API client authenticated with an API key.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    executor: RetryExecutor,
    incomplete_tools: IncompleteToolPolicy,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_key)
    }

    pub fn with_client(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.into(),
            executor: RetryExecutor::default(),
            incomplete_tools: IncompleteToolPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_executor(mut self, executor: RetryExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// How streams treat a tool call cut off by the end of input.
    pub fn with_incomplete_tool_policy(mut self, policy: IncompleteToolPolicy) -> Self {
        self.incomplete_tools = policy;
        self
    }

    fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url.trim_end_matches('/'))
    }

    /// Build the outbound request for one attempt.
    pub fn build_request(
        &self,
        request: &CompletionRequest,
    ) -> Result<reqwest::Request, InferenceError> {
        let body = encode_body(&MessagesBody::new(request), &request.cache)
            .map_err(|e| InferenceError::Parse(e.to_string()))?;

        let mut builder = self
            .client
            .post(self.messages_url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let betas = beta_features(request);
        if !betas.is_empty() {
            builder = builder.header("anthropic-beta", betas.join(","));
        }

        let mut built = builder
            .body(body)
            .build()
            .map_err(|e| InferenceError::Request(e.to_string()))?;
        if request.stream {
            http::mark_streaming(&mut built);
        }
        Ok(built)
    }
}

fn beta_features(request: &CompletionRequest) -> Vec<&'static str> {
    let mut betas = Vec::new();
    if request.cache.is_enabled() {
        betas.push(PROMPT_CACHING_BETA);
        if request.cache.ttl == CacheTtl::OneHour {
            betas.push(EXTENDED_TTL_BETA);
        }
    }
    // Interleaved thinking with tool use requires a beta header.
    if request.thinking.is_some() && !request.tools.is_empty() {
        betas.push(INTERLEAVED_THINKING_BETA);
    }
    betas
}

#[async_trait]
impl InferenceProvider for AnthropicProvider {
    async fn infer(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError> {
        let mut request = request.clone();
        request.stream = false;

        self.executor
            .execute(cancel, |attempt| {
                let request = &request;
                async move {
                    debug!(attempt, model = %request.model, "messages request");
                    let built = self.build_request(request)?;
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
            .execute(cancel, |attempt| {
                let request = &request;
                async move {
                    debug!(attempt, model = %request.model, "messages stream request");
                    let built = self.build_request(request)?;
                    let resp = http::send(&self.client, built).await?;
                    Ok(http::event_stream(resp, self.incomplete_tools))
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheOptions;
    use crate::events::StreamEventKind;
    use crate::retry::RetryPolicy;
    use crate::types::{Message, StopReason, ThinkingConfig, ToolDefinition};
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOOL_STREAM_HEAD: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-sonnet-4\",\"usage\":{\"input_tokens\":12,\"output_tokens\":1}}}\n",
        "\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"calculator\",\"input\":{}}}\n",
        "\n",
        ": keep-alive\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"a\\\": 2,\"}}\n",
        "\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\" \\\"b\\\": 3}\"}}\n",
        "\n",
    );

    const TOOL_STREAM_TAIL: &str = concat!(
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n",
        "\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":20}}\n",
        "\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n",
        "\n",
        "data: [DONE]\n",
    );

    fn fast_executor(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(
            Duration::from_millis(1),
            2.0,
            Duration::from_millis(4),
            max_attempts,
        ))
    }

    async fn serve_stream(body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("accept", "text/event-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;
        server
    }

    fn body_of(req: &reqwest::Request) -> Value {
        serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap()
    }

    fn request() -> CompletionRequest {
        CompletionRequest::new("claude-sonnet-4", vec![Message::user("2+2?")])
    }

    #[test]
    fn direct_request_carries_key_and_model() {
        let provider = AnthropicProvider::new("sk-test").with_base_url("http://localhost:9999/");
        let built = provider.build_request(&request()).unwrap();

        assert_eq!(built.method(), reqwest::Method::POST);
        assert_eq!(built.url().as_str(), "http://localhost:9999/v1/messages");
        assert_eq!(built.headers()["x-api-key"], "sk-test");
        assert_eq!(built.headers()["anthropic-version"], ANTHROPIC_VERSION);
        assert!(built.headers().get("accept").is_none());
        assert!(built.headers().get("anthropic-beta").is_none());

        let body = body_of(&built);
        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["messages"][0]["content"], "2+2?");
    }

    #[test]
    fn streaming_request_sets_event_stream_headers() {
        let provider = AnthropicProvider::new("sk-test");
        let mut req = request();
        req.stream = true;
        let built = provider.build_request(&req).unwrap();
        assert_eq!(built.headers()["accept"], "text/event-stream");
        assert_eq!(built.headers()["cache-control"], "no-cache");
        assert_eq!(body_of(&built)["stream"], true);
    }

    #[test]
    fn caching_adds_markers_and_beta_header() {
        let provider = AnthropicProvider::new("sk-test");
        let mut req = request();
        req.system = Some("sys".into());
        req.cache = CacheOptions {
            system: true,
            ttl: CacheTtl::OneHour,
            ..Default::default()
        };
        let built = provider.build_request(&req).unwrap();
        assert_eq!(
            built.headers()["anthropic-beta"],
            "prompt-caching-2024-07-31,extended-cache-ttl-2025-04-11"
        );
        assert_eq!(body_of(&built)["system"][0]["cache_control"]["ttl"], "1h");
    }

    #[test]
    fn thinking_with_tools_requests_interleaved_beta() {
        let provider = AnthropicProvider::new("sk-test");
        let mut req = request();
        req.thinking = Some(ThinkingConfig { budget_tokens: 2048 });
        req.tools = vec![ToolDefinition::new("calc", "math", json!({"type": "object"}))];
        let built = provider.build_request(&req).unwrap();
        assert_eq!(built.headers()["anthropic-beta"], INTERLEAVED_THINKING_BETA);
    }

    #[tokio::test]
    async fn overloaded_service_is_retried_then_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(529).set_body_json(json!({
                "type": "error",
                "error": {"type": "overloaded_error", "message": "Overloaded"}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("sk-test")
            .with_base_url(server.uri())
            .with_executor(fast_executor(3));
        let err = provider
            .infer(&request(), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            InferenceError::Api { status, message } => {
                assert_eq!(status, 529);
                assert_eq!(message, "Overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn successful_response_is_parsed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "msg_1",
                "model": "claude-sonnet-4",
                "content": [{"type": "text", "text": "4"}],
                "stop_reason": "end_turn",
                "usage": {"input_tokens": 9, "output_tokens": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = AnthropicProvider::new("sk-test").with_base_url(server.uri());
        let resp = provider
            .infer(&request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.text(), "4");
        assert_eq!(resp.stop_reason, StopReason::EndTurn);
        assert_eq!(resp.usage.input_tokens, 9);
    }

    #[tokio::test]
    async fn tool_arguments_split_across_deltas_arrive_whole() {
        let server = serve_stream(format!("{TOOL_STREAM_HEAD}{TOOL_STREAM_TAIL}")).await;
        let provider = AnthropicProvider::new("sk-test").with_base_url(server.uri());

        let events: Vec<_> = provider
            .infer_stream(&request(), &CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        let events: Vec<_> = events.into_iter().map(Result::unwrap).collect();

        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].kind, StreamEventKind::MessageStart { .. }));
        match &events[1].kind {
            StreamEventKind::ToolUse { index, call } => {
                assert_eq!(*index, 0);
                assert_eq!(call.id, "toolu_1");
                assert_eq!(call.name, "calculator");
                assert_eq!(call.input().unwrap(), json!({"a": 2, "b": 3}));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        match &events[2].kind {
            StreamEventKind::MessageStop { stop_reason, usage } => {
                assert_eq!(stop_reason, &Some(StopReason::ToolUse));
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 20);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_tool_call_follows_the_configured_policy() {
        let server = serve_stream(TOOL_STREAM_HEAD.to_string()).await;

        let lenient = AnthropicProvider::new("sk-test").with_base_url(server.uri());
        let events: Vec<_> = lenient
            .infer_stream(&request(), &CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 1);
        assert!(events[0].is_ok());

        let strict = AnthropicProvider::new("sk-test")
            .with_base_url(server.uri())
            .with_incomplete_tool_policy(IncompleteToolPolicy::Error);
        let events: Vec<_> = strict
            .infer_stream(&request(), &CancellationToken::new())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(events.len(), 2);
        match &events[1] {
            Err(InferenceError::Stream(message)) => assert!(message.contains("toolu_1")),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
