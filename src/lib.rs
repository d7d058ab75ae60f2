pub mod cache;
pub mod completion;
pub mod config;
pub mod decoder;
pub mod error;
pub mod events;
pub mod inference;
pub mod memory;
pub mod retry;
pub mod structured;
pub mod tenant;
pub mod tools;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

pub use cache::{CacheOptions, CacheTtl};
pub use completion::{Completion, CompletionLoop, CompletionStream, LoopState};
pub use config::{build_provider, CompletionOptions, EngineConfig, ProviderConfig, RetryConfig};
pub use decoder::{decode_lines, decode_payloads, EventDecoder, IncompleteToolPolicy};
pub use error::{CompletionError, DecodeError, InferenceError};
pub use events::{EventStream, StreamEvent, StreamEventKind};
pub use inference::{
    AnthropicProvider, BedrockProvider, InferenceProvider, StaticToken, TokenSource,
    VertexProvider,
};
pub use memory::{ConversationBuffer, FileMemory, Memory, MemoryError};
pub use retry::{CancellationMode, RegionSet, RetryExecutor, RetryPolicy};
pub use tenant::TenantContext;
pub use tools::{execute_tool_calls, LoopDetector, ToolHandler, ToolRegistry};
pub use types::{
    CompletionRequest, CompletionResponse, ContentBlock, Message, ResponseFormat, Role,
    StopReason, ToolCall, ToolDefinition, ToolResult, Usage,
};

/// Entry point for callers: one configured transport and model, any number
/// of independent completions.
#[derive(Clone)]
pub struct Client {
    engine: CompletionLoop,
}

impl Client {
    pub fn new(provider: Arc<dyn InferenceProvider>, model: impl Into<String>) -> Self {
        Self {
            engine: CompletionLoop::new(provider, model),
        }
    }

    /// Build the transport described by `config`.
    pub async fn from_config(config: &EngineConfig) -> Result<Self, CompletionError> {
        let provider = build_provider(config).await?;
        Ok(Self {
            engine: CompletionLoop::from_config(provider, config),
        })
    }

    pub async fn from_env() -> Result<Self, CompletionError> {
        Self::from_config(&EngineConfig::from_env()?).await
    }

    pub fn engine(&self) -> &CompletionLoop {
        &self.engine
    }

    /// Final answer text.
    pub async fn complete(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        Ok(self.engine.run(prompt, options).await?.text)
    }

    /// Final answer with accumulated usage and loop statistics.
    pub async fn complete_detailed(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, CompletionError> {
        self.engine.run(prompt, options).await
    }

    /// Like [`Client::complete`], with `tools` replacing any registry set in
    /// `options`.
    pub async fn complete_with_tools(
        &self,
        prompt: &str,
        tools: Arc<ToolRegistry>,
        options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        let options = options.clone().with_tools(tools);
        self.complete(prompt, &options).await
    }

    pub async fn stream(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<CompletionStream, CompletionError> {
        self.engine.run_stream(prompt, options).await
    }

    pub async fn stream_with_tools(
        &self,
        prompt: &str,
        tools: Arc<ToolRegistry>,
        options: &CompletionOptions,
    ) -> Result<CompletionStream, CompletionError> {
        let options = options.clone().with_tools(tools);
        self.stream(prompt, &options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        text_reply, text_stream, tool_reply, tool_stream, CalculatorTool, MockProvider,
    };
    use futures::StreamExt;
    use serde_json::json;

    fn calculator() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new().add(
            ToolDefinition::new(
                "calculator",
                "Apply an arithmetic operator to two numbers",
                json!({"type": "object", "required": ["a", "b"]}),
            ),
            CalculatorTool,
        ))
    }

    #[tokio::test]
    async fn complete_returns_answer_text() {
        let provider = Arc::new(MockProvider::new(vec![text_reply("4")]));
        let client = Client::new(provider.clone(), "test-model");

        let text = client.complete("2+2?", &CompletionOptions::new()).await.unwrap();
        assert_eq!(text, "4");
        let requests = provider.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].model, "test-model");
        assert!(requests[0].tools.is_empty());
    }

    #[tokio::test]
    async fn complete_detailed_sums_usage() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_reply(&[("toolu_1", "calculator", json!({"a": 3, "b": 4}))]),
            text_reply("7"),
        ]));
        let client = Client::new(provider, "test-model");
        let options = CompletionOptions::new().with_tools(calculator());

        let out = client.complete_detailed("3+4?", &options).await.unwrap();
        assert_eq!(out.text, "7");
        assert_eq!(out.usage.input_tokens, 20);
        assert_eq!(out.usage.output_tokens, 10);
        assert_eq!(out.model_calls, 2);
    }

    #[tokio::test]
    async fn complete_with_tools_overrides_option_tools() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_reply(&[("toolu_1", "calculator", json!({"a": 9, "b": 3, "op": "/"}))]),
            text_reply("3"),
        ]));
        let client = Client::new(provider.clone(), "test-model");

        let text = client
            .complete_with_tools("9/3?", calculator(), &CompletionOptions::new())
            .await
            .unwrap();
        assert_eq!(text, "3");
        let requests = provider.requests().await;
        assert_eq!(requests[0].tools[0].name, "calculator");
        assert_eq!(requests[1].messages[2].content, Message::tool_results(&[ToolResult {
            call_id: "toolu_1".into(),
            name: "calculator".into(),
            content: "3".into(),
            is_error: false,
        }]).content);
    }

    #[tokio::test]
    async fn stream_with_tools_yields_final_text() {
        let provider = Arc::new(MockProvider::new(vec![
            tool_stream("toolu_1", "calculator", r#"{"a":2,"b":5}"#),
            text_stream(&["Seven", "."]),
        ]));
        let client = Client::new(provider, "test-model");

        let mut stream = client
            .stream_with_tools("2+5?", calculator(), &CompletionOptions::new())
            .await
            .unwrap();
        let mut tool_uses = 0;
        let mut text = String::new();
        while let Some(event) = stream.next().await {
            match event.kind {
                StreamEventKind::ToolUse { call, .. } => {
                    assert_eq!(call.name, "calculator");
                    tool_uses += 1;
                }
                StreamEventKind::ContentDelta { text: delta, .. } => text.push_str(&delta),
                StreamEventKind::Error { message } => panic!("unexpected error: {message}"),
                _ => {}
            }
        }
        assert_eq!(tool_uses, 1);
        assert_eq!(text, "Seven.");
    }

    #[tokio::test]
    async fn from_config_rejects_bad_topology() {
        let config = EngineConfig::new(ProviderConfig::RegionRouted {
            project_id: "p".into(),
            regions: vec![],
            access_token: None,
        });
        assert!(matches!(
            Client::from_config(&config).await,
            Err(CompletionError::Config(_))
        ));
    }
}
