//! Engine and per-call configuration.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheOptions, CacheTtl};
use crate::decoder::IncompleteToolPolicy;
use crate::error::CompletionError;
use crate::inference::vertex::EnvToken;
use crate::inference::{
    AnthropicProvider, BedrockProvider, InferenceProvider, StaticToken, TokenSource,
    VertexProvider,
};
use crate::memory::Memory;
use crate::retry::{CancellationMode, RegionSet, RetryExecutor, RetryPolicy};
use crate::tools::ToolRegistry;
use crate::types::{ResponseFormat, DEFAULT_MAX_TOKENS};

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 2;
pub const DEFAULT_STREAM_BUFFER_SIZE: usize = 100;

const VERTEX_TOKEN_VAR: &str = "VERTEX_ACCESS_TOKEN";

/// Which backend topology to talk to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    Direct {
        api_key: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    RegionRouted {
        project_id: String,
        regions: Vec<String>,
        /// Read from `VERTEX_ACCESS_TOKEN` on each request when absent.
        #[serde(default)]
        access_token: Option<String>,
    },
    ManagedRuntime {
        #[serde(default)]
        region: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
    pub max_attempts: u32,
    pub strict_cancellation: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            initial_interval_ms: policy.initial_interval().as_millis() as u64,
            multiplier: policy.multiplier(),
            max_interval_ms: policy.max_interval().as_millis() as u64,
            max_attempts: policy.max_attempts(),
            strict_cancellation: false,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.initial_interval_ms),
            self.multiplier,
            Duration::from_millis(self.max_interval_ms),
            self.max_attempts,
        )
    }

    pub fn executor(&self) -> RetryExecutor {
        let mode = if self.strict_cancellation {
            CancellationMode::Strict
        } else {
            CancellationMode::Continue
        };
        RetryExecutor::new(self.policy()).with_cancellation(mode)
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

/// Process-level settings: where to send requests and how to retry them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub cache_ttl: CacheTtl,
    /// Applied to every stream the transport decodes.
    #[serde(default)]
    pub incomplete_tool_policy: IncompleteToolPolicy,
}

impl EngineConfig {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            provider,
            retry: RetryConfig::default(),
            cache_ttl: CacheTtl::default(),
            incomplete_tool_policy: IncompleteToolPolicy::default(),
        }
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, CompletionError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`. Blank values count as unset.
    ///
    /// `LLM_PROVIDER` selects `direct` (default), `vertex` or `bedrock`.
    pub fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CompletionError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let required = |name: &str| {
            var(name).ok_or_else(|| CompletionError::Config(format!("{name} is not set")))
        };

        let provider = match var("LLM_PROVIDER").as_deref().map(str::trim) {
            None | Some("direct") | Some("anthropic") => ProviderConfig::Direct {
                api_key: required("ANTHROPIC_API_KEY")?,
                base_url: var("ANTHROPIC_BASE_URL"),
            },
            Some("vertex") | Some("region_routed") => ProviderConfig::RegionRouted {
                project_id: required("VERTEX_PROJECT_ID")?,
                regions: required("VERTEX_REGIONS")?
                    .split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect(),
                access_token: var(VERTEX_TOKEN_VAR),
            },
            Some("bedrock") | Some("managed_runtime") => ProviderConfig::ManagedRuntime {
                region: var("AWS_REGION"),
            },
            Some(other) => {
                return Err(CompletionError::Config(format!(
                    "unknown LLM_PROVIDER {other:?}"
                )))
            }
        };

        let mut config = Self::new(provider);
        if let Some(model) = var("LLM_MODEL") {
            config.model = model;
        }
        if let Some(ttl) = var("LLM_CACHE_TTL") {
            config.cache_ttl = ttl.parse().map_err(CompletionError::Config)?;
        }
        if let Some(policy) = var("LLM_INCOMPLETE_TOOL_CALLS") {
            config.incomplete_tool_policy = match policy.trim() {
                "drop" => IncompleteToolPolicy::Drop,
                "error" => IncompleteToolPolicy::Error,
                other => {
                    return Err(CompletionError::Config(format!(
                        "unknown LLM_INCOMPLETE_TOOL_CALLS {other:?}"
                    )))
                }
            };
        }
        Ok(config)
    }
}

/// Construct the transport described by `config`.
pub async fn build_provider(
    config: &EngineConfig,
) -> Result<Arc<dyn InferenceProvider>, CompletionError> {
    let executor = config.retry.executor();
    let policy = config.incomplete_tool_policy;
    let provider: Arc<dyn InferenceProvider> = match &config.provider {
        ProviderConfig::Direct { api_key, base_url } => {
            let mut provider = AnthropicProvider::new(api_key.clone())
                .with_executor(executor)
                .with_incomplete_tool_policy(policy);
            if let Some(url) = base_url {
                provider = provider.with_base_url(url.clone());
            }
            Arc::new(provider)
        }
        ProviderConfig::RegionRouted {
            project_id,
            regions,
            access_token,
        } => {
            let regions = RegionSet::new(regions.clone())
                .ok_or_else(|| CompletionError::Config("region list is empty".into()))?;
            let token: Arc<dyn TokenSource> = match access_token {
                Some(token) => Arc::new(StaticToken::new(token.clone())),
                None => Arc::new(EnvToken::new(VERTEX_TOKEN_VAR)),
            };
            Arc::new(
                VertexProvider::new(project_id.clone(), regions, token)
                    .with_executor(executor)
                    .with_incomplete_tool_policy(policy),
            )
        }
        ProviderConfig::ManagedRuntime { region } => {
            Arc::new(
                BedrockProvider::from_env(region.clone())
                    .await
                    .with_executor(executor)
                    .with_incomplete_tool_policy(policy),
            )
        }
    };
    Ok(provider)
}

/// Per-call options. Every field has a usable default.
#[derive(Clone)]
pub struct CompletionOptions {
    pub system: Option<String>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<u32>,
    pub stop_sequences: Vec<String>,
    /// Overrides the engine's max_tokens.
    pub max_tokens: Option<u32>,
    pub memory: Option<Arc<dyn Memory>>,
    pub tools: Option<Arc<ToolRegistry>>,
    pub cache: CacheOptions,
    pub thinking_budget: Option<u32>,
    pub response_format: Option<ResponseFormat>,
    pub max_tool_iterations: usize,
    pub stream_buffer_size: usize,
    /// Stream text from tool-requesting turns as it arrives instead of
    /// holding it back until the final turn.
    pub show_intermediate: bool,
    pub organization: Option<String>,
    pub cancel: CancellationToken,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            system: None,
            temperature: None,
            top_p: None,
            top_k: None,
            stop_sequences: Vec::new(),
            max_tokens: None,
            memory: None,
            tools: None,
            cache: CacheOptions::default(),
            thinking_budget: None,
            response_format: None,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            stream_buffer_size: DEFAULT_STREAM_BUFFER_SIZE,
            show_intermediate: false,
            organization: None,
            cancel: CancellationToken::new(),
        }
    }
}

impl CompletionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_stop_sequences(mut self, stops: Vec<String>) -> Self {
        self.stop_sequences = stops;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn Memory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_cache(mut self, cache: CacheOptions) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_thinking(mut self, budget_tokens: u32) -> Self {
        self.thinking_budget = Some(budget_tokens);
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = Some(format);
        self
    }

    pub fn with_max_tool_iterations(mut self, iterations: usize) -> Self {
        self.max_tool_iterations = iterations;
        self
    }

    pub fn with_stream_buffer_size(mut self, size: usize) -> Self {
        self.stream_buffer_size = size;
        self
    }

    pub fn with_intermediate(mut self, show: bool) -> Self {
        self.show_intermediate = show;
        self
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn validate(&self) -> Result<(), CompletionError> {
        let invalid = |msg: &str| Err(CompletionError::InvalidRequest(msg.into()));

        if self.max_tool_iterations == 0 {
            return invalid("max_tool_iterations must be at least 1");
        }
        if self.stream_buffer_size == 0 {
            return invalid("stream_buffer_size must be at least 1");
        }
        if let Some(t) = self.temperature {
            if !(0.0..=1.0).contains(&t) {
                return invalid("temperature must be within 0.0..=1.0");
            }
        }
        if let Some(p) = self.top_p {
            if !(0.0..=1.0).contains(&p) {
                return invalid("top_p must be within 0.0..=1.0");
            }
        }
        if self.top_k == Some(0) {
            return invalid("top_k must be positive");
        }
        if self.max_tokens == Some(0) {
            return invalid("max_tokens must be positive");
        }
        if self.thinking_budget == Some(0) {
            return invalid("thinking budget must be positive");
        }
        Ok(())
    }
}
