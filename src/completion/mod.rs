//! The iterative tool-calling completion loop.

pub mod replay;
pub mod stream;

use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::cache::CacheTtl;
use crate::config::{CompletionOptions, EngineConfig};
use crate::error::{CompletionError, InferenceError};
use crate::inference::InferenceProvider;
use crate::memory::Memory;
use crate::structured::{extract_json, schema_instructions, JSON_REMINDER};
use crate::tenant::TenantContext;
use crate::tools::{execute_tool_calls, LoopDetector};
use crate::types::{
    CompletionRequest, ContentBlock, Message, MessageContent, Role, SamplingParams,
    ThinkingConfig, Usage, DEFAULT_MAX_TOKENS,
};

pub use replay::{visible_events, TurnBuffer};
pub use stream::CompletionStream;

/// Appended to the last turn of the tool-free synthesis request.
pub const SYNTHESIS_INSTRUCTION: &str = "You have reached the limit on tool use. \
     Using only the information gathered so far, give your final answer now.";

const PREFILL: &str = "{";

/// Where one completion run is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    AwaitingModel,
    HasToolCalls,
    HasFinalContent,
    Empty,
    MaxIterationsReached,
    FinalSynthesisCall,
    Done,
    Error,
}

/// Outcome of a synchronous run.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
    /// Tool-enabled iterations used, not counting the synthesis call.
    pub iterations: usize,
    pub model_calls: usize,
    /// The state that produced the answer: `HasFinalContent` or
    /// `FinalSynthesisCall`.
    pub final_state: LoopState,
    /// Every state visited, in order.
    pub trace: Vec<LoopState>,
}

/// Drives model calls and tool execution until a final answer.
#[derive(Clone)]
pub struct CompletionLoop {
    provider: Arc<dyn InferenceProvider>,
    model: String,
    max_tokens: u32,
    cache_ttl: CacheTtl,
}

impl CompletionLoop {
    pub fn new(provider: Arc<dyn InferenceProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
            cache_ttl: CacheTtl::default(),
        }
    }

    pub fn from_config(provider: Arc<dyn InferenceProvider>, config: &EngineConfig) -> Self {
        Self::new(provider, config.model.clone())
            .with_max_tokens(config.max_tokens)
            .with_cache_ttl(config.cache_ttl)
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// TTL used when a call enables caching without choosing one.
    pub fn with_cache_ttl(mut self, ttl: CacheTtl) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Run to completion and return the final answer.
    pub async fn run(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, CompletionError> {
        let tenant = TenantContext::resolve(options.organization.as_deref());
        let span = info_span!(
            "completion",
            org_id = %tenant.organization_id(),
            model = %self.model,
            stream = false
        );
        self.run_inner(prompt, options).instrument(span).await
    }

    async fn run_inner(
        &self,
        prompt: &str,
        options: &CompletionOptions,
    ) -> Result<Completion, CompletionError> {
        let mut conversation = self.prepare(prompt, options, false).await?;
        let mut run = RunState::new();
        let registry = options.tools.clone().unwrap_or_default();
        let detector = LoopDetector::new();
        let memory = options.memory.as_deref();
        let cancel = &options.cancel;

        let mut answer = None;
        for iteration in 1..=options.max_tool_iterations {
            if cancel.is_cancelled() {
                info!(iteration, "completion cancelled");
                return Err(run.fail(CompletionError::Cancelled));
            }
            run.enter(LoopState::AwaitingModel);
            run.iterations = iteration;

            let prefilled = conversation.prefills(true);
            let request = conversation.request(true);
            let response = match self.provider.infer(&request, cancel).await {
                Ok(response) => response,
                Err(e) => return Err(run.fail(inference_failure(e))),
            };
            run.model_calls += 1;
            run.usage.accumulate(&response.usage);

            let calls = response.tool_calls();
            if !calls.is_empty() {
                run.enter(LoopState::HasToolCalls);
                info!(iteration, count = calls.len(), "executing tool calls");
                conversation.push(Message::blocks(Role::Assistant, response.content.clone()));
                let results = execute_tool_calls(&calls, &registry, &detector, memory).await;
                conversation.push(Message::tool_results(&results));
                continue;
            }

            let text = response.text();
            if !text.trim().is_empty() {
                run.enter(LoopState::HasFinalContent);
                answer = Some(conversation.finish_text(text, prefilled));
                break;
            }

            run.enter(LoopState::Empty);
            warn!(iteration, "model returned neither text nor tool calls");
        }

        let text = match answer {
            Some(text) => text,
            None => {
                run.enter(LoopState::MaxIterationsReached);
                if cancel.is_cancelled() {
                    return Err(run.fail(CompletionError::Cancelled));
                }
                run.enter(LoopState::FinalSynthesisCall);
                info!(
                    iterations = options.max_tool_iterations,
                    "iteration budget spent, requesting final answer"
                );
                let prefilled = conversation.prefills(false);
                let request = conversation.synthesis_request();
                let response = match self.provider.infer(&request, cancel).await {
                    Ok(response) => response,
                    Err(e) => return Err(run.fail(inference_failure(e))),
                };
                run.model_calls += 1;
                run.usage.accumulate(&response.usage);
                conversation.finish_text(response.text(), prefilled)
            }
        };

        record_answer(memory, &text).await?;

        let final_state = run.last();
        run.enter(LoopState::Done);
        info!(
            model_calls = run.model_calls,
            input_tokens = run.usage.input_tokens,
            output_tokens = run.usage.output_tokens,
            "completion finished"
        );
        Ok(Completion {
            text,
            usage: run.usage,
            iterations: run.iterations,
            model_calls: run.model_calls,
            final_state,
            trace: run.trace,
        })
    }

    /// Seed the conversation from memory and options, and record the prompt.
    pub(crate) async fn prepare(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        stream: bool,
    ) -> Result<Conversation, CompletionError> {
        options.validate()?;

        let mut messages = match &options.memory {
            Some(memory) => memory.messages().await?,
            None => Vec::new(),
        };
        if !prompt.trim().is_empty() {
            let turn = Message::user(prompt);
            if let Some(memory) = &options.memory {
                memory.append(turn.clone()).await?;
            }
            messages.push(turn);
        }
        if !messages.iter().any(Message::is_sendable) {
            return Err(CompletionError::InvalidRequest(
                "nothing to send: prompt and history are empty".into(),
            ));
        }

        let mut request = CompletionRequest::new(self.model.clone(), messages);
        request.system = options.system.clone();
        request.tools = options
            .tools
            .as_ref()
            .map(|t| t.definitions())
            .unwrap_or_default();
        request.sampling = SamplingParams {
            temperature: options.temperature,
            top_p: options.top_p,
            top_k: options.top_k,
            stop_sequences: options.stop_sequences.clone(),
        };
        request.max_tokens = options.max_tokens.unwrap_or(self.max_tokens);
        request.stream = stream;
        request.thinking = options
            .thinking_budget
            .map(|budget_tokens| ThinkingConfig { budget_tokens });
        request.cache = options.cache;
        if request.cache.is_enabled() && request.cache.ttl == CacheTtl::default() {
            request.cache.ttl = self.cache_ttl;
        }

        let mut prefill = false;
        if let Some(format) = &options.response_format {
            let instructions = schema_instructions(&format.schema);
            request.system = Some(match request.system.take() {
                Some(system) if !system.trim().is_empty() => format!("{system}\n\n{instructions}"),
                _ => instructions,
            });
            append_text(&mut request.messages, JSON_REMINDER);
            // Assistant prefill is rejected alongside extended thinking.
            prefill = format.prefill && request.thinking.is_none() && !stream;
            request.response_format = Some(format.clone());
        }

        debug!(
            messages = request.messages.len(),
            tools = request.tools.len(),
            prefill,
            "conversation prepared"
        );
        Ok(Conversation { request, prefill })
    }
}

fn inference_failure(error: InferenceError) -> CompletionError {
    match error {
        InferenceError::Cancelled => CompletionError::Cancelled,
        other => CompletionError::Inference(other),
    }
}

/// Loop bookkeeping shared by the sync and streaming runs.
pub(crate) struct RunState {
    pub(crate) trace: Vec<LoopState>,
    pub(crate) usage: Usage,
    pub(crate) iterations: usize,
    pub(crate) model_calls: usize,
}

impl RunState {
    pub(crate) fn new() -> Self {
        Self {
            trace: vec![LoopState::Idle],
            usage: Usage::default(),
            iterations: 0,
            model_calls: 0,
        }
    }

    pub(crate) fn enter(&mut self, state: LoopState) {
        debug!(from = ?self.last(), to = ?state, "loop transition");
        self.trace.push(state);
    }

    pub(crate) fn last(&self) -> LoopState {
        self.trace.last().copied().unwrap_or(LoopState::Idle)
    }

    pub(crate) fn fail(&mut self, error: CompletionError) -> CompletionError {
        warn!(state = ?self.last(), error = %error, "completion failed");
        self.enter(LoopState::Error);
        error
    }
}

/// Accumulated history plus the per-run request template.
pub(crate) struct Conversation {
    request: CompletionRequest,
    prefill: bool,
}

impl Conversation {
    pub(crate) fn push(&mut self, message: Message) {
        self.request.messages.push(message);
    }

    pub(crate) fn messages(&self) -> &[Message] {
        &self.request.messages
    }

    /// Whether the request built with `with_tools` seeds the reply with `{`.
    /// A prefilled assistant turn rules out tool use, so only tool-free
    /// requests get one.
    pub(crate) fn prefills(&self, with_tools: bool) -> bool {
        self.prefill && (!with_tools || self.request.tools.is_empty())
    }

    pub(crate) fn request(&self, with_tools: bool) -> CompletionRequest {
        let mut request = self.request.clone();
        if !with_tools {
            request.tools.clear();
        }
        if self.prefills(with_tools) {
            request.messages.push(Message::assistant(PREFILL));
        }
        request
    }

    /// Tool-free request that forces a conclusive answer. Earlier tool
    /// exchanges are folded into plain text since the service only accepts
    /// tool blocks alongside tool definitions.
    pub(crate) fn synthesis_request(&self) -> CompletionRequest {
        let mut request = self.request(false);
        let prefilled = self.prefills(false);
        let end = request.messages.len() - usize::from(prefilled);
        let mut history = flatten_tool_turns(&request.messages[..end]);
        append_closing_instruction(&mut history);
        if prefilled {
            history.push(Message::assistant(PREFILL));
        }
        request.messages = history;
        request
    }

    /// Restore a prefilled opening and, in structured mode, reduce the
    /// reply to its JSON payload.
    pub(crate) fn finish_text(&self, text: String, prefilled: bool) -> String {
        let text = if prefilled { format!("{PREFILL}{text}") } else { text };
        if self.request.response_format.is_none() {
            return text;
        }
        match extract_json(&text) {
            Some(json) => json.to_string(),
            None => {
                warn!("structured response contained no JSON value");
                text.trim().to_string()
            }
        }
    }
}

fn append_text(messages: &mut [Message], text: &str) {
    let Some(last) = messages.last_mut() else {
        return;
    };
    match &mut last.content {
        MessageContent::Text(existing) => {
            existing.push_str("\n\n");
            existing.push_str(text);
        }
        MessageContent::Blocks(blocks) => blocks.push(ContentBlock::Text { text: text.into() }),
    }
}

fn append_closing_instruction(messages: &mut Vec<Message>) {
    let ends_with_assistant = messages
        .last()
        .map_or(true, |m| m.role == Role::Assistant);
    if ends_with_assistant {
        messages.push(Message::user(SYNTHESIS_INSTRUCTION));
    } else {
        append_text(messages, SYNTHESIS_INSTRUCTION);
    }
}

/// Replace tool-use and tool-result blocks with text, and drop thinking.
fn flatten_tool_turns(messages: &[Message]) -> Vec<Message> {
    messages
        .iter()
        .filter_map(|message| {
            let MessageContent::Blocks(blocks) = &message.content else {
                return Some(message.clone());
            };
            let blocks: Vec<ContentBlock> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { .. } => Some(block.clone()),
                    ContentBlock::ToolUse { name, input, .. } => Some(ContentBlock::Text {
                        text: format!("[called tool {name} with {input}]"),
                    }),
                    ContentBlock::ToolResult { content, is_error, .. } => {
                        let label = if *is_error { "tool error" } else { "tool result" };
                        Some(ContentBlock::Text {
                            text: format!("[{label}: {content}]"),
                        })
                    }
                    ContentBlock::Thinking { .. } | ContentBlock::RedactedThinking { .. } => None,
                })
                .collect();
            (!blocks.is_empty()).then(|| Message::blocks(message.role, blocks))
        })
        .collect()
}

pub(crate) async fn record_answer(
    memory: Option<&dyn Memory>,
    text: &str,
) -> Result<(), CompletionError> {
    if let Some(memory) = memory {
        memory.append(Message::assistant(text)).await?;
    }
    Ok(())
}
