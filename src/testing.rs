//! Scripted provider and fixtures shared by the loop tests.

use std::collections::VecDeque;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::InferenceError;
use crate::events::{EventStream, StreamEvent, StreamEventKind};
use crate::inference::InferenceProvider;
use crate::tools::ToolHandler;
use crate::types::{
    CompletionRequest, CompletionResponse, ContentBlock, StopReason, ToolCall, Usage,
};

pub(crate) enum Reply {
    Message(CompletionResponse),
    Events(Vec<Result<StreamEvent, InferenceError>>),
    Fail(InferenceError),
}

/// Pops one scripted reply per call and records every request.
pub(crate) struct MockProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub(crate) fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    async fn next(&self, request: &CompletionRequest) -> Option<Reply> {
        self.requests.lock().await.push(request.clone());
        self.replies.lock().await.pop_front()
    }
}

#[async_trait]
impl InferenceProvider for MockProvider {
    async fn infer(
        &self,
        request: &CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<CompletionResponse, InferenceError> {
        match self.next(request).await {
            Some(Reply::Message(response)) => Ok(response),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Events(_)) => Err(InferenceError::Request("scripted a stream".into())),
            None => Err(InferenceError::Request("no more mock responses".into())),
        }
    }

    async fn infer_stream(
        &self,
        request: &CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<EventStream, InferenceError> {
        match self.next(request).await {
            Some(Reply::Events(events)) => Ok(Box::pin(futures::stream::iter(events))),
            Some(Reply::Fail(e)) => Err(e),
            Some(Reply::Message(_)) => Err(InferenceError::Request("scripted a message".into())),
            None => Err(InferenceError::Request("no more mock responses".into())),
        }
    }
}

fn usage() -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: 5,
        ..Default::default()
    }
}

pub(crate) fn text_reply(text: &str) -> Reply {
    Reply::Message(CompletionResponse {
        id: "msg".into(),
        model: "test-model".into(),
        content: vec![ContentBlock::Text { text: text.into() }],
        stop_reason: StopReason::EndTurn,
        usage: usage(),
    })
}

pub(crate) fn empty_reply() -> Reply {
    Reply::Message(CompletionResponse {
        id: "msg".into(),
        model: "test-model".into(),
        content: vec![],
        stop_reason: StopReason::EndTurn,
        usage: usage(),
    })
}

pub(crate) fn tool_reply(calls: &[(&str, &str, Value)]) -> Reply {
    let mut content = vec![ContentBlock::Text {
        text: "Let me use a tool.".into(),
    }];
    content.extend(calls.iter().map(|(id, name, input)| ContentBlock::ToolUse {
        id: (*id).into(),
        name: (*name).into(),
        input: input.clone(),
    }));
    Reply::Message(CompletionResponse {
        id: "msg".into(),
        model: "test-model".into(),
        content,
        stop_reason: StopReason::ToolUse,
        usage: usage(),
    })
}

fn event(kind: StreamEventKind) -> Result<StreamEvent, InferenceError> {
    Ok(StreamEvent::new(kind))
}

fn message_stop(reason: StopReason) -> Result<StreamEvent, InferenceError> {
    event(StreamEventKind::MessageStop {
        stop_reason: Some(reason),
        usage: usage(),
    })
}

/// A decoded text turn, split into the given deltas.
pub(crate) fn text_stream(deltas: &[&str]) -> Reply {
    let mut events = vec![event(StreamEventKind::MessageStart {
        id: "msg".into(),
        model: "test-model".into(),
    })];
    events.extend(deltas.iter().map(|d| {
        event(StreamEventKind::ContentDelta {
            index: 0,
            text: (*d).into(),
        })
    }));
    events.push(event(StreamEventKind::ContentComplete { index: 0 }));
    events.push(message_stop(StopReason::EndTurn));
    Reply::Events(events)
}

/// A decoded turn with some preamble text and one tool call.
pub(crate) fn tool_stream(id: &str, name: &str, arguments: &str) -> Reply {
    Reply::Events(vec![
        event(StreamEventKind::MessageStart {
            id: "msg".into(),
            model: "test-model".into(),
        }),
        event(StreamEventKind::ContentDelta {
            index: 0,
            text: "Checking with a tool.".into(),
        }),
        event(StreamEventKind::ContentComplete { index: 0 }),
        event(StreamEventKind::ToolUse {
            index: 1,
            call: ToolCall {
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
        }),
        message_stop(StopReason::ToolUse),
    ])
}

/// Evaluates `a <op> b` from `{"a": .., "b": .., "op": ..}`.
pub(crate) struct CalculatorTool;

#[async_trait]
impl ToolHandler for CalculatorTool {
    async fn call(&self, input: &Value) -> Result<String, String> {
        let a = input["a"].as_f64().ok_or("missing a")?;
        let b = input["b"].as_f64().ok_or("missing b")?;
        let result = match input["op"].as_str().unwrap_or("+") {
            "+" => a + b,
            "-" => a - b,
            "*" => a * b,
            "/" if b != 0.0 => a / b,
            "/" => return Err("division by zero".into()),
            op => return Err(format!("unknown operator {op}")),
        };
        Ok(result.to_string())
    }
}
