use std::pin::Pin;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde_json::{Map, Value};

use crate::error::InferenceError;
use crate::types::{StopReason, ToolCall, Usage};

/// Decoded events of one model response.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, InferenceError>> + Send>>;

/// A typed event decoded from one response stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: StreamEventKind,
    pub timestamp: DateTime<Utc>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEventKind {
    MessageStart { id: String, model: String },
    ContentDelta { index: u32, text: String },
    ThinkingDelta { index: u32, text: String },
    /// A tool call whose arguments are complete. Never emitted mid-block.
    ToolUse { index: u32, call: ToolCall },
    ContentComplete { index: u32 },
    MessageStop {
        stop_reason: Option<StopReason>,
        usage: Usage,
    },
    Error { message: String },
}

impl StreamEvent {
    pub fn new(kind: StreamEventKind) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StreamEventKind::Error {
            message: message.into(),
        })
    }

    /// Text carried by a content delta, if any.
    pub fn content_text(&self) -> Option<&str> {
        match &self.kind {
            StreamEventKind::ContentDelta { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, StreamEventKind::Error { .. })
    }
}
