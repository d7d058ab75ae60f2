//! Recorded events of one streamed model turn.
//!
//! The streaming loop records every event of a turn, reassembles the
//! assistant message from them, and decides afterwards which events the
//! caller gets to see.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::events::{StreamEvent, StreamEventKind};
use crate::types::{ContentBlock, StopReason, ToolCall, Usage};

#[derive(Debug, Clone)]
enum PartialBlock {
    Text(String),
    Thinking {
        text: String,
        signature: Option<String>,
    },
    Redacted(String),
    ToolUse(ToolCall),
}

/// Events and reassembled content of one turn.
#[derive(Debug, Default)]
pub struct TurnBuffer {
    events: Vec<StreamEvent>,
    blocks: BTreeMap<u32, PartialBlock>,
    stop_reason: Option<StopReason>,
    usage: Usage,
}

impl TurnBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: StreamEvent) {
        match &event.kind {
            StreamEventKind::ContentDelta { index, text } => {
                match self
                    .blocks
                    .entry(*index)
                    .or_insert_with(|| PartialBlock::Text(String::new()))
                {
                    PartialBlock::Text(buf) => buf.push_str(text),
                    other => tracing::debug!(index, block = ?other, "text delta for non-text block"),
                }
            }
            StreamEventKind::ThinkingDelta { index, text } => {
                if let Some(data) = event.metadata.get("redacted").and_then(Value::as_str) {
                    self.blocks.insert(*index, PartialBlock::Redacted(data.to_string()));
                } else if let PartialBlock::Thinking {
                    text: buf,
                    signature,
                } = self.blocks.entry(*index).or_insert_with(|| PartialBlock::Thinking {
                    text: String::new(),
                    signature: None,
                }) {
                    buf.push_str(text);
                    if let Some(sig) = event.metadata.get("signature").and_then(Value::as_str) {
                        signature.get_or_insert_with(String::new).push_str(sig);
                    }
                }
            }
            StreamEventKind::ToolUse { index, call } => {
                self.blocks.insert(*index, PartialBlock::ToolUse(call.clone()));
            }
            StreamEventKind::MessageStop { stop_reason, usage } => {
                self.stop_reason = stop_reason.clone();
                self.usage = usage.clone();
            }
            _ => {}
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[StreamEvent] {
        &self.events
    }

    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.blocks
            .values()
            .filter_map(|b| match b {
                PartialBlock::ToolUse(call) => Some(call.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn text(&self) -> String {
        self.blocks
            .values()
            .filter_map(|b| match b {
                PartialBlock::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// The assistant message this turn produced, in block order.
    pub fn content_blocks(&self) -> Vec<ContentBlock> {
        self.blocks
            .values()
            .filter_map(|b| match b {
                PartialBlock::Text(text) if text.is_empty() => None,
                PartialBlock::Text(text) => Some(ContentBlock::Text { text: text.clone() }),
                PartialBlock::Thinking { text, signature } => Some(ContentBlock::Thinking {
                    thinking: text.clone(),
                    signature: signature.clone(),
                }),
                PartialBlock::Redacted(data) => {
                    Some(ContentBlock::RedactedThinking { data: data.clone() })
                }
                PartialBlock::ToolUse(call) => Some(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input().unwrap_or_else(|_| Value::Object(Map::new())),
                }),
            })
            .collect()
    }

    pub fn into_events(self) -> Vec<StreamEvent> {
        self.events
    }
}

/// Which recorded events of a finished turn the caller should see when
/// intermediate output is filtered.
///
/// A turn that requested tools shows only its tool-use events; its text and
/// thinking are superseded by the turns that follow. A final turn shows
/// everything.
pub fn visible_events(events: &[StreamEvent], requested_tools: bool) -> Vec<StreamEvent> {
    events
        .iter()
        .filter(|e| !requested_tools || matches!(e.kind, StreamEventKind::ToolUse { .. }))
        .cloned()
        .collect()
}
