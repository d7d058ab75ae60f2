//! Incremental decoder for the service's server-sent-event stream.
//!
//! Fed one line at a time. Keeps per-block state for the life of one stream:
//! which block indices are thinking blocks, and which are tool calls still
//! accumulating their JSON arguments. Tool calls are held back until their
//! block closes so callers never observe partial arguments.

use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::error::{DecodeError, InferenceError};
use crate::events::{EventStream, StreamEvent, StreamEventKind};
use crate::types::{StopReason, ToolCall, Usage};

const DONE_SENTINEL: &str = "[DONE]";

/// Longest SSE line accepted from a transport before the stream is failed.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// What to do with a tool call whose block never closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteToolPolicy {
    /// Discard it and log a warning.
    #[default]
    Drop,
    /// Surface [`DecodeError::IncompleteToolCall`] from [`EventDecoder::finish`].
    Error,
}

#[derive(Debug, Clone)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

/// Per-stream decoding state.
#[derive(Debug, Default)]
pub struct EventDecoder {
    thinking_blocks: HashSet<u32>,
    tool_calls: BTreeMap<u32, PendingToolCall>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    done: bool,
    policy: IncompleteToolPolicy,
}

impl EventDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: IncompleteToolPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// True once the `[DONE]` sentinel or a `message_stop` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of tool calls still waiting for their block to close.
    pub fn pending_tool_calls(&self) -> usize {
        self.tool_calls.len()
    }

    /// Decode one raw SSE line. `Ok(None)` means the line produced no event.
    pub fn decode_line(&mut self, line: &str) -> Result<Option<StreamEvent>, DecodeError> {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }
        match line.strip_prefix("data:") {
            Some(data) => self.decode_payload(data.strip_prefix(' ').unwrap_or(data)),
            // `event:`, `id:`, `retry:`; the payload carries its own type.
            None => Ok(None),
        }
    }

    /// Decode one event payload (the text after `data:`).
    pub fn decode_payload(&mut self, data: &str) -> Result<Option<StreamEvent>, DecodeError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(None);
        }
        if data == DONE_SENTINEL {
            self.done = true;
            return Ok(None);
        }

        let event: WireEvent = serde_json::from_str(data).map_err(|source| DecodeError::Json {
            line: data.to_string(),
            source,
        })?;

        Ok(self.apply(event))
    }

    fn apply(&mut self, event: WireEvent) -> Option<StreamEvent> {
        match event {
            WireEvent::MessageStart { message } => {
                self.usage.accumulate(&message.usage);
                Some(
                    StreamEvent::new(StreamEventKind::MessageStart {
                        id: message.id,
                        model: message.model,
                    })
                    .with_metadata("input_tokens", message.usage.input_tokens),
                )
            }
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                WireBlock::Thinking { thinking, .. } => {
                    self.thinking_blocks.insert(index);
                    Some(StreamEvent::new(StreamEventKind::ThinkingDelta {
                        index,
                        text: thinking,
                    }))
                }
                WireBlock::RedactedThinking { data } => {
                    self.thinking_blocks.insert(index);
                    Some(
                        StreamEvent::new(StreamEventKind::ThinkingDelta {
                            index,
                            text: String::new(),
                        })
                        .with_metadata("redacted", data),
                    )
                }
                WireBlock::ToolUse { id, name } => {
                    self.tool_calls.insert(
                        index,
                        PendingToolCall {
                            id,
                            name,
                            arguments: String::new(),
                        },
                    );
                    None
                }
                WireBlock::Text { text } => {
                    Some(StreamEvent::new(StreamEventKind::ContentDelta { index, text }))
                }
                WireBlock::Unknown => {
                    debug!(index, "ignoring unknown content block type");
                    None
                }
            },
            WireEvent::ContentBlockDelta { index, delta } => match delta {
                WireDelta::InputJsonDelta { partial_json } => {
                    match self.tool_calls.get_mut(&index) {
                        Some(call) => call.arguments.push_str(&partial_json),
                        None => warn!(index, "argument delta for a block that is not a tool call"),
                    }
                    None
                }
                WireDelta::SignatureDelta { signature } => Some(
                    StreamEvent::new(StreamEventKind::ThinkingDelta {
                        index,
                        text: String::new(),
                    })
                    .with_metadata("signature", signature),
                ),
                WireDelta::ThinkingDelta { thinking } => {
                    Some(StreamEvent::new(StreamEventKind::ThinkingDelta {
                        index,
                        text: thinking,
                    }))
                }
                WireDelta::TextDelta { text } => {
                    let kind = if self.thinking_blocks.contains(&index) {
                        StreamEventKind::ThinkingDelta { index, text }
                    } else {
                        StreamEventKind::ContentDelta { index, text }
                    };
                    Some(StreamEvent::new(kind))
                }
                WireDelta::Unknown => None,
            },
            WireEvent::ContentBlockStop { index } => {
                self.thinking_blocks.remove(&index);
                match self.tool_calls.remove(&index) {
                    Some(call) => Some(StreamEvent::new(StreamEventKind::ToolUse {
                        index,
                        call: ToolCall {
                            id: call.id,
                            name: call.name,
                            arguments: call.arguments,
                        },
                    })),
                    None => Some(StreamEvent::new(StreamEventKind::ContentComplete { index })),
                }
            }
            WireEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(StopReason::parse(&reason));
                }
                if let Some(usage) = usage {
                    // Output counts are cumulative within one message.
                    self.usage.output_tokens = usage.output_tokens;
                }
                None
            }
            WireEvent::MessageStop => {
                self.done = true;
                Some(StreamEvent::new(StreamEventKind::MessageStop {
                    stop_reason: self.stop_reason.clone(),
                    usage: self.usage.clone(),
                }))
            }
            WireEvent::Error { error } => Some(
                StreamEvent::error(error.message).with_metadata("error_type", error.kind),
            ),
            WireEvent::Ping | WireEvent::Unknown => None,
        }
    }

    /// Close out the stream, applying the incomplete-tool-call policy.
    pub fn finish(&mut self) -> Result<(), DecodeError> {
        let pending = std::mem::take(&mut self.tool_calls);
        let Some((index, call)) = pending.into_iter().next() else {
            return Ok(());
        };
        match self.policy {
            IncompleteToolPolicy::Drop => {
                warn!(
                    index,
                    tool = %call.name,
                    id = %call.id,
                    "stream ended mid tool call, dropping it"
                );
                Ok(())
            }
            IncompleteToolPolicy::Error => Err(DecodeError::IncompleteToolCall {
                id: call.id,
                name: call.name,
            }),
        }
    }
}

// --- Wire payloads ---

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: WireBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: WireDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<Usage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    RedactedThinking {
        #[serde(default)]
        data: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

// --- Stream adapters ---

type LineStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

/// Split a byte stream (an HTTP body) into lines of at most
/// [`MAX_LINE_BYTES`].
pub fn lines_from_bytes<S, E>(bytes: S) -> impl Stream<Item = Result<String, InferenceError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    lines_from_bytes_with_limit(bytes, MAX_LINE_BYTES)
}

/// Like [`lines_from_bytes`] with a caller-chosen line limit. A longer line
/// yields [`InferenceError::Stream`].
pub fn lines_from_bytes_with_limit<S, E>(
    bytes: S,
    max_line_bytes: usize,
) -> impl Stream<Item = Result<String, InferenceError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let reader = StreamReader::new(bytes.map(|chunk| chunk.map_err(std::io::Error::other)));
    FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_bytes))
        .map(|line| line.map_err(|e| InferenceError::Stream(e.to_string())))
}

#[derive(Debug, Clone, Copy)]
enum Framing {
    /// Raw SSE lines, `data:` prefixed.
    Lines,
    /// One bare JSON payload per item.
    Payloads,
}

/// Drive a decoder over a line stream.
///
/// Malformed payloads are logged and skipped. A transport error ends the
/// stream after being yielded. End of input runs [`EventDecoder::finish`].
pub fn decode_lines<S>(lines: S, decoder: EventDecoder) -> EventStream
where
    S: Stream<Item = Result<String, InferenceError>> + Send + 'static,
{
    drive(Box::pin(lines), decoder, Framing::Lines)
}

/// Like [`decode_lines`], for transports that deliver each event payload
/// as its own chunk with no SSE framing.
pub fn decode_payloads<S>(payloads: S, decoder: EventDecoder) -> EventStream
where
    S: Stream<Item = Result<String, InferenceError>> + Send + 'static,
{
    drive(Box::pin(payloads), decoder, Framing::Payloads)
}

fn drive(items: LineStream, decoder: EventDecoder, framing: Framing) -> EventStream {
    Box::pin(futures::stream::unfold(
        Some((items, decoder)),
        move |state| async move {
            let (mut items, mut decoder) = state?;
            loop {
                if decoder.is_done() {
                    return finish_stream(decoder);
                }
                let item = match items.next().await {
                    Some(Ok(item)) => item,
                    Some(Err(e)) => return Some((Err(e), None)),
                    None => return finish_stream(decoder),
                };
                let decoded = match framing {
                    Framing::Lines => decoder.decode_line(&item),
                    Framing::Payloads => decoder.decode_payload(&item),
                };
                match decoded {
                    Ok(Some(event)) => return Some((Ok(event), Some((items, decoder)))),
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, "skipping malformed stream event"),
                }
            }
        },
    ))
}

fn finish_stream<T>(
    mut decoder: EventDecoder,
) -> Option<(Result<StreamEvent, InferenceError>, Option<T>)> {
    match decoder.finish() {
        Ok(()) => None,
        Err(e) => Some((Err(InferenceError::Stream(e.to_string())), None)),
    }
}
