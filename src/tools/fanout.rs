//! Concurrent execution of one batch of model-requested tool calls.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Mutex, PoisonError};

use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::registry::ToolRegistry;
use crate::memory::Memory;
use crate::types::{Message, Role, ToolCall, ToolResult};

/// Identical calls beyond this count get a repetition warning.
pub const DEFAULT_REPEAT_THRESHOLD: u32 = 2;

/// Counts (tool, arguments) pairs across one completion run.
#[derive(Debug)]
pub struct LoopDetector {
    counts: Mutex<HashMap<(String, String), u32>>,
    threshold: u32,
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopDetector {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_REPEAT_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            threshold,
        }
    }

    /// Record one call and return how many times it has now been seen.
    pub fn record(&self, call: &ToolCall) -> u32 {
        let key = (call.name.clone(), canonical_arguments(&call.arguments));
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    pub fn is_repeated(&self, count: u32) -> bool {
        count > self.threshold
    }
}

/// Arguments that differ only in key order or whitespace count as identical.
fn canonical_arguments(arguments: &str) -> String {
    match serde_json::from_str::<Value>(arguments) {
        Ok(value) => value.to_string(),
        Err(_) => arguments.trim().to_string(),
    }
}

fn repetition_warning(count: u32) -> String {
    format!(
        "\n\n[warning: this tool has been called {count} times with identical arguments; consider a different approach]"
    )
}

/// Execute every call concurrently and return results in request order.
///
/// Lookup failures, bad arguments, handler errors and handler panics all
/// become error results. When `memory` is given, each call and its result are appended
/// as an assistant/tool pair once the whole batch has finished.
pub async fn execute_tool_calls(
    calls: &[ToolCall],
    registry: &ToolRegistry,
    detector: &LoopDetector,
    memory: Option<&dyn Memory>,
) -> Vec<ToolResult> {
    let results = join_all(calls.iter().map(|call| execute_one(call, registry, detector))).await;

    if let Some(memory) = memory {
        for (call, result) in calls.iter().zip(&results) {
            record_in_memory(memory, call, result).await;
        }
    }
    results
}

async fn execute_one(call: &ToolCall, registry: &ToolRegistry, detector: &LoopDetector) -> ToolResult {
    let count = detector.record(call);

    let (mut content, is_error) = match registry.handler(&call.name) {
        None => {
            warn!(tool = %call.name, "model requested an unknown tool");
            (format!("tool not found: {}", call.name), true)
        }
        Some(handler) => match call.input() {
            Err(e) => (format!("invalid arguments for {}: {e}", call.name), true),
            Ok(input) => {
                debug!(tool = %call.name, id = %call.id, "executing tool");
                match AssertUnwindSafe(handler.call(&input)).catch_unwind().await {
                    Ok(Ok(output)) => (output, false),
                    Ok(Err(e)) => {
                        warn!(tool = %call.name, error = %e, "tool failed");
                        (e, true)
                    }
                    Err(panic) => {
                        let reason = panic_message(panic.as_ref());
                        warn!(tool = %call.name, reason = %reason, "tool panicked");
                        (format!("tool {} panicked: {reason}", call.name), true)
                    }
                }
            }
        },
    };

    if detector.is_repeated(count) {
        warn!(tool = %call.name, count, "repeated identical tool call");
        content.push_str(&repetition_warning(count));
    }

    ToolResult {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content,
        is_error,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

async fn record_in_memory(memory: &dyn Memory, call: &ToolCall, result: &ToolResult) {
    let turns = [
        Message::assistant(format!("tool call {}: {}", call.name, call.arguments)),
        Message::new(Role::Tool, result.content.clone()),
    ];
    for turn in turns {
        if let Err(e) = memory.append(turn).await {
            warn!(tool = %call.name, error = %e, "failed to record tool call in memory");
        }
    }
}
