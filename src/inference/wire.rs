//! Messages API request/response shapes shared by every topology.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::InferenceError;
use crate::types::{
    CompletionRequest, CompletionResponse, ContentBlock, MessageContent, Role, StopReason,
    ToolDefinition, Usage,
};

/// Request body. `model` is absent for topologies that route by URL or
/// runtime model id; those carry `anthropic_version` instead.
#[derive(Debug, Clone, Serialize)]
pub struct MessagesBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anthropic_version: Option<&'static str>,
    pub max_tokens: u32,
    pub messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingParam>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ThinkingParam {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub budget_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireMessage {
    pub role: &'static str,
    pub content: MessageContent,
}

impl MessagesBody {
    pub fn new(request: &CompletionRequest) -> Self {
        let thinking = request.thinking.map(|t| ThinkingParam {
            kind: "enabled",
            budget_tokens: t.budget_tokens,
        });

        // Thinking requests reject custom temperature and top_k.
        let (temperature, top_k) = if thinking.is_some() {
            if request.sampling.temperature.is_some() || request.sampling.top_k.is_some() {
                debug!("dropping temperature/top_k, not supported with thinking");
            }
            (None, None)
        } else {
            (request.sampling.temperature, request.sampling.top_k)
        };

        Self {
            model: Some(request.model.clone()),
            anthropic_version: None,
            max_tokens: request.effective_max_tokens(),
            messages: request
                .sendable_messages()
                .map(|m| WireMessage {
                    role: wire_role(m.role),
                    content: m.content.clone(),
                })
                .collect(),
            system: request.system.clone().filter(|s| !s.trim().is_empty()),
            tools: request.tools.clone(),
            temperature,
            top_p: request.sampling.top_p,
            top_k,
            stop_sequences: request.sampling.stop_sequences.clone(),
            stream: request.stream.then_some(true),
            thinking,
        }
    }

    /// Move the model out of the body, for URL- or runtime-routed calls.
    pub fn without_model(mut self, anthropic_version: &'static str) -> Self {
        self.model = None;
        self.anthropic_version = Some(anthropic_version);
        self
    }
}

/// Tool results travel as user turns.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::Assistant => "assistant",
        Role::User | Role::Tool | Role::System => "user",
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    error: Option<WireError>,
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<Value>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

/// Parse a synchronous response. Unknown block types are skipped.
///
/// Gateways can answer with an error envelope and a success status; that
/// becomes [`InferenceError::Remote`].
pub fn parse_response(body: &[u8]) -> Result<CompletionResponse, InferenceError> {
    let wire: WireResponse =
        serde_json::from_slice(body).map_err(|e| InferenceError::Parse(e.to_string()))?;

    if wire.kind.as_deref() == Some("error") {
        let error = wire.error.unwrap_or(WireError {
            kind: "error".into(),
            message: String::new(),
        });
        return Err(InferenceError::Remote {
            kind: error.kind,
            message: error.message,
        });
    }

    let content = wire
        .content
        .into_iter()
        .filter_map(|block| match serde_json::from_value::<ContentBlock>(block) {
            Ok(ContentBlock::ToolResult { .. }) => None,
            Ok(block) => Some(block),
            Err(e) => {
                debug!(error = %e, "skipping unsupported content block");
                None
            }
        })
        .collect();

    Ok(CompletionResponse {
        id: wire.id,
        model: wire.model,
        content,
        stop_reason: wire
            .stop_reason
            .as_deref()
            .map(StopReason::parse)
            .unwrap_or(StopReason::EndTurn),
        usage: wire.usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{encode_body, CacheOptions};
    use crate::types::{Message, ThinkingConfig};
    use serde_json::json;

    fn request() -> CompletionRequest {
        let mut req = CompletionRequest::new(
            "claude-sonnet-4",
            vec![
                Message::user("What is 2+2?"),
                Message::assistant("  "),
                Message::tool_results(&[crate::types::ToolResult {
                    call_id: "toolu_1".into(),
                    name: "calc".into(),
                    content: "4".into(),
                    is_error: false,
                }]),
            ],
        );
        req.system = Some("Be brief.".into());
        req.sampling.temperature = Some(0.2);
        req.sampling.top_k = Some(5);
        req.tools = vec![ToolDefinition::new("calc", "math", json!({"type": "object"}))];
        req
    }

    #[test]
    fn body_maps_roles_and_skips_empty_turns() {
        let body = serde_json::to_value(MessagesBody::new(&request())).unwrap();
        assert_eq!(body["model"], "claude-sonnet-4");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["system"], "Be brief.");
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_result");
        assert_eq!(body["tools"][0]["name"], "calc");
        assert!(body.get("stream").is_none());
        assert!(body.get("anthropic_version").is_none());
    }

    #[test]
    fn thinking_drops_incompatible_sampling_and_pads_max_tokens() {
        let mut req = request();
        req.thinking = Some(ThinkingConfig { budget_tokens: 10_000 });
        let body = serde_json::to_value(MessagesBody::new(&req)).unwrap();
        assert_eq!(body["thinking"], json!({"type": "enabled", "budget_tokens": 10_000}));
        assert!(body.get("temperature").is_none());
        assert!(body.get("top_k").is_none());
        assert!(body["max_tokens"].as_u64().unwrap() > 10_000);
    }

    #[test]
    fn routed_body_has_no_model() {
        let body = serde_json::to_value(MessagesBody::new(&request()).without_model("vertex-2023-10-16"))
            .unwrap();
        assert!(body.get("model").is_none());
        assert_eq!(body["anthropic_version"], "vertex-2023-10-16");
    }

    #[test]
    fn uncached_encoding_matches_plain_serialization() {
        let body = MessagesBody::new(&request());
        assert_eq!(
            encode_body(&body, &CacheOptions::default()).unwrap(),
            serde_json::to_vec(&body).unwrap()
        );
    }

    #[test]
    fn parse_response_extracts_blocks() {
        let body = json!({
            "id": "msg_1",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "thinking", "thinking": "add", "signature": "s"},
                {"type": "text", "text": "Let me compute."},
                {"type": "tool_use", "id": "toolu_1", "name": "calc", "input": {"a": 2, "b": 2}},
                {"type": "server_tool_use", "id": "x"}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 20, "cache_read_input_tokens": 7}
        });
        let resp = parse_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(resp.content.len(), 3);
        assert_eq!(resp.text(), "Let me compute.");
        assert_eq!(resp.stop_reason, StopReason::ToolUse);
        assert_eq!(resp.usage.cache_read_input_tokens, 7);
        let calls = resp.tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].input().unwrap(), json!({"a": 2, "b": 2}));
    }

    #[test]
    fn error_envelope_is_a_remote_error() {
        let body = json!({"type": "error", "error": {"type": "overloaded_error", "message": "Overloaded"}});
        match parse_response(body.to_string().as_bytes()) {
            Err(InferenceError::Remote { kind, message }) => {
                assert_eq!(kind, "overloaded_error");
                assert_eq!(message, "Overloaded");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parse_response_rejects_garbage() {
        assert!(matches!(parse_response(b"<html>"), Err(InferenceError::Parse(_))));
    }
}
