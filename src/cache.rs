//! Prompt-cache breakpoints.
//!
//! The service caches the whole prefix up to a marked segment, so each
//! section gets at most one marker, on its last element. Sections whose
//! option is off pass through untouched.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheTtl {
    #[default]
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1h")]
    OneHour,
}

impl FromStr for CacheTtl {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | "5m" => Ok(Self::FiveMinutes),
            "1h" => Ok(Self::OneHour),
            other => Err(format!("unsupported cache ttl {other:?}, expected \"5m\" or \"1h\"")),
        }
    }
}

impl fmt::Display for CacheTtl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FiveMinutes => f.write_str("5m"),
            Self::OneHour => f.write_str("1h"),
        }
    }
}

/// Which request sections get a cache breakpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub system: bool,
    pub tools: bool,
    pub conversation: bool,
    pub ttl: CacheTtl,
}

impl CacheOptions {
    /// Everything cached with the default TTL.
    pub fn all() -> Self {
        Self {
            system: true,
            tools: true,
            conversation: true,
            ttl: CacheTtl::FiveMinutes,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.system || self.tools || self.conversation
    }

    /// The marker attached to a cached segment.
    pub fn marker(&self) -> Value {
        match self.ttl {
            CacheTtl::FiveMinutes => json!({"type": "ephemeral"}),
            CacheTtl::OneHour => json!({"type": "ephemeral", "ttl": "1h"}),
        }
    }
}

/// Serialize a request body, adding cache markers where enabled.
///
/// With every option off this is exactly `serde_json::to_vec(body)`.
pub fn encode_body<T: Serialize>(body: &T, options: &CacheOptions) -> Result<Vec<u8>, serde_json::Error> {
    if !options.is_enabled() {
        return serde_json::to_vec(body);
    }
    let mut value = serde_json::to_value(body)?;
    apply_markers(&mut value, options);
    serde_json::to_vec(&value)
}

/// Mark the cacheable sections of an already-serialized body in place.
pub fn apply_markers(body: &mut Value, options: &CacheOptions) {
    let marker = options.marker();

    if options.system {
        if let Some(system) = body.get_mut("system") {
            mark_content(system, &marker);
        }
    }

    if options.tools {
        if let Some(last) = body
            .get_mut("tools")
            .and_then(Value::as_array_mut)
            .and_then(|tools| tools.last_mut())
        {
            last["cache_control"] = marker.clone();
        }
    }

    if options.conversation {
        if let Some(last) = body
            .get_mut("messages")
            .and_then(Value::as_array_mut)
            .and_then(|messages| messages.last_mut())
        {
            if let Some(content) = last.get_mut("content") {
                mark_content(content, &marker);
            }
        }
    }
}

/// Flat strings become a one-element text block array; block arrays get
/// the marker on their final block.
fn mark_content(content: &mut Value, marker: &Value) {
    match content {
        Value::String(text) => {
            *content = json!([{
                "type": "text",
                "text": std::mem::take(text),
                "cache_control": marker,
            }]);
        }
        Value::Array(blocks) => {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = marker.clone();
            }
        }
        _ => {}
    }
}
