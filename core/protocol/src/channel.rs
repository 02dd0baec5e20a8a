//! Worker channel messages.
//!
//! Every frame is one JSON object terminated by `\n` and tagged by `type`:
//!
//! ```json
//! { "type": "request",  "id": "...", "method": "...", "params": {...} }
//! { "type": "response", "id": "...", "result": {...} }
//! { "type": "response", "id": "...", "error": "..." }
//! { "type": "push",     "event": "...", "data": {...} }
//! ```
//!
//! The transport only looks at `type`, `id` and `event`; payload shapes are
//! owned by the components that send or consume them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{require_string, ErrorInfo, MAX_REQUEST_BYTES};

pub const METHOD_GET_CURRENT_FILE: &str = "getCurrentFile";
pub const METHOD_GET_WORKSPACE_PATH: &str = "getWorkspacePath";
pub const METHOD_TRIGGER_PROCESSING: &str = "triggerProcessing";

pub const EVENT_PROCESSING_COMPLETE: &str = "ai:processing-complete";
pub const EVENT_PROCESSING_ERROR: &str = "ai:processing-error";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Request(ChannelRequest),
    Response(ChannelResponse),
    Push(PushMessage),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChannelResponse {
    pub fn ok(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// An `error` member wins over `result`; a bare response resolves to null.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// Serializes one message as a newline-terminated frame.
pub fn encode_frame(message: &ChannelMessage) -> Result<Vec<u8>, ErrorInfo> {
    let mut bytes = serde_json::to_vec(message).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("failed to encode frame: {}", err),
        )
    })?;
    if bytes.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "frame_too_large",
            "frame exceeded maximum size",
        ));
    }
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parses one frame. Trailing newline and surrounding whitespace are ignored.
pub fn decode_frame(bytes: &[u8]) -> Result<ChannelMessage, ErrorInfo> {
    if bytes.len() > MAX_REQUEST_BYTES {
        return Err(ErrorInfo::new(
            "frame_too_large",
            "frame exceeded maximum size",
        ));
    }
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_frame", "frame body was empty"));
    }
    serde_json::from_slice(bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("frame was not a valid channel message: {}", err),
        )
    })
}

pub const DEFAULT_PROCESSING_STYLE: &str = "standard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerProcessingParams {
    pub path: String,
    pub style: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

/// Structured output of one AI processing run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingResult {
    #[serde(default)]
    pub summary: String,
    pub style: String,
    #[serde(default)]
    pub tokens: TokenUsage,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingCompletePayload {
    pub path: String,
    pub result: ProcessingResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingErrorPayload {
    pub path: String,
    pub error: String,
}

/// Reply to `getCurrentFile`. Fields are null when no document is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentFile {
    pub path: Option<String>,
    pub relative_path: Option<String>,
    pub content: Option<String>,
    pub session: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CurrentFile {
    pub fn none() -> Self {
        Self {
            path: None,
            relative_path: None,
            content: None,
            session: None,
            error: Some("No file currently open".to_string()),
        }
    }
}

pub fn parse_processing_complete(data: Value) -> Result<ProcessingCompletePayload, ErrorInfo> {
    let payload: ProcessingCompletePayload = serde_json::from_value(data).map_err(|err| {
        ErrorInfo::new(
            "invalid_push",
            format!("processing-complete payload is invalid: {}", err),
        )
    })?;
    require_string(&Some(payload.path.clone()), "path")?;
    Ok(payload)
}

pub fn parse_processing_error(data: Value) -> Result<ProcessingErrorPayload, ErrorInfo> {
    let payload: ProcessingErrorPayload = serde_json::from_value(data).map_err(|err| {
        ErrorInfo::new(
            "invalid_push",
            format!("processing-error payload is invalid: {}", err),
        )
    })?;
    require_string(&Some(payload.path.clone()), "path")?;
    Ok(payload)
}
