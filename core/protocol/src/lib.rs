//! IPC protocol types and validation for Chronicle.
//!
//! Two wire contracts live here so the daemon, the CLI and the core library
//! never drift apart:
//!
//! - the **control protocol** spoken on the daemon socket by editors and the
//!   `chronicle` CLI (this module), and
//! - the **worker channel** connecting the application to the out-of-process
//!   AI worker ([`channel`]).
//!
//! Both are newline-delimited JSON. The daemon remains the authority on
//! validation, but clients reuse the same types to construct valid requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod channel;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

pub const ERROR_ALREADY_PROCESSING: &str = "already_processing";
pub const ERROR_ALREADY_ACTIVE_ELSEWHERE: &str = "already_active_elsewhere";
pub const ERROR_DISCONNECTED: &str = "disconnected";
pub const ERROR_TIMEOUT: &str = "timeout";
pub const ERROR_NOT_TRACKED: &str = "not_tracked";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    OpenDocument,
    TrackDocument,
    RecordEdit,
    CloseDocument,
    EndSession,
    GetSession,
    TriggerProcessing,
    CancelProcessing,
    GetProcessingResult,
    Snapshot,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Parameters for every document-scoped control method.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DocumentParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
}

impl DocumentParams {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            style: None,
        }
    }

    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_string(&Some(self.path.clone()), "path")?;
        if !self.path.starts_with('/') {
            return Err(ErrorInfo::new(
                "invalid_path",
                "path must be absolute",
            ));
        }
        if let Some(style) = &self.style {
            if style.trim().is_empty() {
                return Err(ErrorInfo::new("invalid_style", "style must not be blank"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SnapshotParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

pub fn parse_document_params(params: Option<Value>) -> Result<DocumentParams, ErrorInfo> {
    let params =
        params.ok_or_else(|| ErrorInfo::new("invalid_params", "path is required"))?;
    let parsed: DocumentParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("document params are invalid: {}", err),
        )
    })?;
    parsed.validate()?;
    Ok(parsed)
}

pub fn parse_snapshot_params(params: Option<Value>) -> Result<SnapshotParams, ErrorInfo> {
    match params {
        None | Some(Value::Null) => Ok(SnapshotParams::default()),
        Some(value) => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("snapshot params are invalid: {}", err),
            )
        }),
    }
}

pub(crate) fn require_string(value: &Option<String>, field: &str) -> Result<(), ErrorInfo> {
    if let Some(candidate) = value {
        if !candidate.trim().is_empty() {
            return Ok(());
        }
    }
    Err(ErrorInfo::new(
        "missing_field",
        format!("{} is required", field),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_document_params() {
        let params = parse_document_params(Some(json!({ "path": "/notes/a.md" })))
            .expect("valid params");
        assert_eq!(params.path, "/notes/a.md");
        assert_eq!(params.style, None);
    }

    #[test]
    fn rejects_relative_path() {
        let err = parse_document_params(Some(json!({ "path": "notes/a.md" })))
            .expect_err("relative path");
        assert_eq!(err.code, "invalid_path");
    }

    #[test]
    fn rejects_missing_params() {
        let err = parse_document_params(None).expect_err("missing params");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_document_params(Some(json!({ "path": "/a.md", "extra": 1 })))
            .expect_err("unknown field");
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn rejects_blank_style() {
        let err = parse_document_params(Some(json!({ "path": "/a.md", "style": "  " })))
            .expect_err("blank style");
        assert_eq!(err.code, "invalid_style");
    }

    #[test]
    fn snapshot_params_default_when_absent() {
        assert_eq!(parse_snapshot_params(None).expect("none"), SnapshotParams::default());
        let parsed = parse_snapshot_params(Some(json!({ "label": "before trip" })))
            .expect("label");
        assert_eq!(parsed.label.as_deref(), Some("before trip"));
    }

    #[test]
    fn method_names_are_snake_case() {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetProcessingResult,
            id: Some("r-1".to_string()),
            params: None,
        };
        let encoded = serde_json::to_value(&request).expect("serialize");
        assert_eq!(encoded["method"], "get_processing_result");
    }
}
