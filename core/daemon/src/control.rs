//! Control protocol handling: one newline-terminated request per connection.

use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use chronicle_core::{Chronicle, EditOutcome};
use chronicle_protocol::channel::DEFAULT_PROCESSING_STYLE;
use chronicle_protocol::{
    parse_document_params, parse_snapshot_params, DocumentParams, ErrorInfo, Method, Request,
    Response, ERROR_NOT_TRACKED, MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

pub async fn handle_connection(mut stream: UnixStream, engine: Arc<Chronicle>) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response).await;
            return;
        }
    };

    debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, &engine).await;
    if let Err(err) = write_response(&mut stream, response).await {
        debug!(error = %err, "Client went away before the response was written");
    }
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::time::timeout(
            Duration::from_secs(READ_TIMEOUT_SECS),
            stream.read(&mut chunk),
        )
        .await
        .map_err(|_| ErrorInfo::new("read_timeout", "request timed out"))?;
        match read {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

async fn handle_request(request: Request, engine: &Chronicle) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    match request.method {
        Method::GetHealth => Response::ok(
            id,
            json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
                "workspace": engine.workspace().to_string_lossy(),
                "worker_connected": engine.transport().is_connected(),
                "current_document": engine.current_document(),
                "sessions": engine.sessions().len(),
            }),
        ),
        Method::Snapshot => {
            let params = match parse_snapshot_params(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            let outcome = engine.snapshot(params.label.as_deref()).await;
            info!(outcome = ?outcome, "Snapshot requested");
            to_response(id, &outcome)
        }
        method => {
            let params = match parse_document_params(request.params) {
                Ok(params) => params,
                Err(err) => return Response::error_with_info(id, err),
            };
            handle_document_method(method, id, params, engine).await
        }
    }
}

async fn handle_document_method(
    method: Method,
    id: Option<String>,
    params: DocumentParams,
    engine: &Chronicle,
) -> Response {
    let path = PathBuf::from(&params.path);
    match method {
        Method::OpenDocument => match engine.open(&path).await {
            Ok(info) => to_response(id, &info),
            Err(err) => Response::error_with_info(id, err.into()),
        },
        Method::TrackDocument => to_response(id, &engine.track(&path)),
        Method::RecordEdit => match engine.record_edit(&path).await {
            Ok(outcome) => {
                let kind = match outcome {
                    EditOutcome::Started(_) => "started",
                    EditOutcome::Active(_) => "active",
                    EditOutcome::Annotation(_) => "annotation",
                    EditOutcome::Untracked => "untracked",
                };
                Response::ok(
                    id,
                    json!({
                        "outcome": kind,
                        "session": engine.session_info(&path),
                    }),
                )
            }
            Err(err) => Response::error_with_info(id, err.into()),
        },
        Method::CloseDocument => match engine.close(&path).await {
            Ok(report) => to_response(id, &report),
            Err(err) => Response::error_with_info(id, err.into()),
        },
        Method::EndSession => match engine.end_session(&path).await {
            Ok(report) => to_response(id, &report),
            Err(err) => Response::error_with_info(id, err.into()),
        },
        Method::GetSession => match engine.session_info(&path) {
            Some(info) => to_response(id, &info),
            None => Response::error(
                id,
                ERROR_NOT_TRACKED,
                format!("no session is tracked for {}", params.path),
            ),
        },
        Method::TriggerProcessing => {
            let style = params
                .style
                .as_deref()
                .unwrap_or(DEFAULT_PROCESSING_STYLE);
            // The handle is dropped; the outcome is polled via get_processing_result.
            match engine.trigger_processing(&path, style).await {
                Ok(handle) => Response::ok(
                    id,
                    json!({ "path": handle.document_id(), "style": style, "accepted": true }),
                ),
                Err(err) => Response::error_with_info(id, err.into()),
            }
        }
        Method::CancelProcessing => {
            let cancelled = engine.cancel_processing(&path);
            Response::ok(id, json!({ "path": params.path, "cancelled": cancelled }))
        }
        Method::GetProcessingResult => {
            let result = engine.take_processing_result(&path);
            Response::ok(
                id,
                json!({
                    "path": params.path,
                    "in_flight": engine.processing_in_flight(&path),
                    "result": result,
                }),
            )
        }
        Method::GetHealth | Method::Snapshot => Response::error(
            id,
            "invalid_method",
            "method does not take document params",
        ),
    }
}

fn to_response<T: Serialize>(id: Option<String>, data: &T) -> Response {
    match serde_json::to_value(data) {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::error(
            id,
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        ),
    }
}

async fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(&response)?;
    bytes.push(b'\n');
    stream.write_all(&bytes).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_core::{ChronicleConfig, DuplexConnector, GitGateway, SystemClock};

    fn engine(workspace: &std::path::Path) -> Arc<Chronicle> {
        let config = ChronicleConfig::default();
        let (connector, _accepted) = DuplexConnector::new(1024);
        let gateway = Arc::new(GitGateway::new(workspace, &config.commits));
        Chronicle::new(
            workspace,
            config,
            Arc::new(SystemClock),
            Arc::new(connector),
            gateway,
        )
    }

    fn request(method: Method, params: Option<Value>) -> Request {
        Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some("t-1".to_string()),
            params,
        }
    }

    #[tokio::test]
    async fn rejects_protocol_mismatch() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let engine = engine(temp_dir.path());
        let mut stale = request(Method::GetHealth, None);
        stale.protocol_version = PROTOCOL_VERSION + 1;

        let response = handle_request(stale, &engine).await;
        assert!(!response.ok);
        assert_eq!(response.error.expect("error").code, "protocol_mismatch");
    }

    #[tokio::test]
    async fn document_methods_require_absolute_path() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let engine = engine(temp_dir.path());

        let response =
            handle_request(request(Method::OpenDocument, Some(json!({"path": "a.md"}))), &engine)
                .await;
        assert_eq!(response.error.expect("error").code, "invalid_path");

        let response = handle_request(request(Method::RecordEdit, None), &engine).await;
        assert_eq!(response.error.expect("error").code, "invalid_params");
    }

    #[tokio::test]
    async fn open_then_get_session() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let engine = engine(temp_dir.path());
        let path = temp_dir.path().join("a.md");
        fs_err::write(&path, "# A").expect("write");
        let params = json!({"path": path.to_string_lossy()});

        let missing =
            handle_request(request(Method::GetSession, Some(params.clone())), &engine).await;
        assert_eq!(missing.error.expect("error").code, ERROR_NOT_TRACKED);

        let opened =
            handle_request(request(Method::OpenDocument, Some(params.clone())), &engine).await;
        assert!(opened.ok);
        assert_eq!(opened.id.as_deref(), Some("t-1"));

        let session = handle_request(request(Method::GetSession, Some(params)), &engine).await;
        let data = session.data.expect("session");
        assert_eq!(data["state"], "active");
        assert_eq!(data["documentId"], path.to_string_lossy().to_string());
    }

    #[tokio::test]
    async fn tracked_document_waits_for_first_edit() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let engine = engine(temp_dir.path());
        let path = temp_dir.path().join("a.md");
        fs_err::write(&path, "# A").expect("write");
        let params = json!({"path": path.to_string_lossy()});

        let tracked =
            handle_request(request(Method::TrackDocument, Some(params.clone())), &engine).await;
        assert_eq!(tracked.data.expect("session")["state"], "inactive");

        let edit = handle_request(request(Method::RecordEdit, Some(params)), &engine).await;
        let data = edit.data.expect("edit");
        assert_eq!(data["outcome"], "started");
        assert_eq!(data["session"]["state"], "active");
    }

    #[tokio::test]
    async fn trigger_without_worker_reports_disconnected() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let engine = engine(temp_dir.path());
        let params = json!({"path": temp_dir.path().join("a.md").to_string_lossy()});

        let response =
            handle_request(request(Method::TriggerProcessing, Some(params.clone())), &engine)
                .await;
        assert_eq!(response.error.expect("error").code, "disconnected");

        let result =
            handle_request(request(Method::GetProcessingResult, Some(params)), &engine).await;
        let data = result.data.expect("data");
        assert_eq!(data["in_flight"], false);
        assert!(data["result"].is_null());
    }
}
