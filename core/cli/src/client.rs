//! Blocking client for the daemon's control socket.
//!
//! One request per connection, newline-terminated JSON both ways. A daemon
//! error response is returned as [`ClientError::Daemon`] so callers handle
//! transport and daemon failures the same way.

use chronicle_protocol::{Method, Request, Response, MAX_REQUEST_BYTES, PROTOCOL_VERSION};
use serde_json::Value;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

const READ_TIMEOUT_SECS: u64 = 30;
const WRITE_TIMEOUT_SECS: u64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to daemon at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("daemon socket I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for daemon response")]
    Timeout,

    #[error("invalid daemon response: {0}")]
    InvalidResponse(String),

    #[error("{code}: {message}")]
    Daemon { code: String, message: String },
}

pub struct DaemonClient {
    socket: PathBuf,
}

impl DaemonClient {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Sends one request and returns the response `data` (null when absent).
    pub fn call(&self, method: Method, params: Option<Value>) -> Result<Value, ClientError> {
        let request = Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some(format!("cli-{}", std::process::id())),
            params,
        };
        tracing::debug!(method = ?method, socket = %self.socket.display(), "Sending daemon request");

        let response = self.send(&request)?;
        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let (code, message) = response
                .error
                .map(|err| (err.code, err.message))
                .unwrap_or_else(|| ("unknown".to_string(), "Unknown daemon error".to_string()));
            tracing::warn!(method = ?method, code = %code, message = %message, "Daemon returned error");
            Err(ClientError::Daemon { code, message })
        }
    }

    fn send(&self, request: &Request) -> Result<Response, ClientError> {
        let mut stream =
            UnixStream::connect(&self.socket).map_err(|source| ClientError::Connect {
                path: self.socket.clone(),
                source,
            })?;
        stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)))?;
        stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)))?;

        let mut bytes = serde_json::to_vec(request)
            .map_err(|err| ClientError::InvalidResponse(format!("unencodable request: {}", err)))?;
        bytes.push(b'\n');
        stream.write_all(&bytes)?;
        stream.flush()?;

        read_response(&mut stream)
    }
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::InvalidResponse(
                        "response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ClientError::Timeout);
            }
            Err(err) => return Err(ClientError::Io(err)),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };
    if response_bytes.is_empty() {
        return Err(ClientError::InvalidResponse(
            "daemon response was empty".to_string(),
        ));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::InvalidResponse(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread;

    fn read_request(stream: &mut UnixStream) -> Request {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).expect("read");
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..n]);
            if buffer.contains(&b'\n') {
                break;
            }
        }
        let end = buffer.iter().position(|b| *b == b'\n').unwrap_or(buffer.len());
        serde_json::from_slice(&buffer[..end]).expect("request json")
    }

    fn serve_once(socket: PathBuf, response: Response) -> thread::JoinHandle<Request> {
        let listener = UnixListener::bind(&socket).expect("bind");
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);
            let mut payload = serde_json::to_vec(&response).expect("encode");
            payload.push(b'\n');
            stream.write_all(&payload).expect("write");
            request
        })
    }

    #[test]
    fn call_returns_data_on_success() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("daemon.sock");
        let server = serve_once(
            socket.clone(),
            Response::ok(None, serde_json::json!({"status": "ok"})),
        );

        let client = DaemonClient::new(&socket);
        let data = client.call(Method::GetHealth, None).expect("health");
        assert_eq!(data["status"], "ok");

        let request = server.join().expect("server");
        assert_eq!(request.method, Method::GetHealth);
        assert_eq!(request.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn daemon_errors_keep_code_and_message() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let socket = temp_dir.path().join("daemon.sock");
        let server = serve_once(
            socket.clone(),
            Response::error(None, "already_processing", "processing already in flight"),
        );

        let client = DaemonClient::new(&socket);
        let err = client
            .call(
                Method::TriggerProcessing,
                Some(serde_json::json!({"path": "/notes/a.md"})),
            )
            .expect_err("daemon error");
        match err {
            ClientError::Daemon { code, message } => {
                assert_eq!(code, "already_processing");
                assert!(message.contains("in flight"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let request = server.join().expect("server");
        assert_eq!(request.params.expect("params")["path"], "/notes/a.md");
    }

    #[test]
    fn missing_daemon_is_a_connect_error() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let client = DaemonClient::new(temp_dir.path().join("absent.sock"));
        let err = client.call(Method::GetHealth, None).expect_err("no daemon");
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
