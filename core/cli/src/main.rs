//! chronicle: command-line client for the Chronicle daemon.
//!
//! Every subcommand is one control request to `chronicled`; the response
//! data is printed as JSON on stdout.
//!
//! ## Subcommands
//!
//! - `status`: daemon health
//! - `open` / `track` / `edit` / `close` / `end`: document session lifecycle
//! - `process` / `cancel` / `result`: AI processing
//! - `snapshot`: commit everything that changed

mod client;
mod logging;

use chronicle_core::config::daemon_socket_path;
use chronicle_protocol::{DocumentParams, Method, SnapshotParams};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use client::{ClientError, DaemonClient};

const POLL_INTERVAL_MS: u64 = 500;

#[derive(Parser)]
#[command(name = "chronicle")]
#[command(about = "Writing sessions and history for a Chronicle workspace")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show daemon health
    Status,

    /// Open a document and start (or resume) its session
    Open {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Open a document without starting its session; the first edit starts it
    Track {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Record an edit to an open document
    Edit {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// End the session if needed and close the document
    Close {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// End the document's session now
    End {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Show the document's session
    Session {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Ask the worker to process the document
    Process {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Processing style (defaults to the worker's standard style)
        #[arg(long)]
        style: Option<String>,

        /// Wait for the result instead of returning after acknowledgement
        #[arg(long)]
        wait: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },

    /// Stop waiting for the document's processing result
    Cancel {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Fetch (and clear) the latest processing result
    Result {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },

    /// Commit every modified file
    Snapshot {
        /// Commit title (defaults to the open document's title)
        #[arg(long)]
        label: Option<String>,
    },
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    let socket = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            eprintln!("chronicle: {}", err);
            std::process::exit(1);
        }
    };
    let client = DaemonClient::new(socket);

    match run(&client, cli.command) {
        Ok(data) => match serde_json::to_string_pretty(&data) {
            Ok(text) => println!("{}", text),
            Err(err) => {
                eprintln!("chronicle: failed to format response: {}", err);
                std::process::exit(1);
            }
        },
        Err(err) => {
            tracing::error!(error = %err, socket = %client.socket().display(), "chronicle command failed");
            eprintln!("chronicle: {}", err);
            std::process::exit(1);
        }
    }
}

fn run(client: &DaemonClient, command: Commands) -> Result<Value, ClientError> {
    match command {
        Commands::Status => client.call(Method::GetHealth, None),
        Commands::Open { path } => document_call(client, Method::OpenDocument, &path, None),
        Commands::Track { path } => document_call(client, Method::TrackDocument, &path, None),
        Commands::Edit { path } => document_call(client, Method::RecordEdit, &path, None),
        Commands::Close { path } => document_call(client, Method::CloseDocument, &path, None),
        Commands::End { path } => document_call(client, Method::EndSession, &path, None),
        Commands::Session { path } => document_call(client, Method::GetSession, &path, None),
        Commands::Process {
            path,
            style,
            wait,
            timeout_secs,
        } => {
            let ack = document_call(client, Method::TriggerProcessing, &path, style)?;
            if wait {
                wait_for_result(client, &path, Duration::from_secs(timeout_secs))
            } else {
                Ok(ack)
            }
        }
        Commands::Cancel { path } => document_call(client, Method::CancelProcessing, &path, None),
        Commands::Result { path } => {
            document_call(client, Method::GetProcessingResult, &path, None)
        }
        Commands::Snapshot { label } => {
            let params = serde_json::to_value(SnapshotParams { label })
                .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
            client.call(Method::Snapshot, Some(params))
        }
    }
}

fn document_call(
    client: &DaemonClient,
    method: Method,
    path: &Path,
    style: Option<String>,
) -> Result<Value, ClientError> {
    let params = DocumentParams {
        path: absolute_path(path)?.to_string_lossy().to_string(),
        style,
    };
    let params = serde_json::to_value(params)
        .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
    client.call(method, Some(params))
}

fn wait_for_result(
    client: &DaemonClient,
    path: &Path,
    timeout: Duration,
) -> Result<Value, ClientError> {
    let deadline = Instant::now() + timeout;
    loop {
        let data = document_call(client, Method::GetProcessingResult, path, None)?;
        if !data["result"].is_null() {
            return Ok(data);
        }
        if data["in_flight"] != Value::Bool(true) {
            // Cancelled or lost; nothing more will arrive.
            return Ok(data);
        }
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout);
        }
        thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
    }
}

/// Documents are keyed by absolute path; resolve symlinks when the file exists
/// so the daemon sees the same key the editor uses.
fn absolute_path(path: &Path) -> Result<PathBuf, ClientError> {
    if let Ok(canonical) = fs_err::canonicalize(path) {
        return Ok(canonical);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
