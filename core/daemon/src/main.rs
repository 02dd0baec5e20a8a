//! Chronicle daemon entrypoint.
//!
//! Hosts the core engine for one workspace: serves the control protocol on a
//! Unix socket, keeps the worker channel connected and ends idle sessions on
//! a timer.

use clap::Parser;
use fs_err as fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chronicle_core::config::{daemon_socket_path, debug_log_enabled};
use chronicle_core::{Chronicle, CommitOutcome};

mod control;

#[derive(Parser)]
#[command(name = "chronicled")]
#[command(about = "Session tracking and history daemon for a Chronicle workspace")]
#[command(version)]
struct Args {
    /// Workspace directory (defaults to the current directory)
    #[arg(long, short = 'w')]
    workspace: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    init_logging();
    let args = Args::parse();

    let workspace = match resolve_workspace(args.workspace) {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve workspace");
            std::process::exit(1);
        }
    };

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let engine = match Chronicle::open_workspace(&workspace) {
        Ok(engine) => engine,
        Err(err) => {
            error!(error = %err, workspace = %workspace.display(), "Failed to open workspace");
            std::process::exit(1);
        }
    };

    match engine.init_workspace().await {
        CommitOutcome::Failed { error } => {
            warn!(error = %error, "Workspace init commit failed; continuing without history");
        }
        outcome => info!(outcome = ?outcome, "Workspace repository ready"),
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    engine.spawn_channel_supervisor();
    engine.spawn_timeout_checker();
    info!(
        path = %socket_path.display(),
        workspace = %workspace.display(),
        "Chronicle daemon started"
    );

    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&engine)) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
        }
    }

    engine.shutdown();
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to remove daemon socket on shutdown");
    }
}

async fn accept_loop(listener: UnixListener, engine: Arc<Chronicle>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let engine = Arc::clone(&engine);
                tokio::spawn(control::handle_connection(stream, engine));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn init_logging() {
    let filter = if debug_log_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn resolve_workspace(workspace: Option<PathBuf>) -> Result<PathBuf, String> {
    let workspace = match workspace {
        Some(path) => path,
        None => std::env::current_dir()
            .map_err(|err| format!("Failed to read current directory: {}", err))?,
    };
    fs::create_dir_all(&workspace)
        .map_err(|err| format!("Failed to create workspace directory: {}", err))?;
    fs::canonicalize(&workspace).map_err(|err| format!("Failed to resolve workspace: {}", err))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}
