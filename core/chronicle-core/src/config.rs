//! Configuration loading and path resolution.
//!
//! Workspace settings live in `<workspace>/.chronicle/config.toml`. Every
//! field has a default so a missing file, or a file with only one section,
//! is valid. Sockets and logs live under `~/.chronicle`.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const WORKER_SOCKET_ENV: &str = "CHRONICLE_WORKER_SOCKET";
pub const DAEMON_SOCKET_ENV: &str = "CHRONICLE_DAEMON_SOCKET";
pub const DEBUG_LOG_ENV: &str = "CHRONICLE_DEBUG_LOG";

const CHRONICLE_DIR: &str = ".chronicle";
const CONFIG_FILE: &str = "config.toml";
const WORKER_SOCKET_NAME: &str = "worker.sock";
const DAEMON_SOCKET_NAME: &str = "daemon.sock";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChronicleConfig {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub commits: CommitConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_inactivity_timeout_minutes")]
    pub inactivity_timeout_minutes: u32,
    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: u32,
    /// Refuse to start a session while another document is active.
    #[serde(default)]
    pub single_document: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl SessionConfig {
    pub fn inactivity_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.inactivity_timeout_minutes))
    }

    pub fn max_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.max_duration_minutes))
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_minutes: default_inactivity_timeout_minutes(),
            max_duration_minutes: default_max_duration_minutes(),
            single_document: false,
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Overrides `~/.chronicle/worker.sock`.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_reconnect_step_ms")]
    pub reconnect_step_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    /// Methods that are safe to retransmit after a reconnect.
    #[serde(default)]
    pub idempotent_methods: Vec<String>,
}

impl ChannelConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            request_timeout_ms: default_request_timeout_ms(),
            reconnect_step_ms: default_reconnect_step_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            idempotent_methods: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitConfig {
    #[serde(default = "default_commit_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Uncommitted annotations that trigger an `annotate` commit. 0 disables.
    #[serde(default = "default_annotation_commit_threshold")]
    pub annotation_commit_threshold: u32,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

impl CommitConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_commit_retry_delay_ms(),
            annotation_commit_threshold: default_annotation_commit_threshold(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_persistence_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_persistence_step_ms")]
    pub retry_step_ms: u64,
    #[serde(default = "default_persistence_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            write_attempts: default_persistence_attempts(),
            retry_step_ms: default_persistence_step_ms(),
            retry_max_ms: default_persistence_max_ms(),
        }
    }
}

fn default_inactivity_timeout_minutes() -> u32 {
    15
}

fn default_max_duration_minutes() -> u32 {
    120
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_reconnect_step_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_commit_retry_delay_ms() -> u64 {
    250
}

fn default_annotation_commit_threshold() -> u32 {
    5
}

fn default_author_name() -> String {
    "Chronicle".to_string()
}

fn default_author_email() -> String {
    "chronicle@localhost".to_string()
}

fn default_persistence_attempts() -> u32 {
    3
}

fn default_persistence_step_ms() -> u64 {
    50
}

fn default_persistence_max_ms() -> u64 {
    500
}

/// Returns `~/.chronicle`.
pub fn chronicle_home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CHRONICLE_DIR))
        .ok_or(ConfigError::HomeNotFound)
}

pub fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(CHRONICLE_DIR).join(CONFIG_FILE)
}

/// Loads the workspace config, returning defaults if the file doesn't exist.
pub fn load_config(workspace: &Path) -> Result<ChronicleConfig, ConfigError> {
    load_config_from(&config_path(workspace))
}

pub fn load_config_from(path: &Path) -> Result<ChronicleConfig, ConfigError> {
    if !path.exists() {
        return Ok(ChronicleConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<ChronicleConfig>(&content).map_err(|err| ConfigError::Malformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

/// Worker socket: env override, then config, then `~/.chronicle/worker.sock`.
pub fn worker_socket_path(config: &ChannelConfig) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(WORKER_SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    if let Some(path) = &config.socket_path {
        return Ok(path.clone());
    }
    Ok(chronicle_home()?.join(WORKER_SOCKET_NAME))
}

pub fn daemon_socket_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var(DAEMON_SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    Ok(chronicle_home()?.join(DAEMON_SOCKET_NAME))
}

pub fn debug_log_enabled() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}
