//! Commit policy: which lifecycle event produces which commit.
//!
//! | Event      | Title                  | Detail            | Files staged                          |
//! |------------|------------------------|-------------------|---------------------------------------|
//! | Init       | workspace name         |                   | `.gitignore`                          |
//! | SessionEnd | document title         | `{n}m`            | document, session metadata            |
//! | Processed  | document title         | processing style  | document, raw capture, metadata       |
//! | Annotate   | document title         | `+{delta}`        | document, session metadata            |
//! | Snapshot   | label / document title |                   | every modified file                   |
//!
//! Commits run one at a time on a single worker task. A failed commit is
//! retried once after a short delay, then reported as [`CommitOutcome::Failed`]
//! and logged; it never propagates as an error to the caller.

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CommitConfig;
use crate::document::{document_title, meta_path};
use crate::error::CommitError;
use crate::vcs::{CommitId, VcsGateway, GITIGNORE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitKind {
    Init,
    SessionEnd,
    Processed,
    Annotate,
    Snapshot,
}

impl CommitKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            CommitKind::Init => "init",
            CommitKind::SessionEnd => "session",
            CommitKind::Processed => "process",
            CommitKind::Annotate => "annotate",
            CommitKind::Snapshot => "snapshot",
        }
    }
}

impl fmt::Display for CommitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagePlan {
    /// Exactly these files; missing ones are skipped.
    Files(Vec<PathBuf>),
    AllModified,
}

/// One triggered commit. Built once, consumed once by the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    kind: CommitKind,
    document_id: Option<String>,
    title: String,
    detail: Option<String>,
    stage: StagePlan,
    message: String,
}

impl CommitEvent {
    fn new(
        kind: CommitKind,
        document_id: Option<String>,
        title: String,
        detail: Option<String>,
        stage: StagePlan,
    ) -> Self {
        let message = format_message(kind, &title, detail.as_deref());
        Self {
            kind,
            document_id,
            title,
            detail,
            stage,
            message,
        }
    }

    pub fn init(workspace: &Path) -> Self {
        let title = workspace
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "workspace".to_string());
        Self::new(
            CommitKind::Init,
            None,
            title,
            None,
            StagePlan::Files(vec![workspace.join(GITIGNORE)]),
        )
    }

    pub fn session_end(document: &Path, duration_minutes: u32) -> Self {
        Self::new(
            CommitKind::SessionEnd,
            Some(document.to_string_lossy().to_string()),
            document_title(document),
            Some(format!("{}m", duration_minutes)),
            StagePlan::Files(vec![document.to_path_buf(), meta_path(document)]),
        )
    }

    pub fn processed(document: &Path, style: &str, raw_capture: PathBuf) -> Self {
        Self::new(
            CommitKind::Processed,
            Some(document.to_string_lossy().to_string()),
            document_title(document),
            Some(style.to_string()),
            StagePlan::Files(vec![document.to_path_buf(), raw_capture, meta_path(document)]),
        )
    }

    pub fn annotate(document: &Path, delta: u32) -> Self {
        Self::new(
            CommitKind::Annotate,
            Some(document.to_string_lossy().to_string()),
            document_title(document),
            Some(format!("+{}", delta)),
            StagePlan::Files(vec![document.to_path_buf(), meta_path(document)]),
        )
    }

    /// Title is the label when given, else the current document's title.
    pub fn snapshot(document: Option<&Path>, label: Option<&str>) -> Self {
        let title = label
            .map(str::trim)
            .filter(|label| !label.is_empty())
            .map(str::to_string)
            .or_else(|| document.map(document_title))
            .unwrap_or_else(|| "manual snapshot".to_string());
        Self::new(
            CommitKind::Snapshot,
            document.map(|document| document.to_string_lossy().to_string()),
            title,
            None,
            StagePlan::AllModified,
        )
    }

    pub fn kind(&self) -> CommitKind {
        self.kind
    }

    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn stage(&self) -> &StagePlan {
        &self.stage
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

fn format_message(kind: CommitKind, title: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("{}: {} ({})", kind, title, detail),
        None => format!("{}: {}", kind, title),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommitOutcome {
    Committed { commit_id: CommitId },
    /// The staged tree matched HEAD.
    NoChanges,
    /// Failed after one retry. Already logged.
    Failed { error: String },
}

impl CommitOutcome {
    pub fn commit_id(&self) -> Option<&str> {
        match self {
            CommitOutcome::Committed { commit_id } => Some(commit_id),
            _ => None,
        }
    }
}

struct CommitJob {
    event: CommitEvent,
    reply: Option<oneshot::Sender<CommitOutcome>>,
}

/// Queue in front of the gateway. Cheap to share behind an `Arc`.
pub struct CommitPolicyEngine {
    sender: mpsc::UnboundedSender<CommitJob>,
    worker: JoinHandle<()>,
}

impl CommitPolicyEngine {
    /// Spawns the commit worker on the current tokio runtime.
    pub fn start(gateway: Arc<dyn VcsGateway>, config: &CommitConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_worker(gateway, config.retry_delay(), receiver));
        Self { sender, worker }
    }

    /// Queues the commit and waits for its outcome.
    pub async fn commit(&self, event: CommitEvent) -> CommitOutcome {
        let (reply, outcome) = oneshot::channel();
        let job = CommitJob {
            event,
            reply: Some(reply),
        };
        if self.sender.send(job).is_err() {
            return stopped();
        }
        outcome.await.unwrap_or_else(|_| stopped())
    }

    /// Queues the commit without waiting. The outcome is only logged.
    pub fn submit(&self, event: CommitEvent) {
        let message = event.message.clone();
        if self.sender.send(CommitJob { event, reply: None }).is_err() {
            warn!(message = %message, "Commit worker stopped; dropping commit");
        }
    }

    /// Creates the repository if needed and records the `init` commit.
    pub async fn init_workspace(&self, workspace: &Path) -> CommitOutcome {
        self.commit(CommitEvent::init(workspace)).await
    }
}

impl Drop for CommitPolicyEngine {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

fn stopped() -> CommitOutcome {
    CommitOutcome::Failed {
        error: CommitError::WorkerStopped.to_string(),
    }
}

async fn run_worker(
    gateway: Arc<dyn VcsGateway>,
    retry_delay: Duration,
    mut receiver: mpsc::UnboundedReceiver<CommitJob>,
) {
    while let Some(job) = receiver.recv().await {
        let outcome = run_job(&gateway, &job.event, retry_delay).await;
        if let Some(reply) = job.reply {
            let _ = reply.send(outcome);
        }
    }
    debug!("Commit worker exiting");
}

async fn run_job(
    gateway: &Arc<dyn VcsGateway>,
    event: &CommitEvent,
    retry_delay: Duration,
) -> CommitOutcome {
    let first = match execute(gateway, event).await {
        Ok(result) => return outcome_of(event, result),
        Err(err) => err,
    };
    warn!(
        message = %event.message,
        error = %first,
        retry_ms = retry_delay.as_millis() as u64,
        "Commit failed; retrying once"
    );
    tokio::time::sleep(retry_delay).await;

    match execute(gateway, event).await {
        Ok(result) => outcome_of(event, result),
        Err(err) => {
            warn!(message = %event.message, error = %err, "Commit failed; giving up");
            CommitOutcome::Failed {
                error: err.to_string(),
            }
        }
    }
}

fn outcome_of(event: &CommitEvent, result: Option<CommitId>) -> CommitOutcome {
    match result {
        Some(commit_id) => CommitOutcome::Committed { commit_id },
        None => {
            info!(message = %event.message, "No changes to commit");
            CommitOutcome::NoChanges
        }
    }
}

async fn execute(
    gateway: &Arc<dyn VcsGateway>,
    event: &CommitEvent,
) -> Result<Option<CommitId>, CommitError> {
    let gateway = Arc::clone(gateway);
    let event = event.clone();
    tokio::task::spawn_blocking(move || apply(gateway.as_ref(), &event))
        .await
        .map_err(|_| CommitError::WorkerStopped)?
}

fn apply(gateway: &dyn VcsGateway, event: &CommitEvent) -> Result<Option<CommitId>, CommitError> {
    if event.kind == CommitKind::Init {
        gateway.ensure_repository()?;
    }
    match &event.stage {
        StagePlan::Files(files) => gateway.commit_files(files, &event.message),
        StagePlan::AllModified => gateway.commit_all(&event.message),
    }
}
