//! The Chronicle engine: one workspace's tracker, worker channel, processing
//! coordinator and commit queue wired together.
//!
//! This is the surface the daemon (and any embedding editor) talks to. It
//! turns lifecycle events into side effects:
//!
//! - a session ending (explicit, on close, or by timeout) queues a `session` commit
//! - enough annotations on an ended session queue an `annotate` commit
//! - a successful processing run queues a `process` commit
//! - `snapshot` commits every modified file
//!
//! Commit failures never fail the caller; they come back as
//! [`CommitOutcome::Failed`] and are logged by the commit worker.
//!
//! Tracker transitions write session metadata and may sleep between write
//! retries, so the async surface runs them on the blocking pool.

use async_trait::async_trait;
use chronicle_protocol::channel::{
    CurrentFile, METHOD_GET_CURRENT_FILE, METHOD_GET_WORKSPACE_PATH,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::channel::{ChannelTransport, Connector, InboundHandler, TransportOptions, UnixConnector};
use crate::clock::{spawn_ticker, Clock, SystemClock};
use crate::commit::{CommitEvent, CommitOutcome, CommitPolicyEngine};
use crate::config::{load_config, worker_socket_path, ChronicleConfig};
use crate::document::relative_to;
use crate::error::{CoreError, Result};
use crate::processing::{ProcessingCoordinator, ProcessingHandle, ProcessingStatus};
use crate::session::{Session, SessionInfo};
use crate::store::{MetaFileStore, SessionStore};
use crate::tracker::{EditOutcome, SessionTracker};
use crate::vcs::{GitGateway, VcsGateway};

/// A session plus the commit its transition produced, if any.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: SessionInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotation_commit: Option<CommitOutcome>,
}

pub struct Chronicle {
    workspace: PathBuf,
    config: ChronicleConfig,
    clock: Arc<dyn Clock>,
    store: MetaFileStore,
    tracker: Arc<SessionTracker>,
    transport: ChannelTransport,
    processing: ProcessingCoordinator,
    commits: Arc<CommitPolicyEngine>,
    // Annotation count already covered by a commit, per ended document.
    committed_annotations: Mutex<HashMap<String, u32>>,
    current: RwLock<Option<String>>,
    // Supervisor and timeout checker; aborted on shutdown.
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Chronicle {
    /// Wires the engine from explicit parts. Must run inside a tokio runtime.
    pub fn new(
        workspace: impl Into<PathBuf>,
        config: ChronicleConfig,
        clock: Arc<dyn Clock>,
        connector: Arc<dyn Connector>,
        gateway: Arc<dyn VcsGateway>,
    ) -> Arc<Self> {
        let workspace = workspace.into();
        let store = MetaFileStore;
        let tracker = Arc::new(SessionTracker::new(
            config.session.clone(),
            config.persistence.clone(),
            Arc::clone(&clock),
            Arc::new(store) as Arc<dyn SessionStore>,
        ));
        let transport = ChannelTransport::new(connector, TransportOptions::from_config(&config.channel));
        let processing =
            ProcessingCoordinator::start(transport.clone(), config.channel.request_timeout());
        let commits = Arc::new(CommitPolicyEngine::start(gateway, &config.commits));

        let engine = Arc::new(Self {
            workspace,
            config,
            clock,
            store,
            tracker,
            transport,
            processing,
            commits,
            committed_annotations: Mutex::new(HashMap::new()),
            current: RwLock::new(None),
            background: Mutex::new(Vec::new()),
        });
        engine.transport.set_inbound_handler(Arc::new(WorkerRequests {
            engine: Arc::downgrade(&engine),
        }));
        engine
    }

    /// Production wiring: config from the workspace, system clock, the worker
    /// socket and a git repository in the workspace.
    pub fn open_workspace(workspace: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let workspace = workspace.into();
        let config = load_config(&workspace)?;
        let socket = worker_socket_path(&config.channel)?;
        info!(
            workspace = %workspace.display(),
            worker_socket = %socket.display(),
            "Opening workspace"
        );
        let gateway = Arc::new(GitGateway::new(&workspace, &config.commits));
        Ok(Self::new(
            workspace,
            config,
            Arc::new(SystemClock),
            Arc::new(UnixConnector::new(socket)),
            gateway,
        ))
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn config(&self) -> &ChronicleConfig {
        &self.config
    }

    pub fn transport(&self) -> &ChannelTransport {
        &self.transport
    }

    /// Creates the repository if needed and records the `init` commit.
    pub async fn init_workspace(&self) -> CommitOutcome {
        self.commits.init_workspace(&self.workspace).await
    }

    /// Keeps the worker link up until [`shutdown`](Self::shutdown).
    pub fn spawn_channel_supervisor(&self) {
        let supervisor = self
            .transport
            .spawn_supervisor(Backoff::for_reconnect(&self.config.channel));
        self.track_background(supervisor);
    }

    /// Runs [`check_timeouts`](Self::check_timeouts) on the configured interval.
    pub fn spawn_timeout_checker(self: &Arc<Self>) {
        let engine = Arc::downgrade(self);
        let checker = spawn_ticker(self.config.session.check_interval(), move || {
            let engine = Weak::clone(&engine);
            async move {
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if let Err(err) = engine.check_timeouts().await {
                    warn!(error = %err, "Timeout check failed");
                }
            }
        });
        self.track_background(checker);
    }

    fn track_background(&self, task: JoinHandle<()>) {
        self.background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
    }

    /// Opens a document and starts (or resumes) its session.
    pub async fn open(&self, document: &Path) -> Result<SessionInfo> {
        let document_id = document_id(document);
        let session = self
            .on_tracker({
                let document_id = document_id.clone();
                move |tracker| tracker.start_or_resume(&document_id)
            })
            .await?;
        self.make_current(document_id, &session);
        Ok(session.info(self.clock.now()))
    }

    /// Opens a document without starting its session; the first edit starts it.
    pub fn track(&self, document: &Path) -> SessionInfo {
        let document_id = document_id(document);
        let session = self.tracker.track(&document_id);
        self.make_current(document_id, &session);
        session.info(self.clock.now())
    }

    fn make_current(&self, document_id: String, session: &Session) {
        self.committed_annotations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(document_id.clone(), session.annotation_count);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(document_id);
    }

    /// Records an edit. Annotations past the threshold queue an `annotate` commit.
    pub async fn record_edit(&self, document: &Path) -> Result<EditOutcome> {
        let document_id = document_id(document);
        let outcome = self
            .on_tracker(move |tracker| tracker.record_edit(&document_id))
            .await?;
        if let EditOutcome::Annotation(session) = &outcome {
            let threshold = self.config.commits.annotation_commit_threshold;
            if threshold > 0 {
                if let Some(delta) = self.take_annotation_delta(session, threshold) {
                    self.commits.submit(CommitEvent::annotate(document, delta));
                }
            }
        }
        Ok(outcome)
    }

    /// Ends the session now. Only the call that actually ends it commits.
    pub async fn end_session(&self, document: &Path) -> Result<SessionReport> {
        let document_id = document_id(document);
        let (session, ended) = self
            .on_tracker(move |tracker| tracker.end_if_active(&document_id))
            .await?;

        let commit = if ended {
            Some(self.commit_session_end(document, &session).await)
        } else {
            None
        };
        Ok(SessionReport {
            session: session.info(self.clock.now()),
            commit,
            annotation_commit: None,
        })
    }

    /// Ends the session if needed, flushes pending annotations and forgets
    /// the document.
    pub async fn close(&self, document: &Path) -> Result<SessionReport> {
        let mut report = self.end_session(document).await?;
        let document_id = document_id(document);

        if let Some(session) = self.tracker.session(&document_id) {
            if let Some(delta) = self.take_annotation_delta(&session, 1) {
                report.annotation_commit = Some(
                    self.commits
                        .commit(CommitEvent::annotate(document, delta))
                        .await,
                );
            }
        }

        self.tracker.forget(&document_id);
        self.committed_annotations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&document_id);
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_deref() == Some(document_id.as_str()) {
            *current = None;
        }
        info!(document = %document_id, "Document closed");
        Ok(report)
    }

    /// Ends timed-out sessions and queues their commits.
    pub async fn check_timeouts(&self) -> Result<Vec<Session>> {
        let ended = self
            .on_tracker(|tracker| Ok(tracker.check_timeouts()))
            .await?;
        for session in &ended {
            self.committed_annotations
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(session.document_id.clone(), session.annotation_count);
            self.commits.submit(CommitEvent::session_end(
                Path::new(&session.document_id),
                session.duration_minutes,
            ));
        }
        Ok(ended)
    }

    /// Starts AI processing. On success a `process` commit is queued before
    /// the handle resolves, whether or not anyone awaits it.
    pub async fn trigger_processing(
        &self,
        document: &Path,
        style: &str,
    ) -> Result<ProcessingHandle> {
        let document_id = document_id(document);
        let inner = self.processing.trigger_processing(&document_id, style).await?;

        let (sender, receiver) = oneshot::channel();
        let commits = Arc::clone(&self.commits);
        let raw_capture = self.store.raw_capture_path(document);
        let document = document.to_path_buf();
        tokio::spawn(async move {
            let outcome = inner.wait().await;
            if let Ok(result) = &outcome {
                let commit = commits
                    .commit(CommitEvent::processed(&document, &result.style, raw_capture))
                    .await;
                debug!(document = %document.display(), commit = ?commit, "Processed result committed");
            }
            let _ = sender.send(outcome);
        });
        Ok(ProcessingHandle::new(document_id, receiver))
    }

    pub fn cancel_processing(&self, document: &Path) -> bool {
        self.processing.cancel(&document_id(document))
    }

    pub fn processing_in_flight(&self, document: &Path) -> bool {
        self.processing.in_flight(&document_id(document))
    }

    /// Returns the latest processing outcome once; later reads see `None`.
    pub fn take_processing_result(&self, document: &Path) -> Option<ProcessingStatus> {
        self.processing.take_result(&document_id(document))
    }

    /// Commits every modified file. Titled by `label`, else the current document.
    pub async fn snapshot(&self, label: Option<&str>) -> CommitOutcome {
        let current = self.current_document();
        self.commits
            .commit(CommitEvent::snapshot(current.as_deref().map(Path::new), label))
            .await
    }

    pub fn session_info(&self, document: &Path) -> Option<SessionInfo> {
        self.tracker.session_info(&document_id(document))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.tracker.sessions()
    }

    pub fn current_document(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// What the worker sees for `getCurrentFile`.
    pub fn current_file(&self) -> CurrentFile {
        let Some(document_id) = self.current_document() else {
            return CurrentFile::none();
        };
        let document = Path::new(&document_id);
        let content = match fs_err::read_to_string(document) {
            Ok(content) => Some(content),
            Err(err) => {
                warn!(document = %document_id, error = %err, "Failed to read current file");
                None
            }
        };
        let session = self
            .tracker
            .session_info(&document_id)
            .and_then(|info| serde_json::to_value(info).ok());
        CurrentFile {
            path: Some(document_id.clone()),
            relative_path: Some(relative_to(&self.workspace, document)),
            content,
            session,
            error: None,
        }
    }

    /// Stops background tasks and closes the worker link. Pending worker
    /// requests fail with `Disconnected`.
    pub fn shutdown(&self) {
        for task in self
            .background
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.transport.shutdown();
        info!(workspace = %self.workspace.display(), "Chronicle shut down");
    }

    async fn on_tracker<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&SessionTracker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tracker = Arc::clone(&self.tracker);
        match tokio::task::spawn_blocking(move || op(&tracker)).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(err) => Err(CoreError::TaskCancelled(err.to_string())),
        }
    }

    /// Annotations not yet committed, when at least `threshold`. Marks them
    /// committed.
    fn take_annotation_delta(&self, session: &Session, threshold: u32) -> Option<u32> {
        let mut committed = self
            .committed_annotations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let already = committed.entry(session.document_id.clone()).or_insert(0);
        let delta = session.annotation_count.saturating_sub(*already);
        if delta >= threshold && delta > 0 {
            *already = session.annotation_count;
            Some(delta)
        } else {
            None
        }
    }

    async fn commit_session_end(&self, document: &Path, session: &Session) -> CommitOutcome {
        self.committed_annotations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(session.document_id.clone(), session.annotation_count);
        self.commits
            .commit(CommitEvent::session_end(document, session.duration_minutes))
            .await
    }
}

impl Drop for Chronicle {
    fn drop(&mut self) {
        for task in self
            .background
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

fn document_id(document: &Path) -> String {
    document.to_string_lossy().to_string()
}

/// Answers the worker's requests about the editor state.
struct WorkerRequests {
    engine: Weak<Chronicle>,
}

#[async_trait]
impl InboundHandler for WorkerRequests {
    async fn handle(&self, method: &str, _params: Value) -> std::result::Result<Value, String> {
        let engine = self
            .engine
            .upgrade()
            .ok_or_else(|| "Chronicle is shutting down".to_string())?;
        match method {
            METHOD_GET_CURRENT_FILE => {
                serde_json::to_value(engine.current_file()).map_err(|err| err.to_string())
            }
            METHOD_GET_WORKSPACE_PATH => Ok(json!({
                "path": engine.workspace.to_string_lossy(),
            })),
            other => {
                warn!(method = %other, "Unknown worker request");
                Err(format!("Unknown method: {}", other))
            }
        }
    }
}
