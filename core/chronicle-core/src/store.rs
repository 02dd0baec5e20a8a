//! File-backed session persistence.
//!
//! Each document has a JSON sidecar at `<dir>/.meta/<stem>.json`:
//!
//! ```json
//! {
//!   "id": "standup-20260131120000",
//!   "version": 1,
//!   "file": { "name": "standup.md", "raw_path": null, "created_at": "...", "updated_at": "..." },
//!   "session": {
//!     "started_at": "...", "ended_at": null, "duration_minutes": 0,
//!     "annotation_count": 0, "last_annotation_at": null
//!   }
//! }
//! ```
//!
//! The session tracker is the only writer. A record with `ended_at == null`
//! is an unfinished session and is resumed on the next open.
//!
//! # Failure Handling
//!
//! - Missing file: no record
//! - Corrupt JSON: warning, treated as no record
//!
//! # Atomic Writes
//!
//! Uses temp file + rename so a crash mid-write never leaves half a record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::document::{default_raw_capture_path, file_stem, meta_path};
use crate::error::PersistenceError;
use crate::session::Session;

const META_VERSION: u32 = 1;

/// Durable view of one session, as written to the sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: u32,
    pub annotation_count: u32,
    pub last_annotation_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// `None` for sessions that never started.
    pub fn from_session(session: &Session) -> Option<Self> {
        Some(Self {
            started_at: session.started_at?,
            ended_at: session.ended_at,
            duration_minutes: session.duration_minutes,
            annotation_count: session.annotation_count,
            last_annotation_at: session.last_annotation_at,
        })
    }

    pub fn is_unfinished(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMeta {
    pub name: String,
    pub raw_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteMeta {
    pub id: String,
    pub version: u32,
    pub file: FileMeta,
    pub session: Option<SessionRecord>,
}

impl NoteMeta {
    pub fn new(document: &Path, now: DateTime<Utc>) -> Self {
        let name = document
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "untitled".to_string());
        Self {
            id: format!("{}-{}", file_stem(document), now.format("%Y%m%d%H%M%S")),
            version: META_VERSION,
            file: FileMeta {
                name,
                raw_path: None,
                created_at: now,
                updated_at: now,
            },
            session: None,
        }
    }
}

/// Durable mirror of session state, keyed by document path.
pub trait SessionStore: Send + Sync {
    fn load(&self, document: &Path) -> Result<Option<SessionRecord>, PersistenceError>;
    fn save(&self, document: &Path, record: &SessionRecord) -> Result<(), PersistenceError>;
}

/// Stores records in `.meta/` sidecars next to each document.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetaFileStore;

impl MetaFileStore {
    pub fn load_meta(&self, document: &Path) -> Result<Option<NoteMeta>, PersistenceError> {
        let path = meta_path(document);
        let content = match fs_err::read_to_string(&path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(PersistenceError::ReadFailed { path, source }),
        };

        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| PersistenceError::Malformed {
                path,
                details: err.to_string(),
            })
    }

    pub fn save_meta(&self, document: &Path, meta: &NoteMeta) -> Result<(), PersistenceError> {
        let path = meta_path(document);
        let content =
            serde_json::to_string_pretty(meta).map_err(|err| PersistenceError::Malformed {
                path: path.clone(),
                details: err.to_string(),
            })?;
        write_atomic(&path, content.as_bytes())?;
        debug!(document = %document.display(), meta = %path.display(), "Saved session metadata");
        Ok(())
    }

    /// Raw capture copy for a document: the recorded `raw_path`, else `.raw/<name>`.
    pub fn raw_capture_path(&self, document: &Path) -> PathBuf {
        let recorded = match self.load_meta(document) {
            Ok(meta) => meta.and_then(|meta| meta.file.raw_path),
            Err(err) => {
                warn!(error = %err, "Failed to read raw capture path; using default");
                None
            }
        };
        match recorded {
            Some(raw) => {
                let raw = PathBuf::from(raw);
                if raw.is_absolute() {
                    raw
                } else {
                    document.parent().unwrap_or(Path::new(".")).join(raw)
                }
            }
            None => default_raw_capture_path(document),
        }
    }
}

impl SessionStore for MetaFileStore {
    fn load(&self, document: &Path) -> Result<Option<SessionRecord>, PersistenceError> {
        match self.load_meta(document) {
            Ok(meta) => Ok(meta.and_then(|meta| meta.session)),
            Err(PersistenceError::Malformed { path, details }) => {
                warn!(
                    path = %path.display(),
                    details = %details,
                    "Corrupt session metadata; treating as no record"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    fn save(&self, document: &Path, record: &SessionRecord) -> Result<(), PersistenceError> {
        let now = Utc::now();
        let mut meta = match self.load_meta(document) {
            Ok(Some(meta)) => meta,
            Ok(None) | Err(PersistenceError::Malformed { .. }) => NoteMeta::new(document, now),
            Err(err) => return Err(err),
        };
        meta.session = Some(record.clone());
        meta.file.updated_at = now;
        self.save_meta(document, &meta)
    }
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), PersistenceError> {
    let write_failed = |source: std::io::Error| PersistenceError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().ok_or_else(|| {
        write_failed(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "metadata path has no parent directory",
        ))
    })?;
    fs_err::create_dir_all(parent).map_err(write_failed)?;

    let mut temp_file = NamedTempFile::new_in(parent).map_err(write_failed)?;
    temp_file.write_all(content).map_err(write_failed)?;
    temp_file.flush().map_err(write_failed)?;
    temp_file
        .persist(path)
        .map_err(|err| write_failed(err.error))?;
    Ok(())
}
