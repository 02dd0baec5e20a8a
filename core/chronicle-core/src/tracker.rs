//! Session tracker: one session per open document.
//!
//! Every document gets its own slot with its own lock, so edits to one note
//! never wait on another. Edits and timeout checks read-then-write under the
//! same per-document lock.
//!
//! An edit announces itself (`edits_in_flight`) before it reads the clock.
//! The timeout checker leaves any document with an announced edit alone for
//! that tick, so an edit that raced the checker always keeps the session
//! active.
//!
//! The store is the durable mirror and is written at start, at each
//! annotation and at end. Writes happen after the slot lock is released, so
//! readers never wait on disk. Each transition takes a revision number and a
//! write is skipped once a newer revision has reached the store. Failed
//! writes are retried with backoff and then logged; the in-memory transition
//! stands either way.
//!
//! Every mutating call may block on disk and retry sleeps. Async callers run
//! them on `spawn_blocking`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::backoff::{retry_blocking, Backoff};
use crate::clock::Clock;
use crate::config::{PersistenceConfig, SessionConfig};
use crate::error::{CoreError, Result};
use crate::session::{EditEffect, EndReason, Session, SessionInfo, SessionState};
use crate::store::{SessionRecord, SessionStore};

/// Result of [`SessionTracker::record_edit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    /// The edit started the session.
    Started(Session),
    Active(Session),
    /// The session had ended; the edit was counted as an annotation.
    Annotation(Session),
    /// No session is tracked for the document. Not an error.
    Untracked,
}

impl EditOutcome {
    pub fn session(&self) -> Option<&Session> {
        match self {
            EditOutcome::Started(session)
            | EditOutcome::Active(session)
            | EditOutcome::Annotation(session) => Some(session),
            EditOutcome::Untracked => None,
        }
    }
}

struct DocumentSlot {
    session: Mutex<Session>,
    edits_in_flight: AtomicUsize,
    revision: AtomicU64,
    // Highest revision handed to the store.
    persisted: Mutex<u64>,
}

/// A record taken under the slot lock, written after it is released.
struct PendingWrite {
    document_id: String,
    revision: u64,
    record: SessionRecord,
}

impl DocumentSlot {
    fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            edits_in_flight: AtomicUsize::new(0),
            revision: AtomicU64::new(0),
            persisted: Mutex::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caller holds this slot's session lock.
    fn capture(&self, session: &Session) -> Option<PendingWrite> {
        let record = SessionRecord::from_session(session)?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        Some(PendingWrite {
            document_id: session.document_id.clone(),
            revision,
            record,
        })
    }
}

/// Decrements the in-flight counter when the edit finishes, even on early return.
struct EditGuard<'a>(&'a AtomicUsize);

impl<'a> EditGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for EditGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionTracker {
    config: SessionConfig,
    persistence: PersistenceConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SessionStore>,
    slots: RwLock<HashMap<String, Arc<DocumentSlot>>>,
    // Serializes session starts so the single-document check can't race.
    start_gate: Mutex<()>,
}

impl SessionTracker {
    pub fn new(
        config: SessionConfig,
        persistence: PersistenceConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            persistence,
            clock,
            store,
            slots: RwLock::new(HashMap::new()),
            start_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Starts a session for the document, or resumes the one already running.
    ///
    /// The store is only consulted for a document with no session in memory
    /// yet: an unfinished persisted session is resumed with its original
    /// `started_at`, an ended or missing record gives a fresh session. A
    /// session that ended in memory stays ended; reopening starts a new one.
    pub fn start_or_resume(&self, document_id: &str) -> Result<Session> {
        let _gate = self.enter_start_gate();
        self.ensure_no_other_active(document_id)?;

        let slot = self.slot_or_insert(document_id);
        let mut session = slot.lock();
        let now = self.clock.now();

        if session.is_active() {
            session.record_edit(now);
            debug!(document = %document_id, "Resumed in-memory session");
            return Ok(session.clone());
        }

        let fresh = match session.state {
            SessionState::Active | SessionState::Ended => {
                info!(document = %document_id, "Session started after previous one ended");
                Session::started(document_id, now)
            }
            SessionState::Inactive => match self.load_record(document_id) {
                Some(record) if record.is_unfinished() => {
                    info!(
                        document = %document_id,
                        started_at = %record.started_at,
                        "Resuming unfinished session"
                    );
                    Session::resumed(document_id, &record, now)
                }
                _ => {
                    info!(document = %document_id, "Session started");
                    Session::started(document_id, now)
                }
            },
        };
        *session = fresh;
        let write = slot.capture(&session);
        let started = session.clone();
        drop(session);
        self.persist(&slot, write);
        Ok(started)
    }

    /// Tracks a document without starting its session; the first edit starts it.
    pub fn track(&self, document_id: &str) -> Session {
        let slot = self.slot_or_insert(document_id);
        let session = slot.lock();
        debug!(document = %document_id, state = ?session.state, "Document tracked");
        session.clone()
    }

    pub fn record_edit(&self, document_id: &str) -> Result<EditOutcome> {
        let Some(slot) = self.slot(document_id) else {
            debug!(document = %document_id, "Edit for untracked document ignored");
            return Ok(EditOutcome::Untracked);
        };
        let _edit = EditGuard::enter(&slot.edits_in_flight);
        let now = self.clock.now();

        // Starting a session goes through the gate; touching one does not.
        let needs_gate =
            self.config.single_document && slot.lock().state == SessionState::Inactive;
        let _gate = if needs_gate {
            let gate = self.enter_start_gate();
            self.ensure_no_other_active(document_id)?;
            Some(gate)
        } else {
            None
        };

        let mut session = slot.lock();
        let (outcome, write) = match session.record_edit(now) {
            EditEffect::Started => {
                info!(document = %document_id, "Session started by first edit");
                (EditOutcome::Started(session.clone()), slot.capture(&session))
            }
            EditEffect::Touched => (EditOutcome::Active(session.clone()), None),
            EditEffect::Annotated => {
                debug!(
                    document = %document_id,
                    annotation_count = session.annotation_count,
                    "Annotation recorded"
                );
                (EditOutcome::Annotation(session.clone()), slot.capture(&session))
            }
        };
        drop(session);
        self.persist(&slot, write);
        Ok(outcome)
    }

    /// Ends every active session whose inactivity or max-duration limit has
    /// passed. Each session is returned exactly once, on the tick that ends it.
    pub fn check_timeouts(&self) -> Vec<Session> {
        let mut ended = Vec::new();
        for (document_id, slot) in self.all_slots() {
            let mut session = slot.lock();
            if slot.edits_in_flight.load(Ordering::SeqCst) > 0 {
                debug!(document = %document_id, "Edit in flight; skipping timeout check");
                continue;
            }
            let now = self.clock.now();
            let Some(reason) = session.timeout_reason(now, &self.config) else {
                continue;
            };
            if session.end(now, reason, &self.config) {
                info!(
                    document = %document_id,
                    reason = ?reason,
                    duration_minutes = session.duration_minutes,
                    "Session ended by timeout"
                );
                let write = slot.capture(&session);
                ended.push(session.clone());
                drop(session);
                self.persist(&slot, write);
            }
        }
        ended
    }

    /// Ends the document's session now. Ending an ended session returns it
    /// unchanged.
    pub fn end_now(&self, document_id: &str) -> Result<Session> {
        self.end_if_active(document_id).map(|(session, _)| session)
    }

    /// Like [`end_now`](Self::end_now), also reporting whether this call
    /// ended the session.
    pub fn end_if_active(&self, document_id: &str) -> Result<(Session, bool)> {
        let slot = self
            .slot(document_id)
            .ok_or_else(|| CoreError::NotTracked(document_id.to_string()))?;
        let mut session = slot.lock();
        let now = self.clock.now();
        let ended = session.end(now, EndReason::Explicit, &self.config);
        let write = if ended {
            info!(
                document = %document_id,
                duration_minutes = session.duration_minutes,
                "Session ended"
            );
            slot.capture(&session)
        } else {
            None
        };
        let result = session.clone();
        drop(session);
        self.persist(&slot, write);
        Ok((result, ended))
    }

    pub fn session(&self, document_id: &str) -> Option<Session> {
        self.slot(document_id).map(|slot| slot.lock().clone())
    }

    pub fn session_info(&self, document_id: &str) -> Option<SessionInfo> {
        let now = self.clock.now();
        self.slot(document_id).map(|slot| slot.lock().info(now))
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let now = self.clock.now();
        let mut infos: Vec<SessionInfo> = self
            .all_slots()
            .into_iter()
            .map(|(_, slot)| slot.lock().info(now))
            .collect();
        infos.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        infos
    }

    pub fn active_document(&self) -> Option<String> {
        self.all_slots()
            .into_iter()
            .find(|(_, slot)| slot.lock().is_active())
            .map(|(document_id, _)| document_id)
    }

    /// Drops in-memory state for a closed document.
    pub fn forget(&self, document_id: &str) -> Option<Session> {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(document_id);
        removed.map(|slot| slot.lock().clone())
    }

    fn slot(&self, document_id: &str) -> Option<Arc<DocumentSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(document_id)
            .cloned()
    }

    fn slot_or_insert(&self, document_id: &str) -> Arc<DocumentSlot> {
        if let Some(slot) = self.slot(document_id) {
            return slot;
        }
        let mut slots = self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            slots
                .entry(document_id.to_string())
                .or_insert_with(|| Arc::new(DocumentSlot::new(Session::inactive(document_id)))),
        )
    }

    fn all_slots(&self) -> Vec<(String, Arc<DocumentSlot>)> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(document_id, slot)| (document_id.clone(), Arc::clone(slot)))
            .collect()
    }

    fn enter_start_gate(&self) -> MutexGuard<'_, ()> {
        self.start_gate
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Caller must hold the start gate and must not hold any slot lock.
    fn ensure_no_other_active(&self, document_id: &str) -> Result<()> {
        if !self.config.single_document {
            return Ok(());
        }
        let active = self
            .all_slots()
            .into_iter()
            .find(|(other, slot)| other != document_id && slot.lock().is_active());
        match active {
            Some((active, _)) => Err(CoreError::AlreadyActiveElsewhere {
                document_id: document_id.to_string(),
                active,
            }),
            None => Ok(()),
        }
    }

    fn load_record(&self, document_id: &str) -> Option<SessionRecord> {
        match self.store.load(Path::new(document_id)) {
            Ok(record) => record,
            Err(err) => {
                warn!(document = %document_id, error = %err, "Failed to load session record");
                None
            }
        }
    }

    /// Writes a captured record unless a newer one already reached the store.
    /// Caller must not hold the slot's session lock.
    fn persist(&self, slot: &DocumentSlot, write: Option<PendingWrite>) {
        let Some(write) = write else {
            return;
        };
        let mut persisted = slot
            .persisted
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *persisted >= write.revision {
            debug!(revision = write.revision, "Newer session record already written");
            return;
        }
        *persisted = write.revision;

        let document = Path::new(&write.document_id);
        let result = retry_blocking(
            self.persistence.write_attempts,
            Backoff::for_persistence(&self.persistence),
            "session metadata write",
            || self.store.save(document, &write.record),
        );
        if let Err(err) = result {
            warn!(
                document = %write.document_id,
                error = %err,
                "Session metadata not persisted; keeping in-memory state"
            );
        }
    }
}
