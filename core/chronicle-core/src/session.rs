//! Session state machine for a single document.
//!
//! ```text
//! Inactive --(first edit)--> Active --(inactivity | max duration | explicit end)--> Ended
//! ```
//!
//! Transitions are pure: every method takes `now` so the tracker decides
//! which clock to read. Once `Ended`, `ended_at` and `duration_minutes` are
//! frozen and further edits only count as annotations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::{elapsed, whole_minutes};
use crate::config::SessionConfig;
use crate::store::SessionRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Inactive,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Inactivity,
    MaxDuration,
    Explicit,
}

/// What an edit did to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditEffect {
    Started,
    Touched,
    Annotated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub document_id: String,
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub last_edit_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_minutes: u32,
    pub annotation_count: u32,
    pub last_annotation_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}

impl Session {
    pub fn inactive(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            state: SessionState::Inactive,
            started_at: None,
            last_edit_at: None,
            ended_at: None,
            duration_minutes: 0,
            annotation_count: 0,
            last_annotation_at: None,
            end_reason: None,
        }
    }

    pub fn started(document_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let mut session = Self::inactive(document_id);
        session.begin(now);
        session
    }

    /// Picks up an unfinished persisted session. The clock restarts from
    /// `now` for inactivity purposes; `started_at` is kept.
    pub fn resumed(document_id: impl Into<String>, record: &SessionRecord, now: DateTime<Utc>) -> Self {
        let mut session = Self::inactive(document_id);
        session.state = SessionState::Active;
        session.started_at = Some(record.started_at);
        session.last_edit_at = Some(now.max(record.started_at));
        session
    }

    fn begin(&mut self, now: DateTime<Utc>) {
        self.state = SessionState::Active;
        self.started_at = Some(now);
        self.last_edit_at = Some(now);
        self.ended_at = None;
        self.duration_minutes = 0;
        self.annotation_count = 0;
        self.last_annotation_at = None;
        self.end_reason = None;
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn has_ended(&self) -> bool {
        self.state == SessionState::Ended
    }

    pub fn record_edit(&mut self, now: DateTime<Utc>) -> EditEffect {
        match self.state {
            SessionState::Inactive => {
                self.begin(now);
                EditEffect::Started
            }
            SessionState::Active => {
                // Keep started_at <= last_edit_at under clock skew.
                let floor = self.started_at.unwrap_or(now);
                self.last_edit_at = Some(now.max(floor));
                EditEffect::Touched
            }
            SessionState::Ended => {
                self.annotation_count += 1;
                self.last_edit_at = Some(now);
                self.last_annotation_at = Some(now);
                EditEffect::Annotated
            }
        }
    }

    /// Which timeout, if any, has fired. Max duration is checked first.
    pub fn timeout_reason(&self, now: DateTime<Utc>, config: &SessionConfig) -> Option<EndReason> {
        if !self.is_active() {
            return None;
        }
        let started_at = self.started_at?;
        if elapsed(started_at, now) >= config.max_duration() {
            return Some(EndReason::MaxDuration);
        }
        let last_edit_at = self.last_edit_at.unwrap_or(started_at);
        if elapsed(last_edit_at, now) >= config.inactivity_timeout() {
            return Some(EndReason::Inactivity);
        }
        None
    }

    /// Ends an active session. Returns false when there was nothing to end.
    ///
    /// Duration depends on why the session ended: an inactivity end counts
    /// up to the last edit, a max-duration end is capped at the limit and
    /// an explicit end counts up to `now`.
    pub fn end(&mut self, now: DateTime<Utc>, reason: EndReason, config: &SessionConfig) -> bool {
        if !self.is_active() {
            return false;
        }
        let started_at = self.started_at.unwrap_or(now);
        let duration_minutes = match reason {
            EndReason::Inactivity => whole_minutes(started_at, self.last_edit_at.unwrap_or(started_at)),
            EndReason::MaxDuration => whole_minutes(started_at, now).min(config.max_duration_minutes),
            EndReason::Explicit => whole_minutes(started_at, now),
        };

        self.state = SessionState::Ended;
        self.ended_at = Some(now);
        self.duration_minutes = duration_minutes;
        self.end_reason = Some(reason);
        true
    }

    /// Whole minutes so far while active, the frozen duration once ended.
    pub fn live_duration_minutes(&self, now: DateTime<Utc>) -> u32 {
        match (self.state, self.started_at) {
            (SessionState::Active, Some(started_at)) => whole_minutes(started_at, now),
            (SessionState::Ended, _) => self.duration_minutes,
            _ => 0,
        }
    }

    pub fn info(&self, now: DateTime<Utc>) -> SessionInfo {
        SessionInfo {
            document_id: self.document_id.clone(),
            state: self.state,
            duration_minutes: self.live_duration_minutes(now),
            annotation_count: self.annotation_count,
            started_at: self.started_at,
            ended_at: self.ended_at,
            end_reason: self.end_reason,
        }
    }
}

/// Display snapshot of a session, with a live duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub document_id: String,
    pub state: SessionState,
    pub duration_minutes: u32,
    pub annotation_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
}
