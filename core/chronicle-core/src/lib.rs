//! # chronicle-core
//!
//! Core library for Chronicle, a note workspace that tracks writing sessions,
//! hands notes to an AI worker for processing, and records history as git
//! commits.
//!
//! ## Design Principles
//!
//! - **One engine per workspace**: [`Chronicle`] owns the tracker, the worker
//!   channel and the commit queue for a single workspace directory.
//! - **In-memory state is authoritative**: session metadata on disk is a
//!   best-effort mirror. Write failures are retried and logged, never fatal.
//! - **Commits never block editing**: git runs on a serialized worker; failures
//!   come back as outcomes, not errors.
//! - **Injected time and transport**: [`clock::Clock`], [`channel::Connector`]
//!   and [`vcs::VcsGateway`] are seams so tests drive timeouts, the worker and
//!   git deterministically.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use chronicle_core::Chronicle;
//!
//! let engine = Chronicle::open_workspace("/Users/me/notes")?;
//! engine.init_workspace().await;
//! engine.spawn_channel_supervisor();
//! engine.spawn_timeout_checker();
//!
//! engine.open(Path::new("/Users/me/notes/standup.md"))?;
//! engine.record_edit(Path::new("/Users/me/notes/standup.md"))?;
//! ```

pub mod backoff;
pub mod channel;
pub mod clock;
pub mod commit;
pub mod config;
pub mod document;
pub mod engine;
pub mod error;
pub mod processing;
pub mod session;
pub mod store;
pub mod tracker;
pub mod vcs;

pub use channel::{ChannelTransport, Connector, DuplexConnector, InboundHandler, UnixConnector};
pub use clock::{Clock, ManualClock, SystemClock};
pub use commit::{CommitEvent, CommitKind, CommitOutcome, CommitPolicyEngine};
pub use config::{load_config, ChronicleConfig};
pub use engine::{Chronicle, SessionReport};
pub use error::{ChannelError, CommitError, CoreError, ProcessingError, Result};
pub use processing::{ProcessingCoordinator, ProcessingHandle, ProcessingStatus};
pub use session::{EndReason, Session, SessionInfo, SessionState};
pub use store::{MetaFileStore, SessionRecord, SessionStore};
pub use tracker::{EditOutcome, SessionTracker};
pub use vcs::{CommitId, GitGateway, VcsGateway};
