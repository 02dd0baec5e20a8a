//! Processing coordinator: one AI processing request per document.
//!
//! The worker acknowledges `triggerProcessing` right away and reports the
//! outcome later as an `ai:processing-complete` or `ai:processing-error`
//! push keyed by document path. The coordinator owns the path-to-waiter
//! table that joins the two.
//!
//! - A document has at most one waiter. A second trigger fails fast.
//! - A failed or abandoned acknowledgement removes the waiter it inserted,
//!   and only that one.
//! - Cancelling only clears local state. A late push finds no waiter and is
//!   dropped, like any other unmatched push.

use chronicle_protocol::channel::{
    parse_processing_complete, parse_processing_error, ProcessingResult, TriggerProcessingParams,
    EVENT_PROCESSING_COMPLETE, EVENT_PROCESSING_ERROR, METHOD_TRIGGER_PROCESSING,
};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::ChannelTransport;
use crate::error::{ChannelError, ProcessingError};

pub type Outcome = Result<ProcessingResult, ProcessingError>;

/// Awaitable result of one processing request. Dropping it abandons the
/// wait; the document stays in flight until the worker answers or
/// [`ProcessingCoordinator::cancel`] is called.
#[derive(Debug)]
pub struct ProcessingHandle {
    document_id: String,
    receiver: oneshot::Receiver<Outcome>,
}

impl ProcessingHandle {
    pub(crate) fn new(document_id: String, receiver: oneshot::Receiver<Outcome>) -> Self {
        Self {
            document_id,
            receiver,
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub async fn wait(self) -> Outcome {
        self.receiver
            .await
            .unwrap_or(Err(ProcessingError::Cancelled))
    }
}

/// Latest outcome per document, kept for polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessingStatus {
    Completed { result: ProcessingResult },
    Failed { error: String },
}

struct Waiter {
    ticket: u64,
    sender: oneshot::Sender<Outcome>,
}

#[derive(Default)]
struct CoordinatorState {
    in_flight: HashMap<String, Waiter>,
    results: HashMap<String, ProcessingStatus>,
}

enum Push {
    Complete(Value),
    Error(Value),
}

pub struct ProcessingCoordinator {
    transport: ChannelTransport,
    ack_timeout: Duration,
    state: Arc<Mutex<CoordinatorState>>,
    next_ticket: AtomicU64,
    dispatcher: JoinHandle<()>,
}

fn lock(state: &Mutex<CoordinatorState>) -> MutexGuard<'_, CoordinatorState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ProcessingCoordinator {
    /// Subscribes to both processing pushes and starts dispatching them.
    pub fn start(transport: ChannelTransport, ack_timeout: Duration) -> Self {
        let state = Arc::new(Mutex::new(CoordinatorState::default()));
        let completions = transport
            .subscribe_push(EVENT_PROCESSING_COMPLETE)
            .map(Push::Complete);
        let failures = transport
            .subscribe_push(EVENT_PROCESSING_ERROR)
            .map(Push::Error);
        let mut pushes = stream::select(completions, failures);

        let dispatch_state = Arc::clone(&state);
        let dispatcher = tokio::spawn(async move {
            while let Some(push) = pushes.next().await {
                match push {
                    Push::Complete(data) => on_complete(&dispatch_state, data),
                    Push::Error(data) => on_error(&dispatch_state, data),
                }
            }
        });

        Self {
            transport,
            ack_timeout,
            state,
            next_ticket: AtomicU64::new(1),
            dispatcher,
        }
    }

    /// Asks the worker to process the document and returns once it has
    /// acknowledged the request.
    pub async fn trigger_processing(
        &self,
        document_id: &str,
        style: &str,
    ) -> Result<ProcessingHandle, ProcessingError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if state.in_flight.contains_key(document_id) {
                return Err(ProcessingError::AlreadyProcessing {
                    document_id: document_id.to_string(),
                });
            }
            state
                .in_flight
                .insert(document_id.to_string(), Waiter { ticket, sender });
        }

        let mut pending_ack = PendingAck {
            state: &self.state,
            document_id,
            ticket,
            acknowledged: false,
        };

        let params = serde_json::to_value(TriggerProcessingParams {
            path: document_id.to_string(),
            style: style.to_string(),
        })
        .map_err(|err| ProcessingError::Channel(ChannelError::Protocol(err.to_string())));
        let acknowledged = match params {
            Ok(params) => {
                self.transport
                    .send_request(METHOD_TRIGGER_PROCESSING, params, self.ack_timeout)
                    .await
                    .map_err(ProcessingError::from)
            }
            Err(err) => Err(err),
        };

        if let Err(err) = acknowledged {
            warn!(document = %document_id, error = %err, "Processing request not acknowledged");
            return Err(err);
        }
        pending_ack.acknowledged = true;

        info!(document = %document_id, style = %style, "Processing requested");
        Ok(ProcessingHandle::new(document_id.to_string(), receiver))
    }

    /// Forgets the in-flight request. Returns false if there was none.
    pub fn cancel(&self, document_id: &str) -> bool {
        let removed = lock(&self.state).in_flight.remove(document_id).is_some();
        if removed {
            info!(document = %document_id, "Processing cancelled");
        }
        removed
    }

    pub fn in_flight(&self, document_id: &str) -> bool {
        lock(&self.state).in_flight.contains_key(document_id)
    }

    pub fn last_result(&self, document_id: &str) -> Option<ProcessingStatus> {
        lock(&self.state).results.get(document_id).cloned()
    }

    /// Returns and clears the latest outcome.
    pub fn take_result(&self, document_id: &str) -> Option<ProcessingStatus> {
        lock(&self.state).results.remove(document_id)
    }
}

/// Removes this trigger's waiter unless the worker acknowledged it. Runs on
/// a failed acknowledgement and when the caller stops waiting for one.
struct PendingAck<'a> {
    state: &'a Mutex<CoordinatorState>,
    document_id: &'a str,
    ticket: u64,
    acknowledged: bool,
}

impl Drop for PendingAck<'_> {
    fn drop(&mut self) {
        if self.acknowledged {
            return;
        }
        let mut state = lock(self.state);
        if state
            .in_flight
            .get(self.document_id)
            .is_some_and(|waiter| waiter.ticket == self.ticket)
        {
            state.in_flight.remove(self.document_id);
            debug!(document = %self.document_id, ticket = self.ticket, "Unacknowledged processing request cleared");
        }
    }
}

impl Drop for ProcessingCoordinator {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn on_complete(state: &Mutex<CoordinatorState>, data: Value) {
    let payload = match parse_processing_complete(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Dropping malformed processing-complete push");
            return;
        }
    };
    let mut state = lock(state);
    let Some(waiter) = state.in_flight.remove(&payload.path) else {
        debug!(document = %payload.path, "Unmatched processing-complete push dropped");
        return;
    };
    info!(
        document = %payload.path,
        style = %payload.result.style,
        output_tokens = payload.result.tokens.output_tokens,
        "Processing complete"
    );
    state.results.insert(
        payload.path.clone(),
        ProcessingStatus::Completed {
            result: payload.result.clone(),
        },
    );
    let _ = waiter.sender.send(Ok(payload.result));
}

fn on_error(state: &Mutex<CoordinatorState>, data: Value) {
    let payload = match parse_processing_error(data) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Dropping malformed processing-error push");
            return;
        }
    };
    let mut state = lock(state);
    let Some(waiter) = state.in_flight.remove(&payload.path) else {
        debug!(document = %payload.path, "Unmatched processing-error push dropped");
        return;
    };
    warn!(document = %payload.path, error = %payload.error, "Processing failed");
    state.results.insert(
        payload.path.clone(),
        ProcessingStatus::Failed {
            error: payload.error.clone(),
        },
    );
    let _ = waiter.sender.send(Err(ProcessingError::Worker {
        message: payload.error,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::test_peer::{connected, Peer};
    use crate::channel::TransportOptions;
    use serde_json::json;

    const ACK_TIMEOUT: Duration = Duration::from_secs(5);

    fn complete(path: &str) -> Value {
        json!({
            "path": path,
            "result": {
                "summary": "Tight summary",
                "style": "brief",
                "tokens": { "input_tokens": 200, "output_tokens": 40 }
            }
        })
    }

    async fn acknowledged(
        coordinator: &ProcessingCoordinator,
        peer: &mut Peer,
        path: &str,
    ) -> ProcessingHandle {
        let (handle, request) = tokio::join!(coordinator.trigger_processing(path, "brief"), async {
            let request = peer.next_request().await;
            peer.respond(&request.id, json!({ "accepted": true })).await;
            request
        });
        assert_eq!(request.method, METHOD_TRIGGER_PROCESSING);
        assert_eq!(request.params["path"], path);
        handle.expect("acknowledged")
    }

    #[tokio::test]
    async fn completion_push_resolves_handle() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        let handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
        assert!(coordinator.in_flight("/w/a.md"));

        peer.push(EVENT_PROCESSING_COMPLETE, complete("/w/a.md")).await;
        let result = handle.wait().await.expect("result");
        assert_eq!(result.summary, "Tight summary");
        assert_eq!(result.tokens.input_tokens, 200);
        assert!(!coordinator.in_flight("/w/a.md"));
        assert!(matches!(
            coordinator.take_result("/w/a.md"),
            Some(ProcessingStatus::Completed { .. })
        ));
        assert_eq!(coordinator.last_result("/w/a.md"), None);
    }

    #[tokio::test]
    async fn second_trigger_is_rejected_while_in_flight() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        let _handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
        let err = coordinator
            .trigger_processing("/w/a.md", "brief")
            .await
            .expect_err("already processing");
        assert!(matches!(err, ProcessingError::AlreadyProcessing { .. }));
        assert_eq!(err.category(), "already_processing");
    }

    #[tokio::test]
    async fn rejected_ack_clears_in_flight() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        let (result, _) = tokio::join!(coordinator.trigger_processing("/w/a.md", "brief"), async {
            let request = peer.next_request().await;
            peer.reject(&request.id, "worker busy").await;
        });
        assert_eq!(
            result.expect_err("rejected"),
            ProcessingError::Channel(ChannelError::Remote("worker busy".to_string()))
        );
        assert!(!coordinator.in_flight("/w/a.md"));

        let _handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
    }

    #[tokio::test]
    async fn error_push_resolves_with_worker_error() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        let handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
        peer.push(
            EVENT_PROCESSING_ERROR,
            json!({ "path": "/w/a.md", "error": "model unavailable" }),
        )
        .await;
        assert_eq!(
            handle.wait().await,
            Err(ProcessingError::Worker {
                message: "model unavailable".to_string()
            })
        );
        assert_eq!(
            coordinator.last_result("/w/a.md"),
            Some(ProcessingStatus::Failed {
                error: "model unavailable".to_string()
            })
        );
    }

    #[tokio::test]
    async fn unmatched_push_is_dropped() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        let handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
        peer.push(EVENT_PROCESSING_COMPLETE, complete("/w/other.md")).await;
        peer.push(EVENT_PROCESSING_COMPLETE, json!({ "garbage": true })).await;
        peer.push(EVENT_PROCESSING_COMPLETE, complete("/w/a.md")).await;

        assert!(handle.wait().await.is_ok());
        assert_eq!(coordinator.last_result("/w/other.md"), None);
    }

    #[tokio::test]
    async fn cancel_drops_late_push() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        let handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
        assert!(coordinator.cancel("/w/a.md"));
        assert!(!coordinator.cancel("/w/a.md"));
        assert_eq!(handle.wait().await, Err(ProcessingError::Cancelled));

        peer.push(EVENT_PROCESSING_COMPLETE, complete("/w/a.md")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(coordinator.last_result("/w/a.md"), None);
        assert!(!coordinator.in_flight("/w/a.md"));
    }

    #[tokio::test]
    async fn abandoned_trigger_does_not_block_the_next_one() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);

        {
            let trigger = coordinator.trigger_processing("/w/a.md", "brief");
            tokio::pin!(trigger);
            tokio::select! {
                _ = &mut trigger => panic!("acknowledged without a response"),
                request = peer.next_request() => {
                    assert_eq!(request.params["path"], "/w/a.md");
                }
            }
            assert!(coordinator.in_flight("/w/a.md"));
        }
        assert!(!coordinator.in_flight("/w/a.md"));

        let _handle = acknowledged(&coordinator, &mut peer, "/w/a.md").await;
        assert!(coordinator.in_flight("/w/a.md"));
    }

    #[tokio::test]
    async fn trigger_without_link_fails_disconnected() {
        let (connector, _accepted) = crate::channel::DuplexConnector::new(1024);
        let transport = ChannelTransport::new(Arc::new(connector), TransportOptions::default());
        let coordinator = ProcessingCoordinator::start(transport, ACK_TIMEOUT);
        let err = coordinator
            .trigger_processing("/w/a.md", "brief")
            .await
            .expect_err("no link");
        assert_eq!(err, ProcessingError::Channel(ChannelError::Disconnected));
        assert!(!coordinator.in_flight("/w/a.md"));
    }
}
