//! Channel transport to the out-of-process worker.
//!
//! One bidirectional link carries three kinds of newline-delimited JSON frames
//! (see [`chronicle_protocol::channel`]): requests with correlation ids,
//! exactly one response per request, and unsolicited pushes.
//!
//! ## Ownership
//!
//! - The pending table maps correlation id to the waiter of one request. It is
//!   shared by senders and the single reader task of the current link.
//! - Push subscribers are plain unbounded queues keyed by event name. They
//!   belong to the transport, not to a link, so they survive reconnects.
//!
//! ## Link generations
//!
//! Every (re)connect bumps a generation number. Reader and writer tasks carry
//! the generation they were spawned for, so a late EOF from an old link can't
//! tear down its replacement.
//!
//! ## Failure rules
//!
//! - Connection loss: pending requests fail with `Disconnected` immediately,
//!   except idempotent ones with a live deadline, which wait for the next link.
//! - `reconnect()`: idempotent requests whose deadline hasn't passed are
//!   retransmitted with their original id; everything else fails.
//! - A request that outlives its timeout is removed and fails with `Timeout`.
//! - A frame longer than `MAX_REQUEST_BYTES` drops the link; the reader never
//!   buffers more than that.

use async_trait::async_trait;
use chronicle_protocol::channel::{
    decode_frame, encode_frame, ChannelMessage, ChannelRequest, ChannelResponse, PushMessage,
};
use chronicle_protocol::MAX_REQUEST_BYTES;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::backoff::Backoff;
use crate::config::ChannelConfig;
use crate::error::ChannelError;

// ═══════════════════════════════════════════════════════════════════════════════
// Seams
// ═══════════════════════════════════════════════════════════════════════════════

/// Both halves of one established link.
pub struct Connection {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> io::Result<Connection>;
}

/// Connects to the worker's Unix domain socket.
pub struct UnixConnector {
    path: PathBuf,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Connector for UnixConnector {
    async fn connect(&self) -> io::Result<Connection> {
        let stream = tokio::net::UnixStream::connect(&self.path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

/// In-process connector. Each `connect` creates a `tokio::io::duplex` pipe
/// and hands the peer half to the receiver returned by [`DuplexConnector::new`].
pub struct DuplexConnector {
    peers: mpsc::UnboundedSender<tokio::io::DuplexStream>,
    capacity: usize,
}

impl DuplexConnector {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<tokio::io::DuplexStream>) {
        let (peers, accepted) = mpsc::unbounded_channel();
        (Self { peers, capacity }, accepted)
    }
}

#[async_trait]
impl Connector for DuplexConnector {
    async fn connect(&self) -> io::Result<Connection> {
        let (ours, theirs) = tokio::io::duplex(self.capacity);
        self.peers.send(theirs).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "no peer is accepting")
        })?;
        let (reader, writer) = tokio::io::split(ours);
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }
}

/// Answers requests the worker sends to the application (e.g. `getCurrentFile`).
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle(&self, method: &str, params: Value) -> Result<Value, String>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Transport
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    /// Methods safe to retransmit after a reconnect.
    pub idempotent_methods: HashSet<String>,
}

impl TransportOptions {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            idempotent_methods: config.idempotent_methods.iter().cloned().collect(),
        }
    }
}

type Reply = Result<Value, ChannelError>;

struct PendingRequest {
    method: String,
    params: Value,
    issued_at: Instant,
    timeout_at: Instant,
    generation: u64,
    waiter: oneshot::Sender<Reply>,
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    options: TransportOptions,
    pending: Mutex<HashMap<String, PendingRequest>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Value>>>>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    connected: watch::Sender<bool>,
    inbound: RwLock<Option<Arc<dyn InboundHandler>>>,
    reconnecting: tokio::sync::Mutex<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Request/response plus push channel to the worker. Clones share one link.
#[derive(Clone)]
pub struct ChannelTransport {
    inner: Arc<Inner>,
}

impl ChannelTransport {
    pub fn new(connector: Arc<dyn Connector>, options: TransportOptions) -> Self {
        let (connected, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                connector,
                options,
                pending: Mutex::new(HashMap::new()),
                subscribers: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                generation: AtomicU64::new(0),
                connected,
                inbound: RwLock::new(None),
                reconnecting: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_inbound_handler(&self, handler: Arc<dyn InboundHandler>) {
        *self
            .inner
            .inbound
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handler);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// First connect. Same as [`reconnect`](Self::reconnect).
    pub async fn connect(&self) -> Result<(), ChannelError> {
        self.reconnect().await
    }

    /// Sends one request and waits for its response, at most `timeout`.
    pub async fn send_request(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, ChannelError> {
        let id = Ulid::new().to_string();
        let (waiter, reply) = oneshot::channel();

        let (generation, outbound) = {
            let link = lock(&self.inner.link);
            let link = link.as_ref().ok_or(ChannelError::Disconnected)?;
            (link.generation, link.outbound.clone())
        };
        let frame = request_frame(&id, method, &params)?;

        let issued_at = Instant::now();
        lock(&self.inner.pending).insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                params,
                issued_at,
                timeout_at: issued_at + timeout,
                generation,
                waiter,
            },
        );
        let _entry = PendingEntry {
            pending: &self.inner.pending,
            id: &id,
        };
        if outbound.send(frame).is_err() {
            return Err(ChannelError::Disconnected);
        }
        debug!(id = %id, method = %method, "Channel request sent");

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Disconnected),
            Err(_) => {
                warn!(id = %id, method = %method, timeout_ms = timeout.as_millis() as u64, "Channel request timed out");
                Err(ChannelError::Timeout(timeout))
            }
        }
    }

    /// Live stream of `event` payloads. Every push that arrives while the
    /// stream is alive is delivered, across reconnects.
    pub fn subscribe_push(&self, event: &str) -> BoxStream<'static, Value> {
        let (sender, receiver) = mpsc::unbounded_channel();
        lock(&self.inner.subscribers)
            .entry(event.to_string())
            .or_default()
            .push(sender);
        stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|value| (value, receiver))
        })
        .boxed()
    }

    /// Replaces the current link with a fresh one.
    pub async fn reconnect(&self) -> Result<(), ChannelError> {
        let _reconnecting = self.inner.reconnecting.lock().await;

        if let Some(old) = lock(&self.inner.link).take() {
            old.reader.abort();
            debug!(generation = old.generation, "Dropped previous worker link");
        }
        self.inner.connected.send_replace(false);
        self.inner.settle_pending_for_reconnect();

        let connection = self.inner.connector.connect().await.map_err(|err| {
            debug!(error = %err, "Worker connect failed");
            ChannelError::Disconnected
        })?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound, frames) = mpsc::unbounded_channel();
        let (start, started) = oneshot::channel();
        tokio::spawn(write_loop(
            Arc::clone(&self.inner),
            connection.writer,
            frames,
            generation,
        ));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self.inner),
            connection.reader,
            generation,
            started,
        ));

        *lock(&self.inner.link) = Some(Link {
            generation,
            outbound: outbound.clone(),
            reader,
        });
        self.inner.connected.send_replace(true);
        let _ = start.send(());

        let retransmitted = self.inner.retransmit(generation, &outbound);
        info!(generation, retransmitted, "Worker channel connected");
        Ok(())
    }

    /// Keeps the link up: reconnects with backoff whenever it drops.
    pub fn spawn_supervisor(&self, backoff: Backoff) -> JoinHandle<()> {
        let transport = self.clone();
        tokio::spawn(async move {
            let mut connected = transport.inner.connected.subscribe();
            let mut attempt: u32 = 0;
            loop {
                if *connected.borrow_and_update() {
                    attempt = 0;
                    if connected.changed().await.is_err() {
                        return;
                    }
                    continue;
                }
                match transport.reconnect().await {
                    Ok(()) => attempt = 0,
                    Err(_) => {
                        attempt = attempt.saturating_add(1);
                        let delay = backoff.delay(attempt);
                        if attempt == 1 || attempt % 10 == 0 {
                            warn!(attempt, backoff_ms = delay.as_millis() as u64, "Worker unreachable; retrying");
                        }
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        })
    }

    /// Closes the link and fails every pending request.
    pub fn shutdown(&self) {
        if let Some(link) = lock(&self.inner.link).take() {
            link.reader.abort();
        }
        self.inner.connected.send_replace(false);
        let drained: Vec<PendingRequest> =
            lock(&self.inner.pending).drain().map(|(_, pending)| pending).collect();
        for pending in drained {
            let _ = pending.waiter.send(Err(ChannelError::Disconnected));
        }
    }
}

/// Removes a request from the pending table when its caller returns or stops
/// waiting. A no-op once a response has already claimed it.
struct PendingEntry<'a> {
    pending: &'a Mutex<HashMap<String, PendingRequest>>,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.id);
    }
}

fn request_frame(id: &str, method: &str, params: &Value) -> Result<Vec<u8>, ChannelError> {
    encode_frame(&ChannelMessage::Request(ChannelRequest {
        id: id.to_string(),
        method: method.to_string(),
        params: params.clone(),
    }))
    .map_err(|err| ChannelError::Protocol(err.message))
}

impl Inner {
    fn is_idempotent(&self, method: &str) -> bool {
        self.options.idempotent_methods.contains(method)
    }

    /// Fails what can't survive a reconnect; keeps idempotent requests with a
    /// live deadline for retransmission.
    fn settle_pending_for_reconnect(&self) {
        let now = Instant::now();
        let settled: Vec<(String, PendingRequest, ChannelError)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| !(self.is_idempotent(&request.method) && request.timeout_at > now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .map(|(id, request)| {
                    let error = if request.timeout_at <= now {
                        ChannelError::Timeout(request.timeout_at - request.issued_at)
                    } else {
                        ChannelError::Disconnected
                    };
                    (id, request, error)
                })
                .collect()
        };
        for (id, request, error) in settled {
            debug!(id = %id, method = %request.method, error = %error, "Pending request failed by reconnect");
            let _ = request.waiter.send(Err(error));
        }
    }

    /// Resends requests carried over from an earlier link. Requests already
    /// issued on `generation` went out on this link and are left alone.
    fn retransmit(&self, generation: u64, outbound: &mpsc::UnboundedSender<Vec<u8>>) -> usize {
        let mut pending = lock(&self.pending);
        let mut count = 0;
        for (id, request) in pending.iter_mut() {
            if request.generation >= generation {
                continue;
            }
            let Ok(frame) = request_frame(id, &request.method, &request.params) else {
                continue;
            };
            if outbound.send(frame).is_ok() {
                request.generation = generation;
                count += 1;
            }
        }
        count
    }

    fn connection_lost(&self, generation: u64) {
        {
            let mut link = lock(&self.link);
            match link.as_ref() {
                Some(current) if current.generation == generation => {
                    *link = None;
                }
                _ => return,
            }
        }
        self.connected.send_replace(false);

        let now = Instant::now();
        let failed: Vec<(String, PendingRequest)> = {
            let mut pending = lock(&self.pending);
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, request)| request.generation == generation)
                .filter(|(_, request)| !(self.is_idempotent(&request.method) && request.timeout_at > now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|request| (id, request)))
                .collect()
        };
        warn!(generation, failed = failed.len(), "Worker channel disconnected");
        for (_, request) in failed {
            let _ = request.waiter.send(Err(ChannelError::Disconnected));
        }
    }

    fn send_frame(&self, frame: Vec<u8>) -> bool {
        match lock(&self.link).as_ref() {
            Some(link) => link.outbound.send(frame).is_ok(),
            None => false,
        }
    }

    fn dispatch(self: &Arc<Self>, line: &[u8]) {
        let message = match decode_frame(line) {
            Ok(message) => message,
            Err(err) => {
                warn!(code = %err.code, message = %err.message, "Dropping malformed worker frame");
                return;
            }
        };
        match message {
            ChannelMessage::Response(response) => self.resolve(response),
            ChannelMessage::Push(push) => self.publish(push),
            ChannelMessage::Request(request) => self.answer(request),
        }
    }

    fn resolve(&self, response: ChannelResponse) {
        let Some(request) = lock(&self.pending).remove(&response.id) else {
            debug!(id = %response.id, "Response for unknown request dropped");
            return;
        };
        let result = response.into_result().map_err(ChannelError::Remote);
        let _ = request.waiter.send(result);
    }

    fn publish(&self, push: PushMessage) {
        let mut subscribers = lock(&self.subscribers);
        let Some(queues) = subscribers.get_mut(&push.event) else {
            debug!(event = %push.event, "Push with no subscribers dropped");
            return;
        };
        queues.retain(|queue| queue.send(push.data.clone()).is_ok());
    }

    fn answer(self: &Arc<Self>, request: ChannelRequest) {
        let handler = self
            .inbound
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let response = match handler {
                Some(handler) => match handler.handle(&request.method, request.params).await {
                    Ok(result) => ChannelResponse::ok(&request.id, result),
                    Err(error) => ChannelResponse::error(&request.id, error),
                },
                None => ChannelResponse::error(
                    &request.id,
                    format!("Unknown method: {}", request.method),
                ),
            };
            match encode_frame(&ChannelMessage::Response(response)) {
                Ok(frame) => {
                    if !inner.send_frame(frame) {
                        debug!(id = %request.id, "Link gone before inbound response was sent");
                    }
                }
                Err(err) => warn!(id = %request.id, error = %err.message, "Failed to encode inbound response"),
            }
        });
    }
}

async fn read_loop(
    inner: Arc<Inner>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
    generation: u64,
    started: oneshot::Receiver<()>,
) {
    // Wait until the link is registered so an immediate EOF finds it.
    if started.await.is_err() {
        return;
    }
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_REQUEST_BYTES as u64 + 1)
            .read_until(b'\n', &mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) => {
                if line.len() > MAX_REQUEST_BYTES && line.last() != Some(&b'\n') {
                    warn!(generation, limit = MAX_REQUEST_BYTES, "Worker frame exceeded maximum size; dropping link");
                    break;
                }
                let frame = trim_frame(&line);
                if frame.is_empty() {
                    continue;
                }
                inner.dispatch(frame);
            }
            Err(err) => {
                warn!(error = %err, generation, "Worker channel read failed");
                break;
            }
        }
    }
    inner.connection_lost(generation);
}

fn trim_frame(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|byte| !byte.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|byte| !byte.is_ascii_whitespace())
        .map_or(start, |index| index + 1);
    &line[start..end]
}

async fn write_loop(
    inner: Arc<Inner>,
    mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    generation: u64,
) {
    while let Some(frame) = frames.recv().await {
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        if let Err(err) = written {
            warn!(error = %err, generation, "Worker channel write failed");
            inner.connection_lost(generation);
            return;
        }
    }
    let _ = writer.shutdown().await;
}


#[cfg(test)]
mod tests {
    use super::test_peer::{connected, Peer};
    use super::*;
    use serde_json::json;

    async fn wait_for_pending(transport: &ChannelTransport, count: usize) {
        while transport.pending_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_requests_are_correlated() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;

        let first = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("echo", json!({"n": 1}), Duration::from_secs(5)).await }
        });
        let second = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("echo", json!({"n": 2}), Duration::from_secs(5)).await }
        });

        let a = peer.next_request().await;
        let b = peer.next_request().await;
        peer.respond(&b.id, json!({"echo": b.params["n"]})).await;
        peer.respond(&a.id, json!({"echo": a.params["n"]})).await;

        assert_eq!(first.await.expect("join").expect("ok"), json!({"echo": 1}));
        assert_eq!(second.await.expect("join").expect("ok"), json!({"echo": 2}));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn remote_error_is_typed() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let call = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("triggerProcessing", json!({}), Duration::from_secs(5)).await }
        });
        let request = peer.next_request().await;
        peer.reject(&request.id, "busy").await;
        assert_eq!(
            call.await.expect("join"),
            Err(ChannelError::Remote("busy".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out_exactly() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let started = Instant::now();
        let call = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("slow", Value::Null, Duration::from_secs(5)).await }
        });
        let _request = peer.next_request().await;

        let result = call.await.expect("join");
        assert_eq!(result, Err(ChannelError::Timeout(Duration::from_secs(5))));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(5), "resolved early: {:?}", waited);
        assert!(waited < Duration::from_millis(5_010), "resolved late: {:?}", waited);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_fails_every_pending_request() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let calls: Vec<_> = (0..3)
            .map(|n| {
                let transport = transport.clone();
                tokio::spawn(async move {
                    transport
                        .send_request("work", json!({ "n": n }), Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        for _ in 0..3 {
            peer.next_request().await;
        }
        wait_for_pending(&transport, 3).await;

        drop(peer);
        for call in calls {
            assert_eq!(call.await.expect("join"), Err(ChannelError::Disconnected));
        }
        assert_eq!(transport.pending_count(), 0);
        assert!(!transport.is_connected());
        assert_eq!(
            transport
                .send_request("work", Value::Null, Duration::from_secs(1))
                .await,
            Err(ChannelError::Disconnected)
        );
    }

    #[tokio::test]
    async fn push_subscriptions_survive_reconnect() {
        let (transport, mut peer, mut accepted) = connected(TransportOptions::default()).await;
        let mut completions = transport.subscribe_push("ai:processing-complete");

        peer.push("ai:processing-error", json!({"path": "/w/a.md", "error": "x"}))
            .await;
        peer.push("ai:processing-complete", json!({"seq": 1})).await;
        assert_eq!(completions.next().await, Some(json!({"seq": 1})));

        drop(peer);
        while transport.is_connected() {
            tokio::task::yield_now().await;
        }
        transport.reconnect().await.expect("reconnect");
        let mut peer = Peer::accept(&mut accepted).await;
        peer.push("ai:processing-complete", json!({"seq": 2})).await;
        assert_eq!(completions.next().await, Some(json!({"seq": 2})));
    }

    #[tokio::test]
    async fn reconnect_retransmits_only_idempotent_requests() {
        let options = TransportOptions {
            idempotent_methods: ["getStatus".to_string()].into_iter().collect(),
        };
        let (transport, mut peer, mut accepted) = connected(options).await;

        let status = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("getStatus", Value::Null, Duration::from_secs(30)).await }
        });
        let trigger = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("triggerProcessing", Value::Null, Duration::from_secs(30)).await }
        });
        let first = peer.next_request().await;
        let second = peer.next_request().await;
        let status_id = if first.method == "getStatus" { first.id } else { second.id };
        wait_for_pending(&transport, 2).await;

        transport.reconnect().await.expect("reconnect");
        assert_eq!(trigger.await.expect("join"), Err(ChannelError::Disconnected));

        let mut peer = Peer::accept(&mut accepted).await;
        let retransmitted = peer.next_request().await;
        assert_eq!(retransmitted.id, status_id);
        assert_eq!(retransmitted.method, "getStatus");
        peer.respond(&retransmitted.id, json!("ready")).await;
        assert_eq!(status.await.expect("join"), Ok(json!("ready")));
    }

    #[tokio::test]
    async fn retransmit_skips_requests_sent_on_the_new_link() {
        let options = TransportOptions {
            idempotent_methods: ["getStatus".to_string()].into_iter().collect(),
        };
        let (transport, mut peer, _accepted) = connected(options).await;
        let call = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("triggerProcessing", Value::Null, Duration::from_secs(30)).await }
        });
        let request = peer.next_request().await;
        wait_for_pending(&transport, 1).await;

        let generation = transport.inner.generation.load(Ordering::SeqCst);
        let (outbound, mut frames) = mpsc::unbounded_channel();
        assert_eq!(transport.inner.retransmit(generation, &outbound), 0);
        assert!(frames.try_recv().is_err());

        peer.respond(&request.id, json!({"accepted": true})).await;
        assert_eq!(call.await.expect("join"), Ok(json!({"accepted": true})));
    }

    #[tokio::test]
    async fn oversized_frame_drops_the_link() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        let call = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("ping", Value::Null, Duration::from_secs(30)).await }
        });
        peer.next_request().await;

        let writer = tokio::spawn(async move {
            peer.send_raw(&vec![b'a'; MAX_REQUEST_BYTES + 16]).await;
            peer
        });
        assert_eq!(call.await.expect("join"), Err(ChannelError::Disconnected));
        assert!(!transport.is_connected());
        drop(writer.await.expect("writer"));
    }

    #[tokio::test]
    async fn abandoned_request_leaves_no_pending_entry() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        {
            let call = transport.send_request("slow", Value::Null, Duration::from_secs(30));
            tokio::pin!(call);
            tokio::select! {
                _ = &mut call => panic!("answered without a response"),
                _ = peer.next_request() => {}
            }
            assert_eq!(transport.pending_count(), 1);
        }
        assert_eq!(transport.pending_count(), 0);
    }

    struct FileHandler;

    #[async_trait]
    impl InboundHandler for FileHandler {
        async fn handle(&self, method: &str, _params: Value) -> Result<Value, String> {
            match method {
                "getCurrentFile" => Ok(json!({ "path": "/w/a.md" })),
                other => Err(format!("Unknown method: {}", other)),
            }
        }
    }

    #[tokio::test]
    async fn inbound_requests_are_answered() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;

        peer.send(ChannelMessage::Request(ChannelRequest {
            id: "w-1".to_string(),
            method: "getCurrentFile".to_string(),
            params: Value::Null,
        }))
        .await;
        match peer.next().await {
            ChannelMessage::Response(response) => {
                assert_eq!(response.id, "w-1");
                assert!(response.error.unwrap_or_default().contains("Unknown method"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        transport.set_inbound_handler(Arc::new(FileHandler));
        peer.send(ChannelMessage::Request(ChannelRequest {
            id: "w-2".to_string(),
            method: "getCurrentFile".to_string(),
            params: Value::Null,
        }))
        .await;
        match peer.next().await {
            ChannelMessage::Response(response) => {
                assert_eq!(response.id, "w-2");
                assert_eq!(response.result, Some(json!({ "path": "/w/a.md" })));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_frames_do_not_break_the_link() {
        let (transport, mut peer, _accepted) = connected(TransportOptions::default()).await;
        peer.send_raw(b"not json\n").await;
        let call = tokio::spawn({
            let transport = transport.clone();
            async move { transport.send_request("ping", Value::Null, Duration::from_secs(5)).await }
        });
        let request = peer.next_request().await;
        peer.respond(&request.id, json!("pong")).await;
        assert_eq!(call.await.expect("join"), Ok(json!("pong")));
    }

    #[tokio::test]
    async fn supervisor_reconnects_after_drop() {
        let (connector, mut accepted) = DuplexConnector::new(4096);
        let transport = ChannelTransport::new(Arc::new(connector), TransportOptions::default());
        let supervisor = transport.spawn_supervisor(Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
        ));

        let peer = Peer::accept(&mut accepted).await;
        drop(peer);
        let _second = Peer::accept(&mut accepted).await;
        while !transport.is_connected() {
            tokio::task::yield_now().await;
        }
        supervisor.abort();
    }
}
