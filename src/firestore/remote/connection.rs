use std::collections::{BTreeMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, PoisonError};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};

/// The two long-lived RPCs the client keeps open.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Listen,
    Write,
}

impl Display for StreamKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Listen => f.write_str("Listen"),
            StreamKind::Write => f.write_str("Write"),
        }
    }
}

/// Request metadata sent when a stream is opened.
pub type StreamHeaders = BTreeMap<String, String>;

/// Client end of an open bidirectional stream.
///
/// [`StreamHandle::close`] closes both directions: the backend sees the end
/// of its requests and pending reads on the client side return `None`.
#[derive(Debug, Clone)]
pub struct StreamHandle {
    outgoing: Sender<JsonValue>,
    incoming: Receiver<FirestoreResult<JsonValue>>,
}

impl StreamHandle {
    pub fn new(outgoing: Sender<JsonValue>, incoming: Receiver<FirestoreResult<JsonValue>>) -> Self {
        Self { outgoing, incoming }
    }

    pub async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outgoing
            .send(message)
            .await
            .map_err(|_| unavailable("Stream is closed"))
    }

    /// Queues `message` without waiting. Fails once the stream is closed or
    /// its outgoing buffer is full.
    pub fn try_send(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outgoing
            .try_send(message)
            .map_err(|err| unavailable(format!("Cannot send on stream: {err}")))
    }

    /// Next message from the backend. `None` once the stream ended cleanly.
    pub async fn next(&self) -> Option<FirestoreResult<JsonValue>> {
        self.incoming.recv().await.ok()
    }

    pub fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
    }
}

/// Opens streams to the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_stream(&self, kind: StreamKind, headers: StreamHeaders) -> FirestoreResult<StreamHandle>;
}

/// Server end of a stream opened on an [`InMemoryConnection`].
#[derive(Debug)]
pub struct AcceptedStream {
    pub kind: StreamKind,
    pub headers: StreamHeaders,
    requests: Receiver<JsonValue>,
    responses: Sender<FirestoreResult<JsonValue>>,
}

impl AcceptedStream {
    /// Next request sent by the client, or `None` once it closed the stream.
    pub async fn recv(&self) -> Option<JsonValue> {
        self.requests.recv().await.ok()
    }

    pub async fn send(&self, response: JsonValue) -> FirestoreResult<()> {
        self.responses
            .send(Ok(response))
            .await
            .map_err(|_| internal_error("Client dropped the stream"))
    }

    /// Ends the stream with `error`.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.responses.send(Err(error)).await;
        self.responses.close();
    }

    /// Ends the stream cleanly.
    pub fn close(&self) {
        self.responses.close();
    }

    pub fn is_closed_by_client(&self) -> bool {
        self.requests.is_closed() && self.requests.is_empty()
    }
}

/// Backend side of an [`InMemoryConnection`], used by tests to script
/// responses.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    accepted: Receiver<AcceptedStream>,
}

impl InMemoryBackend {
    /// Waits for the client to open its next stream.
    pub async fn accept(&self) -> Option<AcceptedStream> {
        self.accepted.recv().await.ok()
    }

    pub fn try_accept(&self) -> Option<AcceptedStream> {
        self.accepted.try_recv().ok()
    }
}

/// Loopback connection whose streams are served by an [`InMemoryBackend`].
#[derive(Debug)]
pub struct InMemoryConnection {
    accept_tx: Sender<AcceptedStream>,
    open_failures: Mutex<VecDeque<FirestoreError>>,
}

impl InMemoryConnection {
    pub fn pair() -> (Arc<Self>, InMemoryBackend) {
        let (accept_tx, accepted) = async_channel::unbounded();
        let connection = Arc::new(Self {
            accept_tx,
            open_failures: Mutex::new(VecDeque::new()),
        });
        (connection, InMemoryBackend { accepted })
    }

    /// Makes the next `open_stream` call fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        self.open_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_stream(&self, kind: StreamKind, headers: StreamHeaders) -> FirestoreResult<StreamHandle> {
        let failure = self
            .open_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        let (request_tx, request_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        self.accept_tx
            .send(AcceptedStream {
                kind,
                headers,
                requests: request_rx,
                responses: response_tx,
            })
            .await
            .map_err(|_| unavailable("In-memory backend is gone"))?;
        Ok(StreamHandle::new(request_tx, response_rx))
    }
}
