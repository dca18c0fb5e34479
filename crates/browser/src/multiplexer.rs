//! CDP message multiplexer - the core communication layer, transport-agnostic.
//!
//! Design decisions:
//! 1. One multiplexer per transport connection; requests and events share it.
//! 2. A dedicated writer task drains an outbound queue - callers never touch
//!    the transport directly, so a slow/blocked write never stalls a reader.
//! 3. Request/response matching is by id; events fan out to subscribers by
//!    method name, each subscriber getting its own bounded, drop-oldest feed.
//! 4. Fail fast - a dead transport resolves every pending request with a
//!    synthetic error and closes every subscriber feed rather than hanging.

use crate::codec::{CdpSessionId, Message, MessageKind, RequestId};
use crate::error::{MuxError, TransportError};
use crate::transport::{TransportReader, TransportWriter};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Capacity of each per-method event feed. A subscriber that falls this far
/// behind loses the oldest events rather than stalling the reader task.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A request queued for the writer task, still missing its id. The id is
/// assigned by the writer task itself right before the bytes leave the
/// transport (§4.D), not by whichever caller task happens to enqueue it -
/// otherwise two concurrent callers could reserve ids out of the order they
/// actually get written in. `id_tx` lets a caller that gives up on the
/// response (e.g. `send_with_timeout`) learn the id it was assigned so it
/// can clean up the pending entry.
struct QueuedRequest {
    method: String,
    params: Option<Value>,
    session_id: Option<CdpSessionId>,
    response_tx: oneshot::Sender<Message>,
    id_tx: oneshot::Sender<RequestId>,
}

pub struct Multiplexer<W> {
    next_id: Arc<AtomicI64>,
    pending: Arc<DashMap<RequestId, oneshot::Sender<Message>>>,
    subscribers: Arc<DashMap<String, broadcast::Sender<Message>>>,
    outbound: mpsc::UnboundedSender<QueuedRequest>,
    writer: Arc<W>,
}

/// A subscription to one CDP event method. Wraps a `broadcast::Receiver` so
/// callers see a plain `Option<Message>` instead of tokio's lag bookkeeping.
pub struct EventStream {
    method: String,
    receiver: broadcast::Receiver<Message>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        method = %self.method,
                        skipped,
                        "event subscriber lagged, dropped oldest events"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl<W> Multiplexer<W>
where
    W: TransportWriter + Send + Sync + 'static,
{
    /// Spawn the writer and reader tasks and return a handle shared by
    /// every caller that wants to send requests or subscribe to events.
    pub fn spawn<R>(mut reader: R, writer: W) -> Arc<Self>
    where
        R: TransportReader + Send + 'static,
    {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<QueuedRequest>();

        let mux = Arc::new(Self {
            next_id: Arc::new(AtomicI64::new(1)),
            pending: Arc::new(DashMap::new()),
            subscribers: Arc::new(DashMap::new()),
            outbound: outbound_tx,
            writer: Arc::new(writer),
        });

        let writer_handle = mux.writer.clone();
        let writer_pending = mux.pending.clone();
        let writer_next_id = mux.next_id.clone();
        tokio::spawn(async move {
            while let Some(queued) = outbound_rx.recv().await {
                // Assign the id and register the waiter here, in the writer
                // task, before anything is written - this is the only place
                // that dequeues, so the id order always matches wire order
                // (§5 O1), which a caller-assigned id racing against the
                // enqueue cannot guarantee.
                let id = writer_next_id.fetch_add(1, Ordering::SeqCst);
                writer_pending.insert(id, queued.response_tx);
                let _ = queued.id_tx.send(id);

                let message = Message::request(id, queued.method, queued.params, queued.session_id);
                let bytes = match serde_json::to_vec(&message) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        complete(&writer_pending, Message::synthetic_error(id, err.to_string()));
                        continue;
                    }
                };
                if let Err(err) = writer_handle.write_message(bytes).await {
                    tracing::warn!(error = %err, "cdp write failed");
                    complete(&writer_pending, Message::synthetic_error(id, err.to_string()));
                }
            }
        });

        let reader_pending = mux.pending.clone();
        let reader_subscribers = mux.subscribers.clone();
        tokio::spawn(async move {
            loop {
                match reader.read_message().await {
                    Ok(bytes) => match serde_json::from_slice::<Message>(&bytes) {
                        Ok(message) => dispatch(&reader_pending, &reader_subscribers, message),
                        Err(err) => tracing::warn!(error = %err, "cdp message did not parse"),
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "cdp transport closed, failing pending requests");
                        fail_all_pending(&reader_pending, &err);
                        reader_subscribers.clear();
                        return;
                    }
                }
            }
        });

        mux
    }

    /// Enqueue a request, without waiting for the response. The id isn't
    /// assigned yet - that happens in the writer task just before the bytes
    /// leave the transport (§4.D) - so this only hands back the response
    /// receiver plus a side channel the caller can use to learn its id
    /// later (needed to clean up the pending entry on timeout).
    fn enqueue(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
    ) -> Result<(oneshot::Receiver<RequestId>, oneshot::Receiver<Message>), MuxError> {
        let method = method.into();
        if method.is_empty() {
            return Err(MuxError::EmptyMethod);
        }

        let (response_tx, response_rx) = oneshot::channel();
        let (id_tx, id_rx) = oneshot::channel();
        let queued = QueuedRequest {
            method,
            params,
            session_id,
            response_tx,
            id_tx,
        };
        if self.outbound.send(queued).is_err() {
            return Err(MuxError::Transport(TransportError::Closed));
        }

        Ok((id_rx, response_rx))
    }

    /// Streaming send: enqueue the request and return a handle the caller
    /// awaits (or selects on) at its own pace.
    pub fn send(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
    ) -> Result<oneshot::Receiver<Message>, MuxError> {
        self.enqueue(method, params, session_id).map(|(_, rx)| rx)
    }

    /// Send a request and wait indefinitely for its matching response.
    pub async fn send_and_wait(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
    ) -> Result<Value, MuxError> {
        let (_, rx) = self.enqueue(method, params, session_id)?;
        let response = rx.await.map_err(|_| MuxError::Cancelled)?;
        into_result(response)
    }

    /// Like `send_and_wait`, but bounds how long to wait for the response.
    /// The pending entry is removed on timeout (once the writer task has
    /// told us what id it assigned) so a late response is dropped rather
    /// than delivered to a caller that has already moved on.
    pub async fn send_with_timeout(
        &self,
        method: impl Into<String>,
        params: Option<Value>,
        session_id: Option<CdpSessionId>,
        timeout: Duration,
    ) -> Result<Value, MuxError> {
        let (mut id_rx, rx) = self.enqueue(method, params, session_id)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => into_result(response),
            Ok(Err(_)) => Err(MuxError::Cancelled),
            Err(_) => {
                if let Ok(id) = id_rx.try_recv() {
                    self.pending.remove(&id);
                }
                Err(MuxError::Timeout)
            }
        }
    }

    /// Subscribe to one CDP event method. Multiple independent subscribers
    /// to the same method each get their own feed off a shared broadcast.
    pub fn subscribe(&self, method: impl Into<String>) -> EventStream {
        let method = method.into();
        let sender = self
            .subscribers
            .entry(method.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone();
        EventStream {
            method,
            receiver: sender.subscribe(),
        }
    }

    /// Ask the transport to close. Does not wait for in-flight requests.
    pub async fn close(&self) {
        if let Err(err) = self.writer.close().await {
            tracing::warn!(error = %err, "error closing transport");
        }
    }
}

fn complete(pending: &DashMap<RequestId, oneshot::Sender<Message>>, message: Message) {
    if let Some(id) = message.id {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(message);
        }
    }
}

fn dispatch(
    pending: &DashMap<RequestId, oneshot::Sender<Message>>,
    subscribers: &DashMap<String, broadcast::Sender<Message>>,
    message: Message,
) {
    match message.kind() {
        MessageKind::Response => {
            if let Some(id) = message.id {
                if let Some((_, tx)) = pending.remove(&id) {
                    let _ = tx.send(message);
                } else {
                    tracing::warn!(id, "cdp response for unknown request id");
                }
            }
        }
        MessageKind::Event => {
            if let Some(method) = message.method.clone() {
                if let Some(sender) = subscribers.get(&method) {
                    let _ = sender.send(message);
                }
            }
        }
        MessageKind::Request => {
            tracing::warn!("cdp reader received a request-shaped message, ignoring");
        }
    }
}

fn fail_all_pending(pending: &DashMap<RequestId, oneshot::Sender<Message>>, err: &TransportError) {
    let ids: Vec<RequestId> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Message::synthetic_error(id, err.to_string()));
        }
    }
}

fn into_result(message: Message) -> Result<Value, MuxError> {
    if let Some(error) = message.error {
        return Err(MuxError::Protocol {
            code: error.code,
            message: error.message,
        });
    }
    Ok(message.result.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    struct MockWriter {
        sent: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl TransportWriter for MockWriter {
        async fn write_message(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
            self.sent.send(bytes).map_err(|_| TransportError::Closed)
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    struct MockReader {
        incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    }

    #[async_trait]
    impl TransportReader for MockReader {
        async fn read_message(&mut self) -> Result<Vec<u8>, TransportError> {
            self.incoming.recv().await.ok_or(TransportError::Closed)
        }
    }

    fn harness() -> (
        MockReader,
        MockWriter,
        mpsc::UnboundedSender<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        (
            MockReader { incoming: incoming_rx },
            MockWriter { sent: outgoing_tx },
            incoming_tx,
            outgoing_rx,
        )
    }

    #[tokio::test]
    async fn request_receives_matching_response() {
        let (reader, writer, incoming_tx, mut outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);

        let send_mux = mux.clone();
        let send_task = tokio::spawn(async move { send_mux.send_and_wait("Target.getTargets", None, None).await });

        let sent_bytes = outgoing_rx.recv().await.unwrap();
        let sent: Message = serde_json::from_slice(&sent_bytes).unwrap();
        assert_eq!(sent.method.as_deref(), Some("Target.getTargets"));

        let response = Message {
            id: sent.id,
            result: Some(json!({"targetInfos": []})),
            ..Default::default()
        };
        incoming_tx.send(serde_json::to_vec(&response).unwrap()).unwrap();

        let result = send_task.await.unwrap().unwrap();
        assert_eq!(result, json!({"targetInfos": []}));
    }

    #[tokio::test]
    async fn protocol_error_surfaces_as_mux_error() {
        let (reader, writer, incoming_tx, mut outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);

        let send_mux = mux.clone();
        let send_task = tokio::spawn(async move { send_mux.send_and_wait("Page.navigate", None, None).await });

        let sent_bytes = outgoing_rx.recv().await.unwrap();
        let sent: Message = serde_json::from_slice(&sent_bytes).unwrap();

        let response = Message {
            id: sent.id,
            error: Some(crate::codec::ErrorObject {
                code: -32601,
                message: "method not found".to_string(),
                data: None,
            }),
            ..Default::default()
        };
        incoming_tx.send(serde_json::to_vec(&response).unwrap()).unwrap();

        let err = send_task.await.unwrap().unwrap_err();
        match err {
            MuxError::Protocol { code, message } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn events_fan_out_to_independent_subscribers() {
        let (reader, writer, incoming_tx, _outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);

        let mut first = mux.subscribe("Page.loadEventFired");
        let mut second = mux.subscribe("Page.loadEventFired");

        let event = Message {
            method: Some("Page.loadEventFired".to_string()),
            params: Some(json!({"timestamp": 1.0})),
            ..Default::default()
        };
        incoming_tx.send(serde_json::to_vec(&event).unwrap()).unwrap();

        let a = first.recv().await.unwrap();
        let b = second.recv().await.unwrap();
        assert_eq!(a.method.as_deref(), Some("Page.loadEventFired"));
        assert_eq!(b.method.as_deref(), Some("Page.loadEventFired"));
    }

    #[tokio::test]
    async fn transport_closure_fails_pending_requests() {
        let (reader, writer, incoming_tx, mut outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);

        let send_mux = mux.clone();
        let send_task = tokio::spawn(async move { send_mux.send_and_wait("Browser.getVersion", None, None).await });

        // wait until the request has actually been written (and thus is
        // guaranteed to already be in `pending`) before tearing down.
        let _ = outgoing_rx.recv().await.unwrap();
        drop(incoming_tx); // reader's `read_message` now returns `Closed`

        let err = send_task.await.unwrap().unwrap_err();
        assert!(matches!(err, MuxError::Protocol { code: 0, .. }));
    }

    #[tokio::test]
    async fn concurrent_sends_get_unique_monotonic_ids() {
        let (reader, writer, incoming_tx, mut outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);

        let mut tasks = Vec::new();
        for _ in 0..64 {
            let mux = mux.clone();
            tasks.push(tokio::spawn(async move { mux.send_and_wait("Target.getTargets", None, None).await }));
        }

        let mut ids = Vec::new();
        for _ in 0..64 {
            let bytes = outgoing_rx.recv().await.unwrap();
            let sent: Message = serde_json::from_slice(&bytes).unwrap();
            let id = sent.id.unwrap();
            ids.push(id);
            let response = Message {
                id: Some(id),
                result: Some(json!(null)),
                ..Default::default()
            };
            incoming_tx.send(serde_json::to_vec(&response).unwrap()).unwrap();
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // `ids` was built in the order bytes actually left the writer
        // (outgoing_rx receive order), not just some arbitrary order - so
        // asserting strict monotonicity here also pins down wire order,
        // not merely uniqueness.
        assert_eq!(ids.len(), 64);
        assert!(
            ids.windows(2).all(|pair| pair[1] == pair[0] + 1),
            "ids must leave the writer in strictly increasing order: {ids:?}"
        );
    }

    #[tokio::test]
    async fn empty_method_is_rejected_before_touching_the_transport() {
        let (reader, writer, _incoming_tx, _outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);
        let err = mux.send_and_wait("", None, None).await.unwrap_err();
        assert!(matches!(err, MuxError::EmptyMethod));
    }

    #[tokio::test]
    async fn send_with_timeout_drops_the_pending_entry() {
        let (reader, writer, _incoming_tx, mut outgoing_rx) = harness();
        let mux = Multiplexer::spawn(reader, writer);

        let err = mux
            .send_with_timeout("Target.getTargets", None, None, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxError::Timeout));
        assert_eq!(mux.pending.len(), 0);

        let _ = outgoing_rx.recv().await.unwrap();
    }
}
