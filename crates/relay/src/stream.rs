// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The stream multiplexer: per-stream sender/receiver lifecycles,
//! backpressure driven by outbound buffer occupancy, and pre-registration
//! buffering with bounded queues and an expiry timer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::StreamChunk;
use crate::error::RpcError;

/// A chunk delivered to a receiving consumer: either a data payload or one
/// of the two terminators.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Data(Value),
    End,
    Error(String),
}

/// Anything that can carry stream chunk frames and report its own outbound
/// buffer occupancy for backpressure. Implemented on the client/peer side
/// (`crate::peer::TransportStreamAdapter`, wrapping a `DuplexTransport`);
/// the relay's own connection loop forwards frames verbatim and never
/// implements this trait.
pub trait StreamTransport: Send + Sync + 'static {
    fn send_chunk(&self, chunk: StreamChunk);
    fn buffered_amount(&self) -> usize;
}

/// Tunables for the multiplexer, mirroring [`crate::config::RelayConfig`].
#[derive(Debug, Clone, Copy)]
pub struct StreamConfig {
    pub max_buffered_amount: usize,
    pub backpressure_delay: Duration,
    pub pending_cap: usize,
    pub pending_expiry: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_buffered_amount: 1_048_576,
            backpressure_delay: Duration::from_millis(10),
            pending_cap: 100,
            pending_expiry: Duration::from_secs(10),
        }
    }
}

/// A registered sink awaiting delivery of chunks for one stream.
struct ReceivingSlot {
    tx: mpsc::UnboundedSender<StreamItem>,
}

/// Chunks that arrived before a local consumer registered for this stream.
struct PendingBuffer {
    chunks: VecDeque<Value>,
    terminal: Option<StreamItem>,
    first_seen: Instant,
}

impl PendingBuffer {
    fn new() -> Self {
        Self { chunks: VecDeque::new(), terminal: None, first_seen: Instant::now() }
    }
}

/// Handle returned to a consumer of `receive_stream`.
pub struct StreamConsumer {
    rx: mpsc::UnboundedReceiver<StreamItem>,
    registry: Arc<StreamRegistry>,
    stream_id: String,
    done: bool,
}

impl StreamConsumer {
    /// Await the next chunk. Returns `None` once `End`/`Error` has been
    /// delivered and consumed, or the consumer has cancelled.
    pub async fn recv(&mut self) -> Option<StreamItem> {
        if self.done {
            return None;
        }
        let item = self.rx.recv().await;
        if matches!(item, Some(StreamItem::End) | Some(StreamItem::Error(_)) | None) {
            self.done = true;
        }
        item
    }

    /// Cancel consumption: deregisters the sink and closes it.
    pub async fn cancel(mut self) {
        self.done = true;
        self.registry.close_receiving(&self.stream_id).await;
    }
}

/// Active-send bookkeeping: lets an external caller abort a send in
/// progress.
pub struct StreamSender {
    pub stream_id: String,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<Result<(), RpcError>>,
}

impl StreamSender {
    /// Abort the send: the sender task emits `StreamError` and stops.
    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Wait for the send to finish naturally, be aborted, or fail.
    pub async fn join(self) -> Result<(), RpcError> {
        match self.join.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::StreamAborted),
        }
    }
}

/// Owns the pending-stream buffers, the receiving-stream table, and the
/// active-send cancellation handles for one connection/peer.
pub struct StreamRegistry {
    cfg: StreamConfig,
    receiving: Mutex<HashMap<String, ReceivingSlot>>,
    pending: Mutex<HashMap<String, PendingBuffer>>,
    active_send: Mutex<HashMap<String, CancellationToken>>,
    sweep_cancel: CancellationToken,
}

impl StreamRegistry {
    pub fn new(cfg: StreamConfig) -> Arc<Self> {
        let registry = Arc::new(Self {
            cfg,
            receiving: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            active_send: Mutex::new(HashMap::new()),
            sweep_cancel: CancellationToken::new(),
        });
        registry.clone().spawn_sweeper();
        registry
    }

    fn spawn_sweeper(self: Arc<Self>) {
        let cancel = self.sweep_cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => self.sweep_expired_pending(),
                }
            }
        });
    }

    fn sweep_expired_pending(&self) {
        let expiry = self.cfg.pending_expiry;
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|_, buf| buf.first_seen.elapsed() < expiry);
        let dropped = before - pending.len();
        if dropped > 0 {
            tracing::warn!(dropped, "dropped expired pending-stream buffers");
        }
    }

    /// Sender side: mint (or reuse) a stream ID, spawn the send loop, and
    /// return a handle that can abort it.
    pub fn send_stream<S>(
        self: &Arc<Self>,
        transport: Arc<dyn StreamTransport>,
        mut items: S,
        stream_id: Option<String>,
    ) -> StreamSender
    where
        S: Stream<Item = Result<Value, String>> + Send + Unpin + 'static,
    {
        let stream_id = stream_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let cancel = CancellationToken::new();
        self.active_send.lock().insert(stream_id.clone(), cancel.clone());

        let cfg = self.cfg;
        let registry = Arc::clone(self);
        let sid = stream_id.clone();
        let task_cancel = cancel.clone();

        let join = tokio::spawn(async move {
            let result = run_send_loop(&*transport, &mut items, &sid, cfg, &task_cancel).await;
            registry.active_send.lock().remove(&sid);
            result
        });

        StreamSender { stream_id, cancel, join }
    }

    /// Abort an active send by stream ID (sender-side cancel path
    /// independent of holding the [`StreamSender`] handle).
    pub fn abort(&self, stream_id: &str) {
        if let Some(cancel) = self.active_send.lock().get(stream_id) {
            cancel.cancel();
        }
    }

    /// Receiver side: register a consumer for `stream_id`, draining any
    /// pending buffer first.
    pub async fn receive_stream(self: &Arc<Self>, stream_id: String) -> StreamConsumer {
        let (tx, rx) = mpsc::unbounded_channel();

        let pending = self.pending.lock().remove(&stream_id);
        let mut register_live = true;

        if let Some(buf) = pending {
            for chunk in buf.chunks {
                let _ = tx.send(StreamItem::Data(chunk));
            }
            if let Some(terminal) = buf.terminal {
                let _ = tx.send(terminal);
                register_live = false;
            }
        }

        if register_live {
            self.receiving.lock().insert(stream_id.clone(), ReceivingSlot { tx });
        }

        StreamConsumer { rx, registry: Arc::clone(self), stream_id, done: false }
    }

    /// Consumer-initiated cancel: deregister and drop the sink.
    pub async fn close_receiving(&self, stream_id: &str) {
        self.receiving.lock().remove(stream_id);
    }

    /// Called by the peer's inbound loop for every incoming [`StreamChunk`].
    pub async fn dispatch_chunk(&self, chunk: StreamChunk) {
        let stream_id = chunk.stream_id().to_owned();

        let delivered = {
            let receiving = self.receiving.lock();
            if let Some(slot) = receiving.get(&stream_id) {
                let item = match &chunk {
                    StreamChunk::StreamData { payload, .. } => StreamItem::Data(payload.clone()),
                    StreamChunk::StreamEnd { .. } => StreamItem::End,
                    StreamChunk::StreamError { error, .. } => StreamItem::Error(error.clone()),
                };
                let _ = slot.tx.send(item);
                true
            } else {
                false
            }
        };

        if delivered {
            if matches!(chunk, StreamChunk::StreamEnd { .. } | StreamChunk::StreamError { .. }) {
                self.receiving.lock().remove(&stream_id);
            }
            return;
        }

        self.buffer_pending(stream_id, chunk);
    }

    fn buffer_pending(&self, stream_id: String, chunk: StreamChunk) {
        let cap = self.cfg.pending_cap;
        let mut pending = self.pending.lock();
        let buf = pending.entry(stream_id.clone()).or_insert_with(PendingBuffer::new);

        match chunk {
            StreamChunk::StreamData { payload, .. } => {
                if buf.chunks.len() >= cap {
                    buf.chunks.pop_front();
                }
                buf.chunks.push_back(payload);
            }
            StreamChunk::StreamEnd { .. } => buf.terminal = Some(StreamItem::End),
            StreamChunk::StreamError { error, .. } => buf.terminal = Some(StreamItem::Error(error)),
        }
    }

    /// Connection teardown: abort every active send and error every
    /// registered receiving sink.
    pub async fn teardown(&self) {
        for (_, cancel) in self.active_send.lock().drain() {
            cancel.cancel();
        }
        for (_, slot) in self.receiving.lock().drain() {
            let _ = slot.tx.send(StreamItem::Error("connection closed".to_owned()));
        }
    }
}

impl Drop for StreamRegistry {
    fn drop(&mut self) {
        self.sweep_cancel.cancel();
    }
}

async fn run_send_loop<S>(
    transport: &dyn StreamTransport,
    items: &mut S,
    stream_id: &str,
    cfg: StreamConfig,
    cancel: &CancellationToken,
) -> Result<(), RpcError>
where
    S: Stream<Item = Result<Value, String>> + Unpin,
{
    loop {
        if cancel.is_cancelled() {
            transport.send_chunk(StreamChunk::StreamError {
                stream_id: stream_id.to_owned(),
                error: "Stream aborted".to_owned(),
            });
            return Err(RpcError::StreamAborted);
        }

        if wait_for_buffer(transport, cfg, cancel).await.is_err() {
            transport.send_chunk(StreamChunk::StreamError {
                stream_id: stream_id.to_owned(),
                error: "Stream aborted during backpressure wait".to_owned(),
            });
            return Err(RpcError::StreamAbortedDuringBackpressure);
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                transport.send_chunk(StreamChunk::StreamError {
                    stream_id: stream_id.to_owned(),
                    error: "Stream aborted".to_owned(),
                });
                return Err(RpcError::StreamAborted);
            }
            next = items.next() => {
                match next {
                    Some(Ok(payload)) => {
                        transport.send_chunk(StreamChunk::StreamData {
                            stream_id: stream_id.to_owned(),
                            payload,
                        });
                    }
                    Some(Err(message)) => {
                        transport.send_chunk(StreamChunk::StreamError {
                            stream_id: stream_id.to_owned(),
                            error: message.clone(),
                        });
                        return Err(RpcError::InvalidMessageFormat(message));
                    }
                    None => {
                        transport.send_chunk(StreamChunk::StreamEnd { stream_id: stream_id.to_owned() });
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn wait_for_buffer(
    transport: &dyn StreamTransport,
    cfg: StreamConfig,
    cancel: &CancellationToken,
) -> Result<(), ()> {
    while transport.buffered_amount() > cfg.max_buffered_amount {
        tokio::select! {
            _ = cancel.cancelled() => return Err(()),
            _ = tokio::time::sleep(cfg.backpressure_delay) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use serde_json::json;

    struct FakeTransport {
        sent: Mutex<Vec<StreamChunk>>,
        buffered: AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), buffered: AtomicUsize::new(0) })
        }
    }

    impl StreamTransport for FakeTransport {
        fn send_chunk(&self, chunk: StreamChunk) {
            self.sent.lock().push(chunk);
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn send_stream_emits_data_then_end_in_order() {
        let registry = StreamRegistry::new(StreamConfig::default());
        let transport = FakeTransport::new();
        let items = futures_util::stream::iter(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]);

        let sender = registry.send_stream(transport.clone(), items, None);
        sender.join().await.unwrap();

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 4);
        for (i, chunk) in sent.iter().take(3).enumerate() {
            match chunk {
                StreamChunk::StreamData { payload, .. } => assert_eq!(*payload, json!(i + 1)),
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert!(matches!(sent[3], StreamChunk::StreamEnd { .. }));
    }

    #[tokio::test]
    async fn receive_stream_drains_pending_buffer_in_order() {
        let registry = StreamRegistry::new(StreamConfig::default());
        registry
            .dispatch_chunk(StreamChunk::StreamData { stream_id: "s1".into(), payload: json!(1) })
            .await;
        registry
            .dispatch_chunk(StreamChunk::StreamData { stream_id: "s1".into(), payload: json!(2) })
            .await;
        registry.dispatch_chunk(StreamChunk::StreamEnd { stream_id: "s1".into() }).await;

        let mut consumer = registry.receive_stream("s1".to_owned()).await;
        assert!(matches!(consumer.recv().await, Some(StreamItem::Data(v)) if v == json!(1)));
        assert!(matches!(consumer.recv().await, Some(StreamItem::Data(v)) if v == json!(2)));
        assert!(matches!(consumer.recv().await, Some(StreamItem::End)));
        assert!(consumer.recv().await.is_none());
    }

    #[tokio::test]
    async fn live_delivery_after_registration() {
        let registry = StreamRegistry::new(StreamConfig::default());
        let mut consumer = registry.receive_stream("s2".to_owned()).await;

        registry
            .dispatch_chunk(StreamChunk::StreamData { stream_id: "s2".into(), payload: json!("a") })
            .await;
        registry.dispatch_chunk(StreamChunk::StreamEnd { stream_id: "s2".into() }).await;

        assert!(matches!(consumer.recv().await, Some(StreamItem::Data(v)) if v == json!("a")));
        assert!(matches!(consumer.recv().await, Some(StreamItem::End)));
    }

    #[tokio::test]
    async fn pending_buffer_caps_at_100_dropping_oldest() {
        let registry = StreamRegistry::new(StreamConfig::default());
        for i in 0..150 {
            registry
                .dispatch_chunk(StreamChunk::StreamData {
                    stream_id: "s3".into(),
                    payload: json!(i),
                })
                .await;
        }
        let mut consumer = registry.receive_stream("s3".to_owned()).await;
        // Oldest 50 were dropped; first delivered chunk should be 50.
        assert!(matches!(consumer.recv().await, Some(StreamItem::Data(v)) if v == json!(50)));
    }

    #[tokio::test]
    async fn abort_marks_stream_error_and_stops() {
        let registry = StreamRegistry::new(StreamConfig::default());
        let transport = FakeTransport::new();
        let (tx, rx) = mpsc::unbounded_channel::<Result<Value, String>>();
        let items = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);

        let sender = registry.send_stream(transport.clone(), items, Some("s4".to_owned()));
        sender.abort();
        // No item is ever sent on `tx`; the loop observes cancellation on its
        // next poll and exits with StreamAborted.
        let result = sender.join().await;
        assert_eq!(result, Err(RpcError::StreamAborted));
        drop(tx);

        let sent = transport.sent.lock();
        assert!(matches!(sent.last(), Some(StreamChunk::StreamError { .. })));
    }

    #[tokio::test]
    async fn teardown_errors_registered_receivers_and_cancels_senders() {
        let registry = StreamRegistry::new(StreamConfig::default());
        let mut consumer = registry.receive_stream("s5".to_owned()).await;

        let transport = FakeTransport::new();
        let (_tx, rx) = mpsc::unbounded_channel::<Result<Value, String>>();
        let items = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        let sender = registry.send_stream(transport, items, Some("s6".to_owned()));

        registry.teardown().await;

        assert!(matches!(consumer.recv().await, Some(StreamItem::Error(_))));
        let _ = sender.join().await;
    }

    proptest::proptest! {
        /// Whatever sequence of data chunks arrives before registration, the
        /// pending buffer always delivers the most recent `min(n, cap)` of
        /// them in FIFO order once a consumer registers.
        #[test]
        fn pending_buffer_is_fifo_and_capped(values in proptest::collection::vec(0i64..10_000, 0..250)) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            runtime.block_on(async move {
                let registry = StreamRegistry::new(StreamConfig::default());
                for v in &values {
                    registry
                        .dispatch_chunk(StreamChunk::StreamData { stream_id: "p".into(), payload: json!(v) })
                        .await;
                }
                registry.dispatch_chunk(StreamChunk::StreamEnd { stream_id: "p".into() }).await;

                let cap = StreamConfig::default().pending_cap;
                let expected: Vec<_> = values.iter().rev().take(cap).rev().cloned().collect();

                let mut consumer = registry.receive_stream("p".to_owned()).await;
                for expected_value in expected {
                    match consumer.recv().await {
                        Some(StreamItem::Data(v)) => assert_eq!(v, json!(expected_value)),
                        other => panic!("unexpected: {other:?}"),
                    }
                }
                assert!(matches!(consumer.recv().await, Some(StreamItem::End)));
            });
        }
    }
}
