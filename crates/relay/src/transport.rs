// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The resilient client transport: a single long-lived handle over a
//! sequence of underlying duplex connections, reconnecting with exponential
//! backoff and preserving listener registrations and queued sends across
//! reconnection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::RpcError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Events dispatched to registered listeners. `Message` carries one raw
/// frame; envelope/stream-chunk decoding happens one layer up, in
/// [`crate::peer::Peer`].
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Close { code: u16, reason: String },
    Error(String),
    Message(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Open,
    Close,
    Error,
    Message,
}

impl TransportEvent {
    pub(crate) fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close { .. } => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::Message(_) => EventKind::Message,
        }
    }
}

pub type Listener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;
pub type ListenerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    Queued,
    Failed,
}

/// Anything a [`crate::peer::Peer`] can send frames through: the
/// reconnecting client transport, or (server-side) a thin wrapper over one
/// accepted connection's outbound channel.
pub trait DuplexTransport: Send + Sync {
    fn send(&self, bytes: Vec<u8>) -> SendOutcome;
    fn buffered_amount(&self) -> usize;
    fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId;
    fn add_listener_once(&self, kind: EventKind, listener: Listener) -> ListenerId;
    fn remove_listener(&self, kind: EventKind, id: ListenerId);
    fn close(&self, code: u16, reason: String, timeout: Duration) -> BoxFuture<'_, Result<(), RpcError>>;
    fn dispose(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self { reconnect_initial: Duration::from_millis(1_000), reconnect_max: Duration::from_millis(30_000) }
    }
}

struct Registration {
    id: ListenerId,
    listener: Listener,
    once: bool,
}

struct ListenerTable {
    by_kind: Mutex<HashMap<EventKind, Vec<Registration>>>,
    dispatching: Mutex<HashSet<EventKind>>,
    next_id: AtomicU64,
}

impl ListenerTable {
    fn new() -> Self {
        Self { by_kind: Mutex::new(HashMap::new()), dispatching: Mutex::new(HashSet::new()), next_id: AtomicU64::new(1) }
    }

    fn add(&self, kind: EventKind, listener: Listener, once: bool) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.by_kind.lock().entry(kind).or_default().push(Registration { id, listener, once });
        id
    }

    fn remove(&self, kind: EventKind, id: ListenerId) {
        if let Some(regs) = self.by_kind.lock().get_mut(&kind) {
            regs.retain(|r| r.id != id);
        }
    }

    fn clear(&self) {
        self.by_kind.lock().clear();
    }

    /// Re-entrancy invariant: dispatching an event of type T while already
    /// dispatching T is a silent no-op. This prevents close -> reconnect ->
    /// close storms during teardown.
    fn dispatch(&self, event: &TransportEvent) {
        let kind = event.kind();
        {
            let mut dispatching = self.dispatching.lock();
            if !dispatching.insert(kind) {
                return;
            }
        }

        let to_run: Vec<Listener> = {
            let mut by_kind = self.by_kind.lock();
            match by_kind.get_mut(&kind) {
                Some(regs) => {
                    let fired: Vec<Listener> = regs.iter().map(|r| Arc::clone(&r.listener)).collect();
                    regs.retain(|r| !r.once);
                    fired
                }
                None => Vec::new(),
            }
        };

        for listener in to_run {
            listener(event);
        }

        self.dispatching.lock().remove(&kind);
    }
}

enum Command {
    Send(Vec<u8>),
    Close { code: u16, reason: String },
    Dispose,
}

/// A single-handle wrapper over a sequence of WebSocket connections to one
/// URL, reconnecting with exponential backoff on unplanned close.
pub struct ResilientTransport {
    listeners: Arc<ListenerTable>,
    connected: Arc<AtomicBool>,
    closed_by_user: Arc<AtomicBool>,
    buffered_amount: Arc<AtomicUsize>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    closed_notify: Arc<tokio::sync::Notify>,
}

impl ResilientTransport {
    /// Start connecting to `url` in the background and return the handle
    /// immediately; `send()` queues until the first successful open.
    pub fn connect(url: String, cfg: TransportConfig) -> Arc<Self> {
        let listeners = Arc::new(ListenerTable::new());
        let connected = Arc::new(AtomicBool::new(false));
        let closed_by_user = Arc::new(AtomicBool::new(false));
        let buffered_amount = Arc::new(AtomicUsize::new(0));
        let closed_notify = Arc::new(tokio::sync::Notify::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            url,
            cfg,
            listeners: Arc::clone(&listeners),
            connected: Arc::clone(&connected),
            closed_by_user: Arc::clone(&closed_by_user),
            buffered_amount: Arc::clone(&buffered_amount),
            closed_notify: Arc::clone(&closed_notify),
            queue: VecDeque::new(),
            attempts: 0,
        };
        tokio::spawn(driver.run(cmd_rx));

        Arc::new(Self { listeners, connected, closed_by_user, buffered_amount, cmd_tx, closed_notify })
    }

    /// Awaitable close: marks the transport closed-by-user (preventing
    /// further reconnects), asks the driver to close the live connection,
    /// and waits for the close event up to `timeout`.
    async fn close_impl(&self, code: u16, reason: String, timeout: Duration) -> Result<(), RpcError> {
        self.closed_by_user.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Close { code, reason });

        tokio::select! {
            _ = self.closed_notify.notified() => Ok(()),
            _ = tokio::time::sleep(timeout) => Err(RpcError::CloseTimedOut),
        }
    }

    async fn dispose_impl(&self) {
        self.closed_by_user.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Dispose);
        self.listeners.clear();
    }
}

impl DuplexTransport for ResilientTransport {
    fn send(&self, bytes: Vec<u8>) -> SendOutcome {
        if self.closed_by_user.load(Ordering::SeqCst) {
            return SendOutcome::Failed;
        }
        let outcome = if self.connected.load(Ordering::SeqCst) { SendOutcome::Sent } else { SendOutcome::Queued };
        self.buffered_amount.fetch_add(bytes.len(), Ordering::SeqCst);
        let _ = self.cmd_tx.send(Command::Send(bytes));
        outcome
    }

    fn buffered_amount(&self) -> usize {
        self.buffered_amount.load(Ordering::SeqCst)
    }

    fn add_listener(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.listeners.add(kind, listener, false)
    }

    fn add_listener_once(&self, kind: EventKind, listener: Listener) -> ListenerId {
        self.listeners.add(kind, listener, true)
    }

    fn remove_listener(&self, kind: EventKind, id: ListenerId) {
        self.listeners.remove(kind, id);
    }

    fn close(&self, code: u16, reason: String, timeout: Duration) -> BoxFuture<'_, Result<(), RpcError>> {
        Box::pin(self.close_impl(code, reason, timeout))
    }

    fn dispose(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.dispose_impl())
    }
}

/// The background task: owns the queue and the live connection, and is the
/// only writer to either. `connected`/`buffered_amount` are read by `send()`
/// from other tasks, so they live in atomics shared with the handle.
struct Driver {
    url: String,
    cfg: TransportConfig,
    listeners: Arc<ListenerTable>,
    connected: Arc<AtomicBool>,
    closed_by_user: Arc<AtomicBool>,
    buffered_amount: Arc<AtomicUsize>,
    closed_notify: Arc<tokio::sync::Notify>,
    queue: VecDeque<Vec<u8>>,
    attempts: u32,
}

impl Driver {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        loop {
            if self.closed_by_user.load(Ordering::SeqCst) {
                self.closed_notify.notify_waiters();
                return;
            }

            match tokio_tungstenite::connect_async(&self.url).await {
                Ok((ws_stream, _response)) => {
                    self.attempts = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    self.listeners.dispatch(&TransportEvent::Open);

                    let (mut sink, mut stream) = ws_stream.split();

                    for queued in self.queue.drain(..).collect::<Vec<_>>() {
                        self.buffered_amount.fetch_sub(queued.len(), Ordering::SeqCst);
                        let _ = sink.send(WsMessage::binary(queued)).await;
                    }

                    let close_reason = 'conn: loop {
                        tokio::select! {
                            cmd = cmd_rx.recv() => match cmd {
                                Some(Command::Send(bytes)) => {
                                    self.buffered_amount.fetch_sub(bytes.len(), Ordering::SeqCst);
                                    if sink.send(WsMessage::binary(bytes)).await.is_err() {
                                        break 'conn (1006, "send failed".to_owned(), true);
                                    }
                                }
                                Some(Command::Close { code, reason }) => {
                                    let _ = sink.send(WsMessage::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                                        code: code.into(),
                                        reason: reason.clone().into(),
                                    }))).await;
                                    break 'conn (code, reason, true);
                                }
                                Some(Command::Dispose) => break 'conn (1000, "disposed".to_owned(), true),
                                None => break 'conn (1000, "handle dropped".to_owned(), true),
                            },
                            msg = stream.next() => match msg {
                                Some(Ok(WsMessage::Binary(bytes))) => {
                                    self.listeners.dispatch(&TransportEvent::Message(bytes.to_vec()));
                                }
                                Some(Ok(WsMessage::Text(text))) => {
                                    self.listeners.dispatch(&TransportEvent::Message(text.as_bytes().to_vec()));
                                }
                                Some(Ok(WsMessage::Close(frame))) => {
                                    let (code, reason) = frame
                                        .map(|f| (f.code.into(), f.reason.to_string()))
                                        .unwrap_or((1006, String::new()));
                                    break 'conn (code, reason, false);
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    self.listeners.dispatch(&TransportEvent::Error(e.to_string()));
                                    break 'conn (1006, e.to_string(), false);
                                }
                                None => break 'conn (1006, "stream ended".to_owned(), false),
                            },
                        }
                    };

                    self.connected.store(false, Ordering::SeqCst);
                    let (code, reason, by_user) = close_reason;
                    self.listeners.dispatch(&TransportEvent::Close { code, reason });

                    if by_user || self.closed_by_user.load(Ordering::SeqCst) {
                        self.closed_notify.notify_waiters();
                        return;
                    }
                    // Unplanned close: fall through to the backoff/reconnect below.
                }
                Err(e) => {
                    self.listeners.dispatch(&TransportEvent::Error(e.to_string()));
                }
            }

            if self.closed_by_user.load(Ordering::SeqCst) {
                self.closed_notify.notify_waiters();
                return;
            }

            let delay = backoff_delay(self.cfg.reconnect_initial, self.cfg.reconnect_max, self.attempts);
            self.attempts = self.attempts.saturating_add(1);

            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Close { .. }) | Some(Command::Dispose) | None => {
                        self.closed_by_user.store(true, Ordering::SeqCst);
                        self.closed_notify.notify_waiters();
                        return;
                    }
                    Some(Command::Send(bytes)) => self.queue.push_back(bytes),
                },
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn backoff_delay(initial: Duration, max: Duration, attempts: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempts.min(32));
    let millis = (initial.as_millis() as u64).saturating_mul(factor);
    Duration::from_millis(millis).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn backoff_doubles_until_capped() {
        let initial = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);
        assert_eq!(backoff_delay(initial, max, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(initial, max, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(initial, max, 2), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(initial, max, 10), max);
    }

    #[test]
    fn listener_dispatch_skips_reentrant_same_kind() {
        let table = ListenerTable::new();
        let depth = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let table_for_listener = Arc::new(table);
        let table_clone = Arc::clone(&table_for_listener);
        let depth_clone = Arc::clone(&depth);
        let max_seen_clone = Arc::clone(&max_seen);

        table_for_listener.add(
            EventKind::Close,
            Arc::new(move |event: &TransportEvent| {
                let d = depth_clone.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen_clone.fetch_max(d, Ordering::SeqCst);
                // Recursive dispatch of the same kind must be skipped.
                table_clone.dispatch(event);
                depth_clone.fetch_sub(1, Ordering::SeqCst);
            }),
            false,
        );

        table_for_listener.dispatch(&TransportEvent::Close { code: 1000, reason: String::new() });
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn once_listener_fires_only_once() {
        let table = ListenerTable::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        table.add(EventKind::Open, Arc::new(move |_| { count_clone.fetch_add(1, Ordering::SeqCst); }), true);

        table.dispatch(&TransportEvent::Open);
        table.dispatch(&TransportEvent::Open);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_does_not_fire() {
        let table = ListenerTable::new();
        let count = Arc::new(AtomicU32::new(0));
        let count_clone = Arc::clone(&count);
        let id = table.add(EventKind::Message, Arc::new(move |_| { count_clone.fetch_add(1, Ordering::SeqCst); }), false);
        table.remove(EventKind::Message, id);

        table.dispatch(&TransportEvent::Message(vec![]));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    proptest::proptest! {
        /// The backoff delay never exceeds `max` and never falls below
        /// `initial`, regardless of how many attempts have elapsed.
        #[test]
        fn backoff_delay_stays_within_bounds(
            initial_ms in 1u64..5_000,
            max_ms in 5_000u64..60_000,
            attempts in 0u32..1_000,
        ) {
            let delay = backoff_delay(Duration::from_millis(initial_ms), Duration::from_millis(max_ms), attempts);
            proptest::prop_assert!(delay >= Duration::from_millis(initial_ms));
            proptest::prop_assert!(delay <= Duration::from_millis(max_ms));
        }

        /// Backoff is monotonically non-decreasing in the attempt count.
        #[test]
        fn backoff_delay_is_monotonic(initial_ms in 1u64..5_000, max_ms in 5_000u64..60_000, attempts in 0u32..200) {
            let initial = Duration::from_millis(initial_ms);
            let max = Duration::from_millis(max_ms);
            let this = backoff_delay(initial, max, attempts);
            let next = backoff_delay(initial, max, attempts + 1);
            proptest::prop_assert!(next >= this);
        }
    }
}
