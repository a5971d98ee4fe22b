// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The RPC peer: request/response correlation, the welcome handshake, the
//! inbound `match` handler dispatch, and the stream helpers, all built on
//! top of a [`DuplexTransport`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use uuid::Uuid;

use crate::envelope::{Envelope, FrameError, Frame, NoopValidator, PayloadValidator, PeerId, parse_frame};
use crate::error::RpcError;
use crate::stream::{StreamConfig, StreamConsumer, StreamRegistry, StreamSender, StreamTransport};
use crate::transport::{DuplexTransport, EventKind, Listener, TransportEvent};

pub type MatchHandlerFuture = Pin<Box<dyn Future<Output = Option<Value>> + Send>>;
pub type MatchHandler = Arc<dyn Fn(Value, PeerId) -> MatchHandlerFuture + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PeerConfig {
    pub welcome_timeout: Duration,
    pub request_timeout: Duration,
    pub close_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            welcome_timeout: Duration::from_millis(4_000),
            request_timeout: Duration::from_millis(4_000),
            close_timeout: Duration::from_millis(4_000),
        }
    }
}

/// Correlation table for outbound requests awaiting a response. Removal
/// precedes notification: a timeout or a close can never observe an entry
/// that a concurrent response resolution has already taken.
#[derive(Default)]
struct PendingRequests {
    inner: Mutex<HashMap<String, oneshot::Sender<Result<Envelope, RpcError>>>>,
}

impl PendingRequests {
    fn insert(&self, request_id: String, tx: oneshot::Sender<Result<Envelope, RpcError>>) {
        self.inner.lock().insert(request_id, tx);
    }

    fn take(&self, request_id: &str) -> Option<oneshot::Sender<Result<Envelope, RpcError>>> {
        self.inner.lock().remove(request_id)
    }

    fn resolve(&self, request_id: &str, envelope: Envelope) {
        if let Some(tx) = self.take(request_id) {
            let _ = tx.send(Ok(envelope));
        }
    }

    fn reject(&self, request_id: &str, err: RpcError) {
        if let Some(tx) = self.take(request_id) {
            let _ = tx.send(Err(err));
        }
    }

    fn reject_all(&self, err: RpcError) {
        for (_, tx) in self.inner.lock().drain() {
            let _ = tx.send(Err(err.clone()));
        }
    }
}

/// Adapts a [`DuplexTransport`] to the stream multiplexer's narrower
/// [`StreamTransport`] contract (serialize-and-send plus buffer depth).
struct TransportStreamAdapter(Arc<dyn DuplexTransport>);

impl StreamTransport for TransportStreamAdapter {
    fn send_chunk(&self, chunk: crate::envelope::StreamChunk) {
        if let Ok(bytes) = chunk.to_bytes() {
            let _ = self.0.send(bytes);
        }
    }

    fn buffered_amount(&self) -> usize {
        self.0.buffered_amount()
    }
}

pub struct Peer {
    transport: Arc<dyn DuplexTransport>,
    stream_transport: Arc<dyn StreamTransport>,
    client_id: Mutex<Option<PeerId>>,
    welcome_notify: Notify,
    pending: PendingRequests,
    match_handler: Mutex<Option<MatchHandler>>,
    streams: Arc<StreamRegistry>,
    request_validator: Arc<dyn PayloadValidator>,
    response_validator: Arc<dyn PayloadValidator>,
    config: PeerConfig,
}

impl Peer {
    pub fn new(transport: Arc<dyn DuplexTransport>, stream_config: StreamConfig, config: PeerConfig) -> Arc<Self> {
        Self::with_validators(transport, stream_config, config, Arc::new(NoopValidator), Arc::new(NoopValidator))
    }

    pub fn with_validators(
        transport: Arc<dyn DuplexTransport>,
        stream_config: StreamConfig,
        config: PeerConfig,
        request_validator: Arc<dyn PayloadValidator>,
        response_validator: Arc<dyn PayloadValidator>,
    ) -> Arc<Self> {
        let stream_transport: Arc<dyn StreamTransport> = Arc::new(TransportStreamAdapter(Arc::clone(&transport)));

        let peer = Arc::new(Self {
            transport: Arc::clone(&transport),
            stream_transport,
            client_id: Mutex::new(None),
            welcome_notify: Notify::new(),
            pending: PendingRequests::default(),
            match_handler: Mutex::new(None),
            streams: StreamRegistry::new(stream_config),
            request_validator,
            response_validator,
            config,
        });

        peer.install_listeners(&transport);
        peer
    }

    fn install_listeners(self: &Arc<Self>, transport: &Arc<dyn DuplexTransport>) {
        let weak = Arc::downgrade(self);
        let message_listener: Listener = Arc::new(move |event: &TransportEvent| {
            if let TransportEvent::Message(bytes) = event {
                if let Some(peer) = weak.upgrade() {
                    let bytes = bytes.clone();
                    tokio::spawn(async move { peer.handle_inbound(bytes).await });
                }
            }
        });
        transport.add_listener(EventKind::Message, message_listener);

        let weak = Arc::downgrade(self);
        let close_listener: Listener = Arc::new(move |_event: &TransportEvent| {
            if let Some(peer) = weak.upgrade() {
                tokio::spawn(async move { peer.handle_closed().await });
            }
        });
        transport.add_listener(EventKind::Close, close_listener);
    }

    pub fn client_id(&self) -> Option<PeerId> {
        self.client_id.lock().clone()
    }

    /// Resolves when a welcome envelope arrives, rejects with
    /// `RequestTimedOut` on timeout.
    pub async fn wait_for_welcome(&self, timeout: Duration) -> Result<PeerId, RpcError> {
        // `notify_waiters()` only wakes futures already enrolled as waiters;
        // one that merely exists but hasn't been polled/enabled yet is
        // invisible to it. Enroll before the `client_id` check so a welcome
        // landing in the gap between check and await is never missed.
        let notified = self.welcome_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(id) = self.client_id() {
            return Ok(id);
        }

        tokio::select! {
            _ = notified => self.client_id().ok_or(RpcError::ConnectionClosed),
            _ = tokio::time::sleep(timeout) => Err(RpcError::RequestTimedOut),
        }
    }

    /// Fire-and-forget: wraps `payload` as a `request` envelope with no
    /// pending-response entry.
    pub fn send(&self, payload: Value, to: Option<PeerId>) {
        let envelope = Envelope::Request {
            request_id: Uuid::new_v4().to_string(),
            from: self.client_id(),
            from_name: None,
            to,
            to_name: None,
            data: payload,
        };
        if let Ok(bytes) = envelope.to_bytes() {
            let _ = self.transport.send(bytes);
        }
    }

    /// Sends `payload` as a request and awaits the matching response.
    pub async fn request(&self, payload: Value, to: Option<PeerId>, timeout: Duration) -> Result<Value, RpcError> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        let envelope = Envelope::Request {
            request_id: request_id.clone(),
            from: self.client_id(),
            from_name: None,
            to,
            to_name: None,
            data: payload,
        };
        let bytes = envelope
            .to_bytes()
            .map_err(|e| RpcError::InvalidMessageFormat(e.to_string()))?;

        if matches!(self.transport.send(bytes), crate::transport::SendOutcome::Failed) {
            self.pending.take(&request_id);
            return Err(RpcError::ConnectionClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(response))) => {
                let data = response.data().cloned().unwrap_or(Value::Null);
                self.response_validator
                    .validate(&data)
                    .map_err(RpcError::InvalidResponseData)?;
                Ok(data)
            }
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_canceled)) => Err(RpcError::ConnectionClosed),
            Err(_elapsed) => {
                self.pending.take(&request_id);
                Err(RpcError::RequestTimedOut)
            }
        }
    }

    /// Alias for [`Peer::request`].
    pub async fn call(&self, payload: Value, to: Option<PeerId>, timeout: Duration) -> Result<Value, RpcError> {
        self.request(payload, to, timeout).await
    }

    pub fn respond_to(&self, original: &Envelope, payload: Value) {
        let Some(request_id) = original.request_id() else { return };
        let envelope = Envelope::Response {
            request_id: request_id.to_owned(),
            from: self.client_id(),
            from_name: None,
            to: original.from().map(|s| s.to_owned()),
            to_name: None,
            data: payload,
        };
        if let Ok(bytes) = envelope.to_bytes() {
            let _ = self.transport.send(bytes);
        }
    }

    /// Registers the handler invoked for every inbound `request` envelope.
    /// If it returns `Some(value)`, the peer automatically responds with it.
    pub fn on_request<F>(&self, handler: F)
    where
        F: Fn(Value, PeerId) -> MatchHandlerFuture + Send + Sync + 'static,
    {
        *self.match_handler.lock() = Some(Arc::new(handler));
    }

    pub async fn close(&self, code: u16, reason: String) -> Result<(), RpcError> {
        self.pending.reject_all(RpcError::ConnectionClosed);
        self.streams.teardown().await;
        self.transport.close(code, reason, self.config.close_timeout).await
    }

    pub async fn dispose(&self) {
        self.pending.reject_all(RpcError::ConnectionClosed);
        self.streams.teardown().await;
        self.transport.dispose().await;
    }

    pub fn send_stream<S>(self: &Arc<Self>, items: S, stream_id: Option<String>) -> StreamSender
    where
        S: futures_util::Stream<Item = Result<Value, String>> + Send + Unpin + 'static,
    {
        self.streams.send_stream(Arc::clone(&self.stream_transport), items, stream_id)
    }

    pub async fn receive_stream(self: &Arc<Self>, stream_id: String) -> StreamConsumer {
        self.streams.receive_stream(stream_id).await
    }

    async fn handle_inbound(self: Arc<Self>, bytes: Vec<u8>) {
        match parse_frame(&bytes) {
            Ok(Frame::Envelope(envelope)) => self.handle_envelope(envelope).await,
            Ok(Frame::Stream(chunk)) => self.streams.dispatch_chunk(chunk).await,
            Err(FrameError::UnknownCategory(category)) => {
                tracing::warn!(category, "dropping envelope with unknown category");
            }
            Err(FrameError::UnknownType(ty)) => {
                tracing::warn!(ty, "dropping stream chunk with unknown type");
            }
            Err(FrameError::Malformed(reason)) => {
                tracing::warn!(reason, "dropping malformed frame");
            }
            Err(FrameError::NotJson) => {
                tracing::warn!("dropping non-JSON frame");
            }
        }
    }

    async fn handle_envelope(self: Arc<Self>, envelope: Envelope) {
        match envelope {
            Envelope::Welcome { client_id, .. } => {
                let mut current = self.client_id.lock();
                if current.as_deref() != Some(client_id.as_str()) {
                    *current = Some(client_id);
                }
                drop(current);
                self.welcome_notify.notify_waiters();
            }
            Envelope::Request { ref data, .. } => {
                if let Err(reason) = self.request_validator.validate(data) {
                    tracing::warn!(reason, "dropping request with invalid payload");
                    return;
                }
                let handler = self.match_handler.lock().clone();
                if let Some(handler) = handler {
                    let from = envelope.from().unwrap_or_default().to_owned();
                    let data = data.clone();
                    let handler_ref: &(dyn Fn(Value, PeerId) -> MatchHandlerFuture + Send + Sync) = &*handler;
                    if let Some(response) = handler_ref(data, from).await {
                        self.respond_to(&envelope, response);
                    }
                }
            }
            Envelope::Response { ref request_id, ref data, .. } => {
                if let Err(reason) = self.response_validator.validate(data) {
                    self.pending.reject(request_id, RpcError::InvalidResponseData(reason));
                    return;
                }
                self.pending.resolve(request_id, envelope.clone());
            }
            Envelope::Ping { timestamp } => {
                let pong = Envelope::Pong { timestamp };
                if let Ok(bytes) = pong.to_bytes() {
                    let _ = self.transport.send(bytes);
                }
            }
            Envelope::Pong { .. } => {
                // Liveness acknowledgement only.
            }
            Envelope::Error { error, .. } => {
                tracing::debug!(error, "received error envelope");
            }
        }
    }

    async fn handle_closed(self: Arc<Self>) {
        self.pending.reject_all(RpcError::ConnectionClosed);
        self.streams.teardown().await;
    }
}
