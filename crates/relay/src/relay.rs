// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The relay: accepts connections, mints or restores peer identities, and
//! routes envelopes either direct-to-peer or broadcast-to-topic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth::{AuthContext, AuthorizationRules, CredentialValidator, RateLimiter};
use crate::config::RelayConfig;
use crate::envelope::{parse_frame, Envelope, Frame, PeerId, SessionId};
use crate::error::RelayError;

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<Message>,
    topic: String,
}

/// Process-wide relay state: one instance per listening socket.
pub struct RelayState {
    pub config: RelayConfig,
    credential_validator: Arc<dyn CredentialValidator>,
    authorization_rules: Arc<dyn AuthorizationRules>,
    routes: Mutex<HashMap<PeerId, ConnectionHandle>>,
    sessions: Mutex<HashMap<SessionId, PeerId>>,
    rate_limiter: RateLimiter,
    shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        credential_validator: Arc<dyn CredentialValidator>,
        authorization_rules: Arc<dyn AuthorizationRules>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            credential_validator,
            authorization_rules,
            routes: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            rate_limiter: RateLimiter::new(),
            shutdown,
        })
    }

    fn insert_connection(&self, peer_id: PeerId, topic: String, outbound: mpsc::UnboundedSender<Message>) {
        self.routes.lock().insert(peer_id, ConnectionHandle { outbound, topic });
    }

    /// Close-event cleanup: drop the route; if session persistence is
    /// disabled, drop any session mapping too; clear the rate-limit bucket.
    fn remove_connection(&self, peer_id: &str, session_id: Option<&str>, rate_limit_key: &str) {
        self.routes.lock().remove(peer_id);
        if !self.config.session_persistence {
            if let Some(sid) = session_id {
                self.sessions.lock().remove(sid);
            }
        }
        self.rate_limiter.clear(rate_limit_key);
    }

    fn lookup(&self, peer_id: &str) -> Option<mpsc::UnboundedSender<Message>> {
        self.routes.lock().get(peer_id).map(|h| h.outbound.clone())
    }

    /// Publish to every subscriber of `topic` except `sender_id`.
    fn publish(&self, topic: &str, sender_id: &str, bytes: &[u8]) {
        let routes = self.routes.lock();
        for (peer_id, handle) in routes.iter() {
            if peer_id != sender_id && handle.topic == topic {
                let _ = handle.outbound.send(Message::binary(bytes.to_vec()));
            }
        }
    }

    /// Mint or restore a peerId per the upgrade path's step 6. Returns
    /// `(peerId, sessionId, restored, previousSessionId)`.
    fn mint_or_restore_peer(&self, query_session_id: Option<&str>) -> (PeerId, Option<SessionId>, bool, Option<SessionId>) {
        if !self.config.session_persistence {
            return (Uuid::new_v4().to_string(), None, false, None);
        }

        if let Some(sid) = query_session_id {
            if let Some(existing) = self.sessions.lock().get(sid).cloned() {
                return (existing, Some(sid.to_owned()), true, Some(sid.to_owned()));
            }
        }

        let peer_id = Uuid::new_v4().to_string();
        let session_id = Uuid::new_v4().to_string();
        self.sessions.lock().insert(session_id.clone(), peer_id.clone());
        (peer_id, Some(session_id), false, None)
    }
}

pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(upgrade_root))
        .route("/{*topic}", get(upgrade_topic))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

async fn upgrade_root(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote_addr = connect_info.map(|c| c.0);
    upgrade(ws, state, headers, params, String::new(), remote_addr).await
}

async fn upgrade_topic(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    Path(topic): Path<String>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let remote_addr = connect_info.map(|c| c.0);
    upgrade(ws, state, headers, params, topic, remote_addr).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<RelayState>,
    headers: HeaderMap,
    params: HashMap<String, String>,
    mut topic: String,
    remote_addr: Option<SocketAddr>,
) -> Response {
    // Step 1: reject forbidden path substrings.
    if topic.contains("..") {
        return (StatusCode::BAD_REQUEST, "invalid topic").into_response();
    }
    if topic.is_empty() {
        topic = state.config.default_topic.clone();
    }

    // Step 2: bearer header wins over the query parameter.
    let token = bearer_from_header(&headers).or_else(|| params.get("token").cloned());

    // Step 3.
    let Some(auth) = state.credential_validator.validate(token.as_deref()) else {
        return (StatusCode::UNAUTHORIZED, "invalid credentials").into_response();
    };

    // Step 5 (step 4 folded into topic resolution above).
    if !state.authorization_rules.can_subscribe_to_topic(auth.user_id.as_deref(), &topic) {
        return (StatusCode::FORBIDDEN, "not subscribed to topic").into_response();
    }

    // Step 6.
    let (peer_id, session_id, restored, previous_session_id) =
        state.mint_or_restore_peer(params.get("sessionId").map(String::as_str));

    let connected_at = Instant::now();
    tracing::info!(
        %peer_id,
        %topic,
        restored,
        remote_addr = ?remote_addr,
        connected_at = ?connected_at,
        user_id = ?auth.user_id,
        "accepting connection"
    );

    // Step 7.
    ws.on_upgrade(move |socket| {
        connection_task(
            socket,
            state,
            peer_id,
            topic,
            auth,
            session_id,
            restored,
            previous_session_id,
            remote_addr,
            connected_at,
        )
    })
}

fn bearer_from_header(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(axum::http::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(str::to_owned)
}

async fn connection_task(
    mut socket: WebSocket,
    state: Arc<RelayState>,
    peer_id: PeerId,
    topic: String,
    auth: AuthContext,
    session_id: Option<SessionId>,
    restored: bool,
    _previous_session_id: Option<SessionId>,
    remote_addr: Option<SocketAddr>,
    connected_at: Instant,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    state.insert_connection(peer_id.clone(), topic.clone(), outbound_tx.clone());

    let welcome = Envelope::Welcome {
        client_id: peer_id.clone(),
        session_id: session_id.clone(),
        restored_session: Some(restored),
    };
    if let Ok(bytes) = welcome.to_bytes() {
        let _ = outbound_tx.send(Message::binary(bytes));
    }

    let rate_limit_key = auth.rate_limit_key(&peer_id).to_owned();

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            outgoing = outbound_rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        if socket.send(msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(bytes))) => {
                        handle_frame(&state, &peer_id, &topic, &auth, bytes.to_vec(), &outbound_tx).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        handle_frame(&state, &peer_id, &topic, &auth, text.as_bytes().to_vec(), &outbound_tx).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, %peer_id, "connection I/O failure");
                        break;
                    }
                }
            }
        }
    }

    state.remove_connection(&peer_id, session_id.as_deref(), &rate_limit_key);
    tracing::info!(
        %peer_id,
        remote_addr = ?remote_addr,
        connected_at = ?connected_at,
        user_id = ?auth.user_id,
        "connection closed"
    );
}

async fn handle_frame(
    state: &Arc<RelayState>,
    sender_id: &str,
    topic: &str,
    auth: &AuthContext,
    bytes: Vec<u8>,
    outbound: &mpsc::UnboundedSender<Message>,
) {
    // Step 1: size gate.
    if bytes.len() > state.config.max_message_size {
        send_error(outbound, RelayError::MessageTooLarge, None);
        return;
    }

    // Step 2: rate gate.
    if state.config.rate_limit_enabled {
        let key = auth.rate_limit_key(sender_id).to_owned();
        let limit = state.authorization_rules.get_rate_limit(auth.user_id.as_deref());
        if !state.rate_limiter.try_consume(&key, limit) {
            send_error(outbound, RelayError::RateLimitExceeded, None);
            return;
        }
    }

    // Step 3: parse, falling back to the documented raw-broadcast quirk.
    let frame = match parse_frame(&bytes) {
        Ok(frame) => frame,
        Err(_) => {
            tracing::warn!(%sender_id, %topic, "publishing unparsable frame verbatim (raw-broadcast quirk)");
            state.publish(topic, sender_id, &bytes);
            return;
        }
    };

    // Step 4: ping/pong are handled here and never forwarded.
    match &frame {
        Frame::Envelope(Envelope::Ping { timestamp }) => {
            let pong = Envelope::Pong { timestamp: *timestamp };
            if let Ok(bytes) = pong.to_bytes() {
                let _ = outbound.send(Message::binary(bytes));
            }
            return;
        }
        Frame::Envelope(Envelope::Pong { .. }) => return,
        _ => {}
    }

    // Step 5: direct-vs-broadcast dispatch. Stream chunks carry no `to`
    // field in the wire schema, so they always take the broadcast branch.
    let to = match &frame {
        Frame::Envelope(envelope) => envelope.to().map(str::to_owned),
        Frame::Stream(_) => None,
    };

    dispatch(state, sender_id, topic, auth, to, &bytes, outbound);
}

fn dispatch(
    state: &Arc<RelayState>,
    sender_id: &str,
    topic: &str,
    auth: &AuthContext,
    to: Option<String>,
    bytes: &[u8],
    outbound: &mpsc::UnboundedSender<Message>,
) {
    if let Some(target) = to {
        if !state.authorization_rules.can_message_peer(auth.user_id.as_deref(), &target) {
            send_error(outbound, RelayError::Forbidden, Some(&target));
            return;
        }
        match state.lookup(&target) {
            Some(handle) => {
                let _ = handle.send(Message::binary(bytes.to_vec()));
            }
            None => send_error(outbound, RelayError::TargetPeerNotFound, Some(&target)),
        }
        return;
    }

    if !state.authorization_rules.can_publish_to_topic(auth.user_id.as_deref(), topic) {
        send_error(outbound, RelayError::Forbidden, None);
        return;
    }
    state.publish(topic, sender_id, bytes);
}

fn send_error(outbound: &mpsc::UnboundedSender<Message>, error: RelayError, target_id: Option<&str>) {
    let envelope = error.to_envelope(target_id);
    if let Ok(bytes) = envelope.to_bytes() {
        let _ = outbound.send(Message::binary(bytes));
    }
}
