// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Integration tests for the relay's upgrade path.
//!
//! Uses `axum_test::TestServer` — no real TCP needed.

use std::sync::Arc;

use axum_test::TestServer;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use relay::auth::{AllowAll, AuthContext, AuthorizationRules, CredentialValidator};
use relay::config::RelayConfig;
use relay::relay::{router, RelayState};

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.port = 0;
    config
}

fn test_state() -> Arc<RelayState> {
    RelayState::new(
        test_config(),
        Arc::new(AllowAll::default()),
        Arc::new(AllowAll::default()),
        CancellationToken::new(),
    )
}

fn test_server(state: Arc<RelayState>) -> TestServer {
    TestServer::new(router(state)).expect("failed to create test server")
}

/// Rejects every token, used to exercise the 401 path.
struct RejectAll;

impl CredentialValidator for RejectAll {
    fn validate(&self, _token: Option<&str>) -> Option<AuthContext> {
        None
    }
}

impl AuthorizationRules for RejectAll {
    fn can_subscribe_to_topic(&self, _user_id: Option<&str>, _topic: &str) -> bool {
        true
    }
    fn can_publish_to_topic(&self, _user_id: Option<&str>, _topic: &str) -> bool {
        true
    }
    fn can_message_peer(&self, _user_id: Option<&str>, _target_peer_id: &str) -> bool {
        true
    }
    fn get_rate_limit(&self, _user_id: Option<&str>) -> f64 {
        50.0
    }
}

/// Allows credentials but forbids every topic, used to exercise the 403 path.
struct NoTopics;

impl CredentialValidator for NoTopics {
    fn validate(&self, _token: Option<&str>) -> Option<AuthContext> {
        Some(AuthContext::anonymous())
    }
}

impl AuthorizationRules for NoTopics {
    fn can_subscribe_to_topic(&self, _user_id: Option<&str>, _topic: &str) -> bool {
        false
    }
    fn can_publish_to_topic(&self, _user_id: Option<&str>, _topic: &str) -> bool {
        true
    }
    fn can_message_peer(&self, _user_id: Option<&str>, _target_peer_id: &str) -> bool {
        true
    }
    fn get_rate_limit(&self, _user_id: Option<&str>) -> f64 {
        50.0
    }
}

#[tokio::test]
async fn upgrade_sends_welcome_envelope() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let mut ws = server.get_websocket("/chat").await.into_websocket().await;
    let msg: serde_json::Value = ws.receive_json().await;

    assert_eq!(msg["category"], "welcome");
    assert!(msg["clientId"].is_string());
    Ok(())
}

#[tokio::test]
async fn invalid_credentials_reject_upgrade() -> anyhow::Result<()> {
    let state = RelayState::new(test_config(), Arc::new(RejectAll), Arc::new(RejectAll), CancellationToken::new());
    let server = test_server(state);

    let resp = server.get("/chat").add_header("Authorization", "Bearer nope").await;
    resp.assert_status_unauthorized();
    Ok(())
}

#[tokio::test]
async fn disallowed_topic_rejects_upgrade() -> anyhow::Result<()> {
    let state = RelayState::new(test_config(), Arc::new(NoTopics), Arc::new(NoTopics), CancellationToken::new());
    let server = test_server(state);

    let resp = server.get("/forbidden-room").await;
    resp.assert_status_forbidden();
    Ok(())
}

#[tokio::test]
async fn direct_message_routes_between_two_peers() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let mut alice = server.get_websocket("/chat").await.into_websocket().await;
    let alice_welcome: serde_json::Value = alice.receive_json().await;
    let alice_id = alice_welcome["clientId"].as_str().unwrap().to_owned();

    let mut bob = server.get_websocket("/chat").await.into_websocket().await;
    let bob_welcome: serde_json::Value = bob.receive_json().await;
    let bob_id = bob_welcome["clientId"].as_str().unwrap().to_owned();

    alice
        .send_json(&json!({
            "category": "request",
            "requestId": "r1",
            "to": bob_id,
            "data": {"hello": "bob"}
        }))
        .await;

    let received: serde_json::Value = bob.receive_json().await;
    assert_eq!(received["category"], "request");
    assert_eq!(received["requestId"], "r1");
    assert_eq!(received["data"]["hello"], "bob");

    let _ = alice_id;
    Ok(())
}

#[tokio::test]
async fn broadcast_skips_sender_and_reaches_other_subscribers() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let mut alice = server.get_websocket("/chat").await.into_websocket().await;
    let _: serde_json::Value = alice.receive_json().await;
    let mut bob = server.get_websocket("/chat").await.into_websocket().await;
    let _: serde_json::Value = bob.receive_json().await;

    alice
        .send_json(&json!({
            "category": "request",
            "requestId": "r2",
            "data": {"shout": "hi room"}
        }))
        .await;

    let received: serde_json::Value = bob.receive_json().await;
    assert_eq!(received["data"]["shout"], "hi room");
    Ok(())
}

#[tokio::test]
async fn unknown_target_peer_gets_error_envelope() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let mut alice = server.get_websocket("/chat").await.into_websocket().await;
    let _: serde_json::Value = alice.receive_json().await;

    alice
        .send_json(&json!({
            "category": "request",
            "requestId": "r3",
            "to": "ghost-peer",
            "data": {}
        }))
        .await;

    let received: serde_json::Value = alice.receive_json().await;
    assert_eq!(received["category"], "error");
    assert_eq!(received["targetId"], "ghost-peer");
    Ok(())
}

#[tokio::test]
async fn ping_is_answered_with_pong_and_not_forwarded() -> anyhow::Result<()> {
    let state = test_state();
    let server = test_server(state);

    let mut ws = server.get_websocket("/chat").await.into_websocket().await;
    let _: serde_json::Value = ws.receive_json().await;

    ws.send_json(&json!({"category": "ping", "timestamp": 42})).await;
    let reply: serde_json::Value = ws.receive_json().await;
    assert_eq!(reply["category"], "pong");
    assert_eq!(reply["timestamp"], 42);
    Ok(())
}

#[tokio::test]
async fn session_persistence_restores_peer_id_on_reconnect() -> anyhow::Result<()> {
    let mut config = test_config();
    config.session_persistence = true;
    let state = RelayState::new(
        config,
        Arc::new(AllowAll::default()),
        Arc::new(AllowAll::default()),
        CancellationToken::new(),
    );
    let server = test_server(state);

    let mut first = server.get_websocket("/chat").await.into_websocket().await;
    let welcome: serde_json::Value = first.receive_json().await;
    let peer_id = welcome["clientId"].as_str().unwrap().to_owned();
    let session_id = welcome["sessionId"].as_str().unwrap().to_owned();
    drop(first);

    let mut second = server
        .get_websocket(&format!("/chat?sessionId={session_id}"))
        .await
        .into_websocket()
        .await;
    let restored_welcome: serde_json::Value = second.receive_json().await;
    assert_eq!(restored_welcome["clientId"], peer_id);
    assert_eq!(restored_welcome["restoredSession"], true);
    Ok(())
}
