// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A bidirectional RPC fabric over a persistent duplex transport: a central
//! relay that authenticates, authorizes, rate-limits, and routes envelopes
//! between many long-lived peer connections, plus the client-side peer and
//! resilient transport that speak to it.

pub mod auth;
pub mod closecode;
pub mod config;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod relay;
pub mod stream;
pub mod transport;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::auth::{AllowAll, AuthorizationRules, CredentialValidator};
use crate::config::RelayConfig;
use crate::relay::{router, RelayState};

/// Run the relay until shutdown, using permissive defaults for credential
/// validation and authorization. Embedders wanting real auth should build
/// [`RelayState`] directly with their own [`CredentialValidator`]/
/// [`AuthorizationRules`] implementations and call [`serve`].
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    let allow_all: Arc<AllowAll> = Arc::new(AllowAll::default());
    let credential_validator: Arc<dyn CredentialValidator> = allow_all.clone();
    let authorization_rules: Arc<dyn AuthorizationRules> = allow_all;

    serve(config, credential_validator, authorization_rules, CancellationToken::new()).await
}

/// Run the relay with caller-supplied collaborators until `shutdown` fires.
/// Cancelling `shutdown` stops the listener from accepting new connections
/// *and* is observed directly by every in-flight connection's dispatch loop
/// (`relay::connection_task`'s `tokio::select!` carries a `shutdown.cancelled()`
/// arm), so existing connections exit within one poll tick rather than
/// lingering until axum's graceful-shutdown drain finishes on its own.
pub async fn serve(
    config: RelayConfig,
    credential_validator: Arc<dyn CredentialValidator>,
    authorization_rules: Arc<dyn AuthorizationRules>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = RelayState::new(config, credential_validator, authorization_rules, shutdown.clone());

    tracing::info!(%addr, "relay listening");

    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown.cancelled_owned()).await?;

    Ok(())
}
