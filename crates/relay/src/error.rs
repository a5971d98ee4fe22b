// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error taxonomy for the peer and relay boundaries.
//!
//! Peer-local errors (`RpcError`) never cross a connection; they surface as
//! rejected futures to the caller that initiated the operation. Relay errors
//! (`RelayError`) are wire-facing: they become `error`-category envelopes
//! sent back to the offending sender, or an HTTP status at the upgrade step.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;

/// Errors local to a [`crate::peer::Peer`] or [`crate::transport::ResilientTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// The envelope or its payload failed schema validation.
    InvalidMessageFormat(String),
    /// A request's payload failed the handler-side schema before dispatch.
    InvalidRequestData(String),
    /// A response's payload failed the caller-side schema; the pending
    /// request is rejected with this variant.
    InvalidResponseData(String),
    /// No matching response arrived before the deadline.
    RequestTimedOut,
    /// The connection was lost while a request or welcome wait was pending.
    ConnectionClosed,
    /// `close()` did not observe the transport's close event within its
    /// deadline.
    CloseTimedOut,
    /// A stream was cancelled explicitly via `abort`/consumer cancel.
    StreamAborted,
    /// A stream was cancelled while waiting out backpressure.
    StreamAbortedDuringBackpressure,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMessageFormat(reason) => write!(f, "invalid message format: {reason}"),
            Self::InvalidRequestData(reason) => write!(f, "invalid request data: {reason}"),
            Self::InvalidResponseData(reason) => write!(f, "invalid response data: {reason}"),
            Self::RequestTimedOut => f.write_str("request timed out"),
            Self::ConnectionClosed => f.write_str("connection closed"),
            Self::CloseTimedOut => f.write_str("close timed out"),
            Self::StreamAborted => f.write_str("stream aborted"),
            Self::StreamAbortedDuringBackpressure => {
                f.write_str("stream aborted during backpressure wait")
            }
        }
    }
}

impl std::error::Error for RpcError {}

/// Errors generated by the relay's dispatch path, delivered to the sender as
/// an `error`-category envelope. None of these close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayError {
    MessageTooLarge,
    RateLimitExceeded,
    Unauthorized,
    Forbidden,
    TargetPeerNotFound,
}

impl RelayError {
    /// HTTP status used only at the upgrade step (401/403); dispatch-path
    /// occurrences of this error never produce an HTTP response.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            _ => 400,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::MessageTooLarge => "Message exceeds maximum size",
            Self::RateLimitExceeded => "Rate limit exceeded",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::TargetPeerNotFound => "Target peer not found",
        }
    }

    /// Build the `error`-category envelope sent back to the sender.
    pub fn to_envelope(&self, target_id: Option<&str>) -> Envelope {
        let mut details = serde_json::Map::new();
        if let Some(id) = target_id {
            details.insert("targetId".to_owned(), serde_json::Value::String(id.to_owned()));
        }
        Envelope::Error { error: self.message().to_owned(), details }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl std::error::Error for RelayError {}
