// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Standard close codes, reconnect eligibility, and human descriptions.
//!
//! 1005, 1006, and 1015 are reserved: the application never sends them, but
//! the transport layer may *observe* 1006 (abnormal closure, no close
//! frame) from the underlying connection, so reconnect eligibility is
//! exposed for raw `u16` codes too, not just [`CloseCode`].

/// Close codes the application may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    Normal,
    GoingAway,
    ProtocolError,
    Unsupported,
    PolicyViolation,
    MessageTooBig,
    InternalError,
    ServiceRestart,
    TryAgainLater,
    BadGateway,
}

impl CloseCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::ProtocolError => 1002,
            Self::Unsupported => 1003,
            Self::PolicyViolation => 1008,
            Self::MessageTooBig => 1009,
            Self::InternalError => 1011,
            Self::ServiceRestart => 1012,
            Self::TryAgainLater => 1013,
            Self::BadGateway => 1014,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Normal => "Normal closure",
            Self::GoingAway => "Going away",
            Self::ProtocolError => "Protocol error",
            Self::Unsupported => "Unsupported data",
            Self::PolicyViolation => "Policy violation",
            Self::MessageTooBig => "Message too big",
            Self::InternalError => "Internal error",
            Self::ServiceRestart => "Service restart",
            Self::TryAgainLater => "Try again later",
            Self::BadGateway => "Bad gateway",
        }
    }

    /// Client-side hint only: whether a disconnect with this code should be
    /// followed by a reconnect attempt.
    pub fn can_reconnect(self) -> bool {
        can_reconnect_raw(self.code())
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1008 => Self::PolicyViolation,
            1009 => Self::MessageTooBig,
            1011 => Self::InternalError,
            1012 => Self::ServiceRestart,
            1013 => Self::TryAgainLater,
            1014 => Self::BadGateway,
            _ => return None,
        })
    }
}

/// Codes that are reserved by the protocol and never sent by this
/// application, but may be observed as the *reason* a connection closed
/// (e.g. 1006, abnormal closure with no close frame at all).
pub const RESERVED_CODES: &[u16] = &[1005, 1006, 1015];

/// Whether a raw close code (application-sent or merely observed, such as
/// the reserved 1006) should trigger a client reconnect attempt.
pub fn can_reconnect_raw(code: u16) -> bool {
    matches!(code, 1001 | 1006 | 1011 | 1012 | 1013 | 1014)
}
