// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The on-the-wire envelope shape and the frame parser.
//!
//! Envelopes and stream chunks share one UTF-8 JSON frame channel and are
//! distinguished by the presence of `category` (envelope) versus `type`
//! (stream chunk). Unknown `category`/`type` values are never fatal — the
//! caller drops them and logs a warning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An opaque peer identifier minted by the relay per accepted connection.
pub type PeerId = String;

/// An opaque identifier minted when credentials validate, used to restore a
/// previous `PeerId` across reconnection.
pub type SessionId = String;

/// The wire envelope, discriminated on `category`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "category")]
pub enum Envelope {
    #[serde(rename = "request")]
    Request {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(rename = "fromName", skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(rename = "toName", skip_serializing_if = "Option::is_none")]
        to_name: Option<String>,
        data: Value,
    },
    #[serde(rename = "response")]
    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<PeerId>,
        #[serde(rename = "fromName", skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        to: Option<PeerId>,
        #[serde(rename = "toName", skip_serializing_if = "Option::is_none")]
        to_name: Option<String>,
        data: Value,
    },
    #[serde(rename = "welcome")]
    Welcome {
        #[serde(rename = "clientId")]
        client_id: PeerId,
        #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        #[serde(rename = "restoredSession", skip_serializing_if = "Option::is_none")]
        restored_session: Option<bool>,
    },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
    #[serde(rename = "error")]
    Error {
        error: String,
        #[serde(flatten)]
        details: serde_json::Map<String, Value>,
    },
}

impl Envelope {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::Request { request_id, .. } | Self::Response { request_id, .. } => {
                Some(request_id)
            }
            _ => None,
        }
    }

    pub fn to(&self) -> Option<&str> {
        match self {
            Self::Request { to, .. } | Self::Response { to, .. } => to.as_deref(),
            _ => None,
        }
    }

    pub fn from(&self) -> Option<&str> {
        match self {
            Self::Request { from, .. } | Self::Response { from, .. } => from.as_deref(),
            _ => None,
        }
    }

    pub fn data(&self) -> Option<&Value> {
        match self {
            Self::Request { data, .. } | Self::Response { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Welcome { .. } => "welcome",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Stream chunk envelope: disjoint from [`Envelope`], tagged on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamChunk {
    StreamData {
        #[serde(rename = "streamId")]
        stream_id: String,
        payload: Value,
    },
    StreamEnd {
        #[serde(rename = "streamId")]
        stream_id: String,
    },
    StreamError {
        #[serde(rename = "streamId")]
        stream_id: String,
        error: String,
    },
}

impl StreamChunk {
    pub fn stream_id(&self) -> &str {
        match self {
            Self::StreamData { stream_id, .. }
            | Self::StreamEnd { stream_id, .. }
            | Self::StreamError { stream_id, .. } => stream_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// The two disjoint frame kinds that can arrive on one transport.
#[derive(Debug, Clone)]
pub enum Frame {
    Envelope(Envelope),
    Stream(StreamChunk),
}

/// Why a frame failed to parse as a known [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not valid UTF-8 JSON at all.
    NotJson,
    /// Had a `category` field, but not one of the known envelope kinds.
    UnknownCategory(String),
    /// Had a `type` field, but not one of the known stream chunk kinds.
    UnknownType(String),
    /// Had a recognized `category`/`type` but failed to deserialize.
    Malformed(String),
}

const KNOWN_CATEGORIES: &[&str] =
    &["request", "response", "welcome", "ping", "pong", "error"];
const KNOWN_TYPES: &[&str] = &["StreamData", "StreamEnd", "StreamError"];

/// Parse one transport frame. Unknown `category`/`type` values are reported
/// as such (never fatal to the caller); anything else that fails to parse
/// against a *known* tag is `Malformed`.
pub fn parse_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|_| FrameError::NotJson)?;

    if let Some(category) = value.get("category").and_then(Value::as_str) {
        let category = category.to_owned();
        return match serde_json::from_value::<Envelope>(value) {
            Ok(envelope) => Ok(Frame::Envelope(envelope)),
            Err(e) => {
                if KNOWN_CATEGORIES.contains(&category.as_str()) {
                    Err(FrameError::Malformed(e.to_string()))
                } else {
                    Err(FrameError::UnknownCategory(category))
                }
            }
        };
    }

    if let Some(ty) = value.get("type").and_then(Value::as_str) {
        let ty = ty.to_owned();
        return match serde_json::from_value::<StreamChunk>(value) {
            Ok(chunk) => Ok(Frame::Stream(chunk)),
            Err(e) => {
                if KNOWN_TYPES.contains(&ty.as_str()) {
                    Err(FrameError::Malformed(e.to_string()))
                } else {
                    Err(FrameError::UnknownType(ty))
                }
            }
        };
    }

    Err(FrameError::Malformed("missing category/type discriminant".to_owned()))
}

/// Payload validator hook, applied to the opaque `data` field of a request
/// or response envelope before it is delivered to user code.
pub trait PayloadValidator: Send + Sync {
    fn validate(&self, payload: &Value) -> Result<(), String>;
}

/// A validator that accepts any payload; the default when the caller has no
/// schema to enforce.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl PayloadValidator for NoopValidator {
    fn validate(&self, _payload: &Value) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_request_envelope() {
        let bytes = br#"{"category":"request","requestId":"r1","to":"p2","data":{"x":1}}"#;
        match parse_frame(bytes).unwrap() {
            Frame::Envelope(Envelope::Request { request_id, to, data, .. }) => {
                assert_eq!(request_id, "r1");
                assert_eq!(to.as_deref(), Some("p2"));
                assert_eq!(data, json!({"x": 1}));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn parses_stream_data_chunk() {
        let bytes = br#"{"type":"StreamData","streamId":"s1","payload":"hi"}"#;
        match parse_frame(bytes).unwrap() {
            Frame::Stream(StreamChunk::StreamData { stream_id, payload }) => {
                assert_eq!(stream_id, "s1");
                assert_eq!(payload, json!("hi"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_category_is_reported_not_fatal() {
        let bytes = br#"{"category":"wat","foo":"bar"}"#;
        assert_eq!(parse_frame(bytes), Err(FrameError::UnknownCategory("wat".to_owned())));
    }

    #[test]
    fn malformed_known_category_is_reported() {
        let bytes = br#"{"category":"request"}"#;
        assert!(matches!(parse_frame(bytes), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn not_json_is_reported() {
        assert_eq!(parse_frame(b"not json at all"), Err(FrameError::NotJson));
    }

    #[test]
    fn error_envelope_round_trips_with_extra_details() {
        let env = Envelope::Error {
            error: "Target peer not found".to_owned(),
            details: [("targetId".to_owned(), json!("p9"))].into_iter().collect(),
        };
        let bytes = env.to_bytes().unwrap();
        match parse_frame(&bytes).unwrap() {
            Frame::Envelope(Envelope::Error { error, details }) => {
                assert_eq!(error, "Target peer not found");
                assert_eq!(details.get("targetId").unwrap(), "p9");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn forward_compat_unknown_field_is_ignored() {
        let bytes = br#"{"category":"ping","timestamp":1,"extra":"field"}"#;
        assert!(matches!(parse_frame(bytes), Ok(Frame::Envelope(Envelope::Ping { timestamp: 1 }))));
    }

    proptest::proptest! {
        /// Forward-compatibility: a `ping` envelope carrying an arbitrary
        /// extra field always parses, and the extra field never changes the
        /// decoded timestamp.
        #[test]
        fn ping_survives_arbitrary_extra_field(timestamp: u64, extra in "[a-zA-Z0-9]{0,16}") {
            let value = json!({"category": "ping", "timestamp": timestamp, "extra": extra});
            let bytes = serde_json::to_vec(&value).unwrap();
            match parse_frame(&bytes) {
                Ok(Frame::Envelope(Envelope::Ping { timestamp: got })) => {
                    proptest::prop_assert_eq!(got, timestamp);
                }
                other => proptest::prop_assert!(false, "unexpected: {other:?}"),
            }
        }

        /// Any non-empty string that isn't one of the known category tags is
        /// reported as `UnknownCategory`, never treated as fatal/malformed.
        #[test]
        fn unrecognized_category_is_reported_not_malformed(category in "[a-z]{1,12}") {
            proptest::prop_assume!(!KNOWN_CATEGORIES.contains(&category.as_str()));
            let bytes = serde_json::to_vec(&json!({"category": category})).unwrap();
            proptest::prop_assert_eq!(parse_frame(&bytes), Err(FrameError::UnknownCategory(category)));
        }
    }
}
