use bytes::Bytes;
use serde_json::Value;

pub mod wire;

pub use wire::{decode, encode, WireError};

/// Wire protocol version advertised in the `vsn` query parameter.
pub const VSN: &str = "1.0.0";

/// Reserved topic the client heartbeats on.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Upper bound on buffered-but-unsent pushes per channel.
pub const MAX_PUSH_BUFFER_SIZE: usize = 100;

/// Reserved event names used by the protocol.
pub mod event {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const REPLY: &str = "phx_reply";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
    pub const SYSTEM: &str = "system";

    /// Events scoped to a single join generation. Frames carrying one of
    /// these with a stale join ref are dropped by the channel.
    pub const CHANNEL_LIFECYCLE: [&str; 4] = [JOIN, LEAVE, CLOSE, ERROR];

    /// Event name a push listens on for its reply.
    pub fn reply_event(reference: &str) -> String {
        format!("chan_reply_{reference}")
    }
}

/// A message as it travels over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Payload carried by a [`Frame`].
///
/// `BinaryReply` is the decoded form of a binary reply frame: the wire
/// event bytes become the status and the trailing bytes the response.
/// Re-encoding it reproduces the original frame byte for byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Binary(Bytes),
    BinaryReply { status: String, response: Bytes },
}

impl Payload {
    pub fn json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Json(Value::Null) => true,
            Payload::Json(Value::Object(map)) => map.is_empty(),
            Payload::Json(_) => false,
            Payload::Binary(bytes) => bytes.is_empty(),
            Payload::BinaryReply { .. } => false,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// The unit exchanged with the server.
///
/// A reply frame carries the same `reference` as the request it answers.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Identifies the channel's current join generation. Absent on
    /// server-originated pushes.
    pub join_ref: Option<String>,
    /// Correlates a request with its reply. Absent on broadcasts.
    pub reference: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Payload,
}

impl Frame {
    pub fn new(
        join_ref: Option<String>,
        reference: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            join_ref,
            reference,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// Reply status and response, when this frame is a reply.
    pub fn reply(&self) -> Option<(String, Payload)> {
        match &self.payload {
            Payload::Json(value) => {
                let status = value.get("status")?.as_str()?.to_string();
                let response = value
                    .get("response")
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()));
                Some((status, Payload::Json(response)))
            }
            Payload::BinaryReply { status, response } => {
                Some((status.clone(), Payload::Binary(response.clone())))
            }
            Payload::Binary(_) => None,
        }
    }
}
