//! Packet and reply types for the Cascade protocol.
//!
//! A client message is a [`Packet`]; when it carries a `cid` the client
//! expects exactly one [`Reply`] echoing that id as `rid`. Event names
//! beginning with `#` are reserved for protocol control traffic.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol handshake request event.
pub const HANDSHAKE_EVENT: &str = "#handshake";
/// Re-authentication event.
pub const AUTHENTICATE_EVENT: &str = "#authenticate";
/// Token removal event.
pub const REMOVE_AUTH_TOKEN_EVENT: &str = "#removeAuthToken";
/// Channel subscription event.
pub const SUBSCRIBE_EVENT: &str = "#subscribe";
/// Channel unsubscription event.
pub const UNSUBSCRIBE_EVENT: &str = "#unsubscribe";
/// Channel publish event, both inbound and outbound.
pub const PUBLISH_EVENT: &str = "#publish";
/// Server-initiated failure notification.
pub const FAIL_EVENT: &str = "#fail";

/// Check whether an event name is reserved for protocol control traffic.
#[must_use]
pub fn is_reserved(event: &str) -> bool {
    event.starts_with('#')
}

/// An event message.
///
/// `cid` is a client-chosen correlation id; its presence means the client
/// expects a single [`Reply`] carrying the same value as `rid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Correlation id, when a reply is expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<u64>,
}

impl Packet {
    /// Create a new uncorrelated packet.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            event: event.into(),
            data,
            cid: None,
        }
    }

    /// Create a packet that expects a reply.
    #[must_use]
    pub fn with_cid(event: impl Into<String>, data: Option<Value>, cid: u64) -> Self {
        Self {
            event: event.into(),
            data,
            cid: Some(cid),
        }
    }
}

/// A reply to a correlated packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    /// The `cid` of the packet this replies to.
    pub rid: u64,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl Reply {
    /// Create a success reply.
    #[must_use]
    pub fn ok(rid: u64, data: Option<Value>) -> Self {
        Self {
            rid,
            data,
            error: None,
        }
    }

    /// Create an error reply.
    #[must_use]
    pub fn err(rid: u64, error: WireError) -> Self {
        Self {
            rid,
            data: None,
            error: Some(error),
        }
    }
}

/// A structured error as serialized on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Stable error kind name.
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional stack or context trace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl WireError {
    /// Create a wire error with an explicit kind name.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }
}

impl From<String> for WireError {
    /// Bare strings are synthesized into a generic `Error`.
    fn from(message: String) -> Self {
        Self::new("Error", message)
    }
}

impl From<&str> for WireError {
    fn from(message: &str) -> Self {
        Self::new("Error", message.to_string())
    }
}

/// Any frame that can cross the wire.
///
/// The two shapes are disjoint: a reply always carries `rid`, a packet
/// always carries `event`, so untagged deserialization is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// A reply to a correlated packet.
    Reply(Reply),
    /// An event message.
    Packet(Packet),
}

impl From<Packet> for Frame {
    fn from(packet: Packet) -> Self {
        Frame::Packet(packet)
    }
}

impl From<Reply> for Frame {
    fn from(reply: Reply) -> Self {
        Frame::Reply(reply)
    }
}

/// Reply payload of a successful `#handshake`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Server-assigned socket id.
    pub id: String,
    /// Whether a valid auth token was presented.
    pub is_authenticated: bool,
    /// Keepalive timeout the client should assume, in milliseconds.
    pub ping_timeout: u64,
    /// Soft auth failure, when token verification did not succeed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<WireError>,
}

/// Reply payload of `#authenticate`.
///
/// Auth failures are soft: they ride in the success slot of the reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    /// Whether the session holds a valid token after the attempt.
    pub is_authenticated: bool,
    /// Why verification failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<WireError>,
}

/// Payload of a `#publish` packet in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEnvelope {
    /// Target channel.
    pub channel: String,
    /// Published value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of a `#subscribe` or `#unsubscribe` packet.
///
/// Clients send either the bare channel name or a `{channel}` envelope.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ChannelRequest {
    /// Bare channel name.
    Name(String),
    /// Envelope form.
    Envelope {
        /// Target channel.
        channel: String,
    },
}

impl ChannelRequest {
    /// Extract the channel name.
    #[must_use]
    pub fn into_channel(self) -> String {
        match self {
            ChannelRequest::Name(name) => name,
            ChannelRequest::Envelope { channel } => channel,
        }
    }
}
