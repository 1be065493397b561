//! Per-connection session state.
//!
//! A session is exclusively owned by its connection task; every inbound
//! message is processed to completion before the next is dequeued, so
//! session state never needs cross-task synchronization.

use cascade_core::{is_token_expired, now_ms, token_expiry, CascadeError, SocketRef};
use cascade_protocol::{Frame, Packet};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// An item queued for the connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    /// A protocol frame, encoded to a text message.
    Frame(Frame),
    /// A transport-level keepalive ping.
    Ping(Vec<u8>),
    /// A transport-level pong.
    Pong(Vec<u8>),
}

/// Sending half of a connection's outbound queue.
pub type OutboundSender = mpsc::UnboundedSender<Outbound>;

/// The session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport accepted, protocol handshake outstanding.
    Connecting,
    /// Handshake and broker bind completed.
    Open,
    /// Torn down.
    Closed,
}

/// One client connection.
pub struct Session {
    /// Server-assigned socket id, unique within the process.
    pub id: String,
    /// Lifecycle state.
    pub state: SessionState,
    /// Decoded auth token, when the session is authenticated.
    pub auth_token: Option<Value>,
    /// Peer address.
    pub remote_addr: Option<String>,
    /// Outbound queue to the writer task.
    pub outbound: OutboundSender,
    /// Whether the broker bind succeeded; unbind happens exactly once.
    pub bound: bool,
    /// Whether the handshake timer is still armed.
    pub handshake_armed: bool,
    /// Forwarder tasks, one per subscribed channel.
    pub subscriptions: HashMap<String, JoinHandle<()>>,
}

impl Session {
    /// Create a session in the `Connecting` state.
    #[must_use]
    pub fn new(outbound: OutboundSender, remote_addr: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            state: SessionState::Connecting,
            auth_token: None,
            remote_addr,
            outbound,
            bound: false,
            handshake_armed: true,
            subscriptions: HashMap::new(),
        }
    }

    /// Snapshot the session for middleware request records.
    #[must_use]
    pub fn socket_ref(&self) -> SocketRef {
        SocketRef {
            id: self.id.clone(),
            auth_token: self.auth_token.clone(),
            remote_addr: self.remote_addr.clone(),
        }
    }

    /// Clear the auth token, returning the previous value.
    pub fn deauthenticate(&mut self) -> Option<Value> {
        let previous = self.auth_token.take();
        if previous.is_some() {
            debug!(socket = %self.id, "Socket deauthenticated");
        }
        previous
    }

    /// Re-check token expiry at dispatch time.
    ///
    /// When the token carries an `exp` in the past the session is
    /// deauthenticated and the expiry error to attach to the stage
    /// request is returned. Middleware stays the authority on whether
    /// the event itself is rejected.
    pub fn expired_token_error(&mut self) -> Option<CascadeError> {
        let token = self.auth_token.as_ref()?;
        if !is_token_expired(token, now_ms()) {
            return None;
        }

        let expiry = token_expiry(token).unwrap_or_default();
        self.deauthenticate();
        Some(CascadeError::AuthTokenExpired { expiry })
    }

    /// Queue an event packet for the client.
    pub fn send_event(&self, event: &str, data: Option<Value>) {
        // A closed writer means the transport is gone; the loop exits on
        // its own shortly.
        let _ = self
            .outbound
            .send(Outbound::Frame(Frame::Packet(Packet::new(event, data))));
    }

    /// Abort every subscription forwarder.
    pub fn abort_subscriptions(&mut self) {
        for (_, handle) in self.subscriptions.drain() {
            handle.abort();
        }
    }
}
