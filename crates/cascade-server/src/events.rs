//! Server lifecycle events.
//!
//! The controller broadcasts on two buses: the public bus, and a plugin
//! bus that observes each lifecycle event first and additionally sees
//! [`ServerEvent::Disconnect`] while a session is still tearing down.

use crate::response::Responder;
use cascade_core::{CascadeError, TokenError};
use serde_json::Value;
use std::sync::{Arc, Mutex};

/// Events emitted by the server controller.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// The broker signalled readiness.
    Ready,

    /// A transport passed the origin and handshake gates and a session
    /// was created.
    Handshake {
        /// The new session's id.
        socket_id: String,
    },

    /// A session completed its protocol handshake and is open.
    Connection {
        /// The session's id.
        socket_id: String,
    },

    /// A session was torn down.
    Disconnection {
        /// The session's id.
        socket_id: String,
    },

    /// Plugin-bus-only notification fired at the start of teardown.
    Disconnect {
        /// The session's id.
        socket_id: String,
    },

    /// A client event that passed the emit stage.
    Received {
        /// The emitting session's id.
        socket_id: String,
        /// Event name.
        event: String,
        /// Event payload.
        data: Option<Value>,
        /// Reply handle, when the client correlated the event. Shared so
        /// any listener may answer; the at-most-once contract still
        /// holds.
        responder: Option<Arc<Mutex<Responder>>>,
    },

    /// A recoverable problem.
    Warning {
        /// What went wrong.
        error: CascadeError,
    },

    /// A per-session error.
    SocketError {
        /// The session's id.
        socket_id: String,
        /// What went wrong.
        error: CascadeError,
    },

    /// A session presented a token that failed verification.
    BadSocketAuthToken {
        /// The session's id.
        socket_id: String,
        /// The verification failure.
        error: TokenError,
    },
}
