//! Error kinds for the Cascade server.
//!
//! The variant names here are stable and visible on the wire; clients
//! match on them, so renaming one is a protocol change.

use crate::middleware::MiddlewareStage;
use cascade_protocol::WireError;
use thiserror::Error;

/// Errors raised by the server core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CascadeError {
    /// The session's auth token carries an `exp` in the past.
    #[error("Auth token expired at {expiry}")]
    AuthTokenExpired {
        /// The token's `exp` claim, in seconds since epoch.
        expiry: u64,
    },

    /// The presented auth token could not be accepted.
    #[error("Auth token is invalid")]
    AuthTokenInvalid,

    /// No `#handshake` arrived within the ack timeout.
    #[error("Handshake was not received within {timeout_ms} ms")]
    HandshakeTimeout {
        /// Configured ack timeout.
        timeout_ms: u64,
    },

    /// The connection's origin is not in the accepted set.
    #[error("Origin '{origin}' is not allowed")]
    InvalidOrigin {
        /// The offending origin header value.
        origin: String,
    },

    /// The broker refused to bind the session.
    #[error("Failed to bind socket to the broker: {message}")]
    BrokerBindFailed {
        /// Broker-supplied reason.
        message: String,
    },

    /// The broker refused to unbind the session.
    #[error("Failed to unbind socket from the broker: {message}")]
    BrokerUnbindFailed {
        /// Broker-supplied reason.
        message: String,
    },

    /// A middleware gate blocked the action without wanting a warning.
    #[error("Action was silently blocked by the {stage} middleware")]
    SilentMiddlewareBlocked {
        /// The stage whose gate blocked.
        stage: MiddlewareStage,
    },

    /// A gate invoked its continuation more than once.
    #[error("Middleware callback for the {stage} stage was invoked more than once")]
    MiddlewareDoubleCallback {
        /// The stage whose gate misbehaved.
        stage: MiddlewareStage,
    },

    /// `#publish` received while client publishing is disabled.
    #[error("Client publish is disabled on this server")]
    ClientPublishDisabled,

    /// A second reply was attempted for the same request.
    #[error("A response for request {rid} has already been sent")]
    ResponseAlreadySent {
        /// The correlation id of the request.
        rid: u64,
    },

    /// Asymmetric auth keys were not configured as a pair.
    #[error("auth private and public keys must be specified together")]
    AuthKeyConfig,

    /// The session is closed; the action was dropped.
    #[error("Socket is closed")]
    SocketClosed,

    /// An application-supplied error, usually from a middleware gate.
    #[error("{message}")]
    Custom {
        /// Wire-visible kind name.
        name: String,
        /// Human-readable message.
        message: String,
    },
}

impl CascadeError {
    /// The stable wire name of this error kind.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            CascadeError::AuthTokenExpired { .. } => "AuthTokenExpired",
            CascadeError::AuthTokenInvalid => "AuthTokenInvalid",
            CascadeError::HandshakeTimeout { .. } => "HandshakeTimeout",
            CascadeError::InvalidOrigin { .. } => "InvalidOrigin",
            CascadeError::BrokerBindFailed { .. } => "BrokerBindFailed",
            CascadeError::BrokerUnbindFailed { .. } => "BrokerUnbindFailed",
            CascadeError::SilentMiddlewareBlocked { .. } => "SilentMiddlewareBlocked",
            CascadeError::MiddlewareDoubleCallback { .. } => "MiddlewareDoubleCallback",
            CascadeError::ClientPublishDisabled => "ClientPublishDisabled",
            CascadeError::ResponseAlreadySent { .. } => "ResponseAlreadySent",
            CascadeError::AuthKeyConfig => "AuthKeyConfigError",
            CascadeError::SocketClosed => "SocketClosed",
            CascadeError::Custom { name, .. } => name,
        }
    }

    /// Build an application error with an explicit kind name.
    #[must_use]
    pub fn custom(name: impl Into<String>, message: impl Into<String>) -> Self {
        CascadeError::Custom {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Serialize into the structured wire representation.
    #[must_use]
    pub fn to_wire(&self) -> WireError {
        WireError::new(self.name().to_string(), self.to_string())
    }
}

impl From<CascadeError> for WireError {
    fn from(error: CascadeError) -> Self {
        error.to_wire()
    }
}

impl From<String> for CascadeError {
    /// Bare strings are synthesized into a generic `Error` kind.
    fn from(message: String) -> Self {
        CascadeError::Custom {
            name: "Error".into(),
            message,
        }
    }
}

impl From<&str> for CascadeError {
    fn from(message: &str) -> Self {
        message.to_string().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_are_stable() {
        assert_eq!(
            CascadeError::AuthTokenExpired { expiry: 1000 }.name(),
            "AuthTokenExpired"
        );
        assert_eq!(CascadeError::ClientPublishDisabled.name(), "ClientPublishDisabled");
        assert_eq!(CascadeError::AuthKeyConfig.name(), "AuthKeyConfigError");
        assert_eq!(
            CascadeError::SilentMiddlewareBlocked {
                stage: MiddlewareStage::Subscribe
            }
            .name(),
            "SilentMiddlewareBlocked"
        );
    }

    #[test]
    fn test_to_wire_carries_name_and_message() {
        let wire = CascadeError::ResponseAlreadySent { rid: 3 }.to_wire();
        assert_eq!(wire.name, "ResponseAlreadySent");
        assert!(wire.message.contains('3'));
    }

    #[test]
    fn test_bare_string_synthesis() {
        let error: CascadeError = "denied".into();
        assert_eq!(error.name(), "Error");
        assert_eq!(error.to_string(), "denied");
    }

    #[test]
    fn test_stage_in_message() {
        let error = CascadeError::SilentMiddlewareBlocked {
            stage: MiddlewareStage::PublishIn,
        };
        assert!(error.to_string().contains("publishIn"));
    }
}
