//! Reply correlation for inbound requests.
//!
//! A [`Responder`] represents the single reply owed to a correlated
//! packet. It enforces the at-most-once contract: the second successful
//! send attempt fails with `ResponseAlreadySent`.

use crate::session::{Outbound, OutboundSender};
use cascade_core::CascadeError;
use cascade_protocol::{Frame, Reply, WireError};
use serde_json::Value;

/// The pending reply for one correlated inbound packet.
///
/// Uncorrelated packets get a responder with no `rid`; replying through
/// it is a no-op.
#[derive(Debug)]
pub struct Responder {
    rid: Option<u64>,
    sent: bool,
    outbound: OutboundSender,
}

impl Responder {
    /// Create a responder for a packet's correlation id.
    #[must_use]
    pub fn new(rid: Option<u64>, outbound: OutboundSender) -> Self {
        Self {
            rid,
            sent: false,
            outbound,
        }
    }

    /// The correlation id, when the request expects a reply.
    #[must_use]
    pub fn rid(&self) -> Option<u64> {
        self.rid
    }

    /// Whether a reply has been sent.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Reply success.
    ///
    /// # Errors
    ///
    /// Returns `ResponseAlreadySent` on the second attempt.
    pub fn end(&mut self, data: Option<Value>) -> Result<(), CascadeError> {
        self.respond_inner(data, None)
    }

    /// Reply failure.
    ///
    /// # Errors
    ///
    /// Returns `ResponseAlreadySent` on the second attempt.
    pub fn error(
        &mut self,
        error: impl Into<WireError>,
        data: Option<Value>,
    ) -> Result<(), CascadeError> {
        self.respond_inner(data, Some(error.into()))
    }

    /// Convenience over [`end`](Self::end) / [`error`](Self::error).
    ///
    /// # Errors
    ///
    /// Returns `ResponseAlreadySent` on the second attempt.
    pub fn respond(
        &mut self,
        result: Result<Option<Value>, CascadeError>,
    ) -> Result<(), CascadeError> {
        match result {
            Ok(data) => self.end(data),
            Err(error) => self.error(error, None),
        }
    }

    fn respond_inner(
        &mut self,
        data: Option<Value>,
        error: Option<WireError>,
    ) -> Result<(), CascadeError> {
        let Some(rid) = self.rid else {
            return Ok(());
        };

        if self.sent {
            return Err(CascadeError::ResponseAlreadySent { rid });
        }
        self.sent = true;

        // Write failures surface on the session's writer, not here; a
        // closed session simply drops the reply.
        let _ = self
            .outbound
            .send(Outbound::Frame(Frame::Reply(Reply { rid, data, error })));

        Ok(())
    }
}
