//! Codec for encoding and decoding Cascade frames.
//!
//! Frames travel as JSON text, one frame per WebSocket text message; the
//! transport's own framing delimits them.

use thiserror::Error;

use crate::packet::Frame;

/// Maximum encoded frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON serialization error.
    #[error("Codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is structurally invalid.
    #[error("Invalid frame: {0}")]
    Invalid(String),
}

/// Encode a frame to its JSON text representation.
///
/// # Errors
///
/// Returns an error if the frame is too large or serialization fails.
pub fn encode(frame: &Frame) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(frame)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a frame from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large, empty, or not a valid frame.
pub fn decode(text: &str) -> Result<Frame, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    if text.trim().is_empty() {
        return Err(ProtocolError::Invalid("empty frame".into()));
    }

    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, Reply, WireError};
    use serde_json::json;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::Packet(Packet::with_cid("#handshake", Some(json!({})), 1)),
            Frame::Packet(Packet::with_cid("#subscribe", Some(json!("room")), 7)),
            Frame::Packet(Packet::new(
                "#publish",
                Some(json!({"channel": "room", "data": 1})),
            )),
            Frame::Reply(Reply::ok(1, Some(json!({"id": "x"})))),
            Frame::Reply(Reply::err(
                9,
                WireError::new("ClientPublishDisabled", "disabled"),
            )),
        ];

        for frame in frames {
            let encoded = encode(&frame).unwrap();
            let decoded = decode(&encoded).unwrap();
            assert_eq!(frame, decoded);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode(""), Err(ProtocolError::Invalid(_))));
        assert!(matches!(decode("   "), Err(ProtocolError::Invalid(_))));
        assert!(decode("{not json}").is_err());
        // A JSON object that is neither a packet nor a reply.
        assert!(decode(r#"{"foo": 1}"#).is_err());
    }

    #[test]
    fn test_frame_too_large() {
        let payload = "x".repeat(MAX_FRAME_SIZE + 1);
        let frame = Frame::Packet(Packet::new("big", Some(json!(payload))));

        match encode(&frame) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }
}
