//! # cascade-protocol
//!
//! Wire protocol definitions for the Cascade realtime server.
//!
//! The protocol is JSON text over a message-framed transport. Clients
//! send [`Packet`]s; a packet carrying a `cid` expects exactly one
//! [`Reply`] echoing the id as `rid`. Errors cross the wire as
//! structured [`WireError`] records.
//!
//! ## Example
//!
//! ```rust
//! use cascade_protocol::{codec, Frame, Packet};
//! use serde_json::json;
//!
//! let frame = Frame::Packet(Packet::with_cid("#handshake", Some(json!({})), 1));
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod packet;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use packet::{
    is_reserved, AuthenticateResponse, ChannelRequest, Frame, HandshakeResponse, Packet,
    PublishEnvelope, Reply, WireError,
};
pub use packet::{
    AUTHENTICATE_EVENT, FAIL_EVENT, HANDSHAKE_EVENT, PUBLISH_EVENT, REMOVE_AUTH_TOKEN_EVENT,
    SUBSCRIBE_EVENT, UNSUBSCRIBE_EVENT,
};
