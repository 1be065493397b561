//! # cascade-core
//!
//! Domain core for the Cascade realtime server:
//!
//! - **Middleware** - staged gates for handshake, emit, subscribe, and
//!   publish traffic
//! - **Broker** - the pub/sub substrate sessions bind to, with an
//!   in-process default implementation
//! - **Auth** - JWT verification and signing with soft-failure kinds
//! - **Errors** - the stable, wire-visible error vocabulary
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌─────────────┐
//! │   Session   │────▶│  Middleware  │────▶│   Broker    │
//! └─────────────┘     └──────────────┘     └─────────────┘
//!        │                                        │
//!        ▼                                        ▼
//! ┌─────────────┐                         ┌─────────────┐
//! │ AuthEngine  │                         │  Exchange   │
//! └─────────────┘                         └─────────────┘
//! ```

pub mod auth;
pub mod broker;
pub mod error;
pub mod middleware;

pub use auth::{
    is_token_expired, now_ms, now_secs, token_expiry, AuthEngine, AuthKeys, JwtAuthEngine,
    TokenError, DEFAULT_EXPIRY_SECS,
};
pub use broker::{
    validate_channel_name, Broker, BrokerError, ChannelMessage, Exchange, MemoryBroker,
};
pub use error::CascadeError;
pub use middleware::{
    Decision, EmitRequest, GateControl, GateId, HandshakeRequest, MiddlewarePipeline,
    MiddlewareStage, PublishInRequest, PublishOutRequest, SocketRef, StageOutcome,
    SubscribeRequest, WarningSink,
};
