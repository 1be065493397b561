//! # cascade-server
//!
//! Realtime message server: long-lived WebSocket sessions, a staged
//! middleware pipeline gating every emit / subscribe / publish, JWT
//! bearer-token auth with soft failures, and channel pub/sub through a
//! pluggable broker.
//!
//! ## Example
//!
//! ```rust,no_run
//! use cascade_server::{Config, Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(Config::default())?;
//!
//!     // Gate subscriptions: only authenticated sessions may join.
//!     server.middleware().add_subscribe(|request, control| {
//!         if request.socket.auth_token.is_some() {
//!             control.allow();
//!         } else {
//!             control.block("subscription requires authentication");
//!         }
//!     });
//!
//!     server.run().await
//! }
//! ```

pub mod config;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod origin;
pub mod response;
pub mod server;
pub mod session;

pub use config::{generate_auth_key, AuthConfig, Config, MetricsConfig};
pub use events::ServerEvent;
pub use origin::OriginPolicy;
pub use response::Responder;
pub use server::{ClientHandle, Server, ServerBuilder};
pub use session::{Outbound, OutboundSender, Session, SessionState};
