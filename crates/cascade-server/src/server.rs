//! The server controller.
//!
//! Owns the client map, the middleware pipeline, and the broker and
//! auth engine handles, and broadcasts lifecycle events. Per-session
//! errors are routed through [`Server::emit_socket_error`] and never
//! cross sessions; configuration errors at construction are fatal.

use crate::config::Config;
use crate::events::ServerEvent;
use crate::handlers;
use crate::metrics;
use crate::origin::OriginPolicy;
use crate::session::{OutboundSender, Session};
use anyhow::{Context, Result};
use cascade_core::{
    AuthEngine, Broker, CascadeError, Exchange, JwtAuthEngine, MemoryBroker, MiddlewarePipeline,
    TokenError, WarningSink,
};
use dashmap::DashMap;
use jsonwebtoken::Algorithm;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_BUS_CAPACITY: usize = 256;

/// The server's handle on one open session.
pub struct ClientHandle {
    /// Outbound queue of the session's writer task.
    pub outbound: OutboundSender,
    /// Peer address.
    pub remote_addr: Option<String>,
}

/// Builder for a [`Server`], allowing broker and auth overrides.
pub struct ServerBuilder {
    config: Config,
    broker: Option<Arc<dyn Broker>>,
    auth: Option<Arc<dyn AuthEngine>>,
}

impl ServerBuilder {
    /// Override the broker engine.
    #[must_use]
    pub fn broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Override the auth engine.
    #[must_use]
    pub fn auth_engine(mut self, auth: Arc<dyn AuthEngine>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Build the server.
    ///
    /// # Errors
    ///
    /// Fails on invalid auth configuration: a half-specified asymmetric
    /// key pair, an unknown algorithm, or unparsable key material.
    pub fn build(self) -> Result<Arc<Server>> {
        let config = self.config;

        let auth: Arc<dyn AuthEngine> = match self.auth {
            Some(auth) => auth,
            None => {
                let keys = config.resolve_auth_keys()?;
                let algorithm: Algorithm = config
                    .auth
                    .algorithm
                    .parse()
                    .with_context(|| format!("unknown auth algorithm: {}", config.auth.algorithm))?;
                Arc::new(JwtAuthEngine::new(
                    &keys,
                    algorithm,
                    config.auth.default_expiry_secs,
                )?)
            }
        };

        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(MemoryBroker::new()) as Arc<dyn Broker>);

        let (events_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (plugin_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let warning_bus = events_tx.clone();
        let warnings: WarningSink = Arc::new(move |error: CascadeError| {
            warn!(kind = error.name(), "{error}");
            let _ = warning_bus.send(ServerEvent::Warning { error });
        });

        let app_name = config
            .app_name
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Arc::new(Server {
            origin_policy: OriginPolicy::new(&config.origins),
            middleware: MiddlewarePipeline::new(config.middleware_emit_warnings, warnings),
            clients: DashMap::new(),
            app_name,
            config,
            broker,
            auth,
            events_tx,
            plugin_tx,
        }))
    }
}

/// The process-wide server controller.
pub struct Server {
    pub(crate) config: Config,
    app_name: String,
    pub(crate) clients: DashMap<String, ClientHandle>,
    middleware: MiddlewarePipeline,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) auth: Arc<dyn AuthEngine>,
    pub(crate) origin_policy: OriginPolicy,
    events_tx: broadcast::Sender<ServerEvent>,
    plugin_tx: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Start building a server.
    #[must_use]
    pub fn builder(config: Config) -> ServerBuilder {
        ServerBuilder {
            config,
            broker: None,
            auth: None,
        }
    }

    /// Build a server with the default broker and auth engine.
    ///
    /// # Errors
    ///
    /// Fails on invalid auth configuration.
    pub fn new(config: Config) -> Result<Arc<Self>> {
        Self::builder(config).build()
    }

    /// The server configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The stable process identifier.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    /// The middleware pipeline; gates are registered here.
    #[must_use]
    pub fn middleware(&self) -> &MiddlewarePipeline {
        &self.middleware
    }

    /// The broker engine.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// The auth engine.
    #[must_use]
    pub fn auth_engine(&self) -> &Arc<dyn AuthEngine> {
        &self.auth
    }

    /// A publish handle over the broker.
    #[must_use]
    pub fn exchange(&self) -> Exchange {
        Exchange::new(Arc::clone(&self.broker))
    }

    /// Subscribe to public server events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events_tx.subscribe()
    }

    /// Subscribe to the plugin bus.
    ///
    /// The plugin bus observes each lifecycle event before the public
    /// bus and additionally sees [`ServerEvent::Disconnect`].
    #[must_use]
    pub fn plugin_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.plugin_tx.subscribe()
    }

    /// Number of open sessions.
    #[must_use]
    pub fn clients_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether a session is open.
    #[must_use]
    pub fn has_client(&self, socket_id: &str) -> bool {
        self.clients.contains_key(socket_id)
    }

    pub(crate) fn register_client(&self, session: &Session) {
        self.clients.insert(
            session.id.clone(),
            ClientHandle {
                outbound: session.outbound.clone(),
                remote_addr: session.remote_addr.clone(),
            },
        );
        debug!(socket = %session.id, clients = self.clients.len(), "Client registered");
    }

    pub(crate) fn unregister_client(&self, socket_id: &str) {
        self.clients.remove(socket_id);
        debug!(socket = %socket_id, clients = self.clients.len(), "Client unregistered");
    }

    pub(crate) fn notify_public(&self, event: ServerEvent) {
        let _ = self.events_tx.send(event);
    }

    pub(crate) fn notify_plugin(&self, event: ServerEvent) {
        let _ = self.plugin_tx.send(event);
    }

    /// Emit a lifecycle event: plugin bus first, then public.
    pub(crate) fn notify_lifecycle(&self, event: ServerEvent) {
        self.notify_plugin(event.clone());
        self.notify_public(event);
    }

    /// Emit a recoverable problem as a warning.
    pub(crate) fn emit_warning(&self, error: CascadeError) {
        warn!(kind = error.name(), "{error}");
        self.notify_public(ServerEvent::Warning { error });
    }

    /// Emit a per-session error.
    ///
    /// Per-session errors never crash the server; they are reported as
    /// a socket error event plus a warning.
    pub(crate) fn emit_socket_error(&self, socket_id: &str, error: CascadeError) {
        warn!(socket = %socket_id, kind = error.name(), "Socket Error: {error}");
        metrics::record_error(error.name());
        self.notify_public(ServerEvent::SocketError {
            socket_id: socket_id.to_string(),
            error: error.clone(),
        });
        self.notify_public(ServerEvent::Warning { error });
    }

    /// Report a token verification failure on a session.
    pub(crate) fn notify_bad_auth_token(&self, socket_id: &str, error: TokenError) {
        debug!(socket = %socket_id, kind = error.name(), "Bad auth token");
        metrics::record_auth_failure();
        self.notify_public(ServerEvent::BadSocketAuthToken {
            socket_id: socket_id.to_string(),
            error,
        });
    }

    /// Run the server until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker never becomes ready or the
    /// listener cannot be bound.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if self.config.metrics.enabled {
            if let Err(e) = metrics::start_metrics_server(self.config.metrics.port) {
                error!("Failed to start metrics server: {}", e);
            }
        }

        if self.config.per_message_deflate {
            warn!("per_message_deflate is not supported by this transport; continuing uncompressed");
        }

        self.broker.ready().await?;
        self.notify_public(ServerEvent::Ready);

        let addr = self.config.bind_addr();
        let app = handlers::router(Arc::clone(&self));
        let listener = TcpListener::bind(addr).await?;

        info!(app = %self.app_name, "Cascade server listening on {}", addr);
        info!("WebSocket endpoint: ws://{}{}", addr, self.config.path);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Outbound;
    use tokio::sync::mpsc;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.auth.key = Some("test-secret".into());
        config
    }

    #[tokio::test]
    async fn test_new_server_has_no_clients() {
        let server = Server::new(test_config()).unwrap();
        assert_eq!(server.clients_count(), 0);
        assert!(!server.has_client("nope"));
    }

    #[tokio::test]
    async fn test_register_unregister_client() {
        let server = Server::new(test_config()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel::<Outbound>();
        let session = Session::new(tx, None);
        let id = session.id.clone();

        server.register_client(&session);
        assert_eq!(server.clients_count(), 1);
        assert!(server.has_client(&id));

        server.unregister_client(&id);
        assert_eq!(server.clients_count(), 0);
    }

    #[tokio::test]
    async fn test_half_key_pair_is_fatal() {
        let mut config = test_config();
        config.auth.public_key = Some("-----BEGIN PUBLIC KEY-----".into());
        assert!(Server::new(config).is_err());
    }

    #[tokio::test]
    async fn test_unknown_algorithm_is_fatal() {
        let mut config = test_config();
        config.auth.algorithm = "XS999".into();
        assert!(Server::new(config).is_err());
    }

    #[tokio::test]
    async fn test_warning_reaches_event_bus() {
        let server = Server::new(test_config()).unwrap();
        let mut events = server.events();

        server.emit_warning(CascadeError::ClientPublishDisabled);
        match events.recv().await.unwrap() {
            ServerEvent::Warning { error } => {
                assert_eq!(error.name(), "ClientPublishDisabled");
            }
            other => panic!("Expected warning, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_reaches_plugin_bus_first() {
        let server = Server::new(test_config()).unwrap();
        let mut plugin = server.plugin_events();
        let mut public = server.events();

        server.notify_lifecycle(ServerEvent::Connection {
            socket_id: "s".into(),
        });

        assert!(matches!(
            plugin.recv().await.unwrap(),
            ServerEvent::Connection { .. }
        ));
        assert!(matches!(
            public.recv().await.unwrap(),
            ServerEvent::Connection { .. }
        ));
    }
}
