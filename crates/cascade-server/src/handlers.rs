//! Connection handlers.
//!
//! This module wires the upgrade path (origin check, handshake
//! middleware, WebSocket accept) and runs the per-connection loop. The
//! loop is the session's only execution context: every inbound packet
//! is handled to completion before the next is dequeued, so middleware
//! chains for distinct packets never interleave within one session.

use crate::events::ServerEvent;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::response::Responder;
use crate::server::Server;
use crate::session::{Outbound, Session, SessionState};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use cascade_core::{
    CascadeError, ChannelMessage, EmitRequest, HandshakeRequest, PublishInRequest,
    PublishOutRequest, StageOutcome, SubscribeRequest, TokenError,
};
use cascade_protocol::{
    codec, is_reserved, AuthenticateResponse, ChannelRequest, Frame, HandshakeResponse, Packet,
    PublishEnvelope, AUTHENTICATE_EVENT, FAIL_EVENT, HANDSHAKE_EVENT, PUBLISH_EVENT,
    REMOVE_AUTH_TOKEN_EVENT, SUBSCRIBE_EVENT, UNSUBSCRIBE_EVENT,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, warn};

/// Whether the connection loop should keep running after a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketFlow {
    Continue,
    Disconnect,
}

/// Build the HTTP router serving the WebSocket endpoint.
#[must_use]
pub fn router(server: Arc<Server>) -> Router {
    let path = server.config.path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(server)
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// WebSocket upgrade handler: origin check, then handshake middleware,
/// then accept.
async fn ws_handler(
    State(server): State<Arc<Server>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if let Err(error) = server.origin_policy.check(origin.as_deref()) {
        debug!(peer = %addr, origin = ?origin, "Rejected upgrade: {error}");
        metrics::record_error("origin");
        return (StatusCode::FORBIDDEN, "InvalidOrigin").into_response();
    }

    let request = HandshakeRequest {
        origin,
        path: server.config.path.clone(),
        remote_addr: Some(addr.to_string()),
    };
    if let StageOutcome::Blocked { error, .. } = server.middleware().run_handshake(&request).await {
        debug!(peer = %addr, "Upgrade blocked by handshake middleware: {error}");
        metrics::record_middleware_block("handshake");
        return (StatusCode::UNAUTHORIZED, error.name().to_string()).into_response();
    }

    let ws = if server.config.handle_protocols.is_empty() {
        ws
    } else {
        ws.protocols(server.config.handle_protocols.clone())
    };

    ws.on_upgrade(move |socket| handle_socket(socket, server, addr))
}

/// Drive one WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, server: Arc<Server>, addr: SocketAddr) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let accepted_at = Instant::now();

    let (ws_sink, mut ws_stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(ws_sink, outbound_rx));

    let mut session = Session::new(outbound_tx, Some(addr.to_string()));
    debug!(socket = %session.id, peer = %addr, "Transport accepted");

    server.notify_lifecycle(ServerEvent::Handshake {
        socket_id: session.id.clone(),
    });

    // Channel deliveries from subscription forwarders.
    let (delivery_tx, mut delivery_rx) = mpsc::unbounded_channel::<Arc<ChannelMessage>>();

    let handshake_timer = time::sleep(Duration::from_millis(server.config.ack_timeout_ms));
    tokio::pin!(handshake_timer);

    let mut ping_interval =
        time::interval(Duration::from_millis(server.config.ping_interval_ms.max(1)));
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick of a fresh interval fires immediately.
    ping_interval.tick().await;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            biased;

            () = &mut handshake_timer, if session.handshake_armed => {
                session.handshake_armed = false;
                server.emit_socket_error(
                    &session.id,
                    CascadeError::HandshakeTimeout {
                        timeout_ms: server.config.ack_timeout_ms,
                    },
                );
                // The session stays in Connecting; the keepalive loop
                // reaps the transport if the client never speaks.
            }

            Some(message) = delivery_rx.recv() => {
                deliver_publish(&server, &session, &message).await;
            }

            _ = ping_interval.tick() => {
                if last_activity.elapsed() >= Duration::from_millis(server.config.ping_timeout_ms) {
                    debug!(socket = %session.id, "Keepalive timeout");
                    break;
                }
                let _ = session.outbound.send(Outbound::Ping(Vec::new()));
            }

            message = ws_stream.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        let flow =
                            handle_text(&server, &mut session, &delivery_tx, &text, accepted_at)
                                .await;
                        if flow == PacketFlow::Disconnect {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_activity = Instant::now();
                        // Tolerate clients that frame JSON as binary.
                        match String::from_utf8(data) {
                            Ok(text) => {
                                let flow = handle_text(
                                    &server,
                                    &mut session,
                                    &delivery_tx,
                                    &text,
                                    accepted_at,
                                )
                                .await;
                                if flow == PacketFlow::Disconnect {
                                    break;
                                }
                            }
                            Err(_) => {
                                debug!(socket = %session.id, "Dropped non-UTF8 binary frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        let _ = session.outbound.send(Outbound::Pong(data));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(socket = %session.id, "Received close frame");
                        break;
                    }
                    Some(Err(error)) => {
                        debug!(socket = %session.id, error = %error, "Transport error");
                        metrics::record_error("transport");
                        break;
                    }
                    None => {
                        debug!(socket = %session.id, "Transport stream ended");
                        break;
                    }
                }
            }
        }
    }

    disconnect(&server, &mut session).await;

    // Dropping the session closes the outbound queue; the writer drains
    // what is already queued, then exits.
    drop(session);
    let _ = writer.await;
}

/// Drain the outbound queue into the WebSocket sink.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = outbound.recv().await {
        let message = match item {
            Outbound::Frame(frame) => match codec::encode(&frame) {
                Ok(text) => {
                    metrics::record_message(text.len(), "outbound");
                    Message::Text(text)
                }
                Err(error) => {
                    warn!(error = %error, "Failed to encode outbound frame");
                    continue;
                }
            },
            Outbound::Ping(data) => Message::Ping(data),
            Outbound::Pong(data) => Message::Pong(data),
        };

        if sink.send(message).await.is_err() {
            break;
        }
    }

    let _ = sink.close().await;
}

/// Decode one text frame and route it.
async fn handle_text(
    server: &Arc<Server>,
    session: &mut Session,
    delivery_tx: &mpsc::UnboundedSender<Arc<ChannelMessage>>,
    text: &str,
    accepted_at: Instant,
) -> PacketFlow {
    metrics::record_message(text.len(), "inbound");

    if text.len() > server.config.max_frame_size {
        debug!(socket = %session.id, size = text.len(), "Dropped oversized frame");
        metrics::record_error("oversize");
        return PacketFlow::Continue;
    }

    let frame = match codec::decode(text) {
        Ok(frame) => frame,
        Err(error) => {
            debug!(socket = %session.id, error = %error, "Dropped undecodable frame");
            metrics::record_error("decode");
            return PacketFlow::Continue;
        }
    };

    match frame {
        Frame::Reply(reply) => {
            // The server does not initiate correlated events.
            debug!(socket = %session.id, rid = reply.rid, "Ignoring unsolicited reply");
            PacketFlow::Continue
        }
        Frame::Packet(packet) => {
            handle_packet(server, session, delivery_tx, packet, accepted_at).await
        }
    }
}

/// Route one inbound packet after state checks.
async fn handle_packet(
    server: &Arc<Server>,
    session: &mut Session,
    delivery_tx: &mpsc::UnboundedSender<Arc<ChannelMessage>>,
    packet: Packet,
    accepted_at: Instant,
) -> PacketFlow {
    let responder = Responder::new(packet.cid, session.outbound.clone());

    if session.state == SessionState::Connecting && packet.event != HANDSHAKE_EVENT {
        debug!(socket = %session.id, event = %packet.event, "Dropped pre-handshake event");
        return PacketFlow::Continue;
    }

    match packet.event.as_str() {
        HANDSHAKE_EVENT => {
            handle_handshake(server, session, packet.data, responder, accepted_at).await
        }
        AUTHENTICATE_EVENT => {
            handle_authenticate(server, session, packet.data, responder).await;
            PacketFlow::Continue
        }
        REMOVE_AUTH_TOKEN_EVENT => {
            handle_remove_auth_token(server, session, responder);
            PacketFlow::Continue
        }
        SUBSCRIBE_EVENT => {
            handle_subscribe(server, session, delivery_tx, packet.data, responder).await;
            PacketFlow::Continue
        }
        UNSUBSCRIBE_EVENT => {
            handle_unsubscribe(server, session, packet.data, responder).await;
            PacketFlow::Continue
        }
        PUBLISH_EVENT => {
            handle_publish_in(server, session, packet.data, responder).await;
            PacketFlow::Continue
        }
        event if is_reserved(event) => {
            // Reserved events without a handler pass through untouched.
            debug!(socket = %session.id, event = %event, "Ignored reserved event");
            PacketFlow::Continue
        }
        _ => {
            handle_emit(server, session, packet, responder).await;
            PacketFlow::Continue
        }
    }
}

/// Send a reply, surfacing a double-send on the session.
fn finish(
    server: &Arc<Server>,
    socket_id: &str,
    mut responder: Responder,
    result: Result<Option<Value>, CascadeError>,
) {
    if let Err(error) = responder.respond(result) {
        server.emit_socket_error(socket_id, error);
    }
}

fn wire_value(error: &CascadeError) -> Value {
    serde_json::to_value(error.to_wire()).unwrap_or(Value::Null)
}

/// `#handshake`: verify the optional token, bind to the broker, open.
async fn handle_handshake(
    server: &Arc<Server>,
    session: &mut Session,
    data: Option<Value>,
    responder: Responder,
    accepted_at: Instant,
) -> PacketFlow {
    if session.state != SessionState::Connecting {
        // A repeated #handshake on an open session is a no-op.
        debug!(socket = %session.id, "Ignoring duplicate handshake");
        return PacketFlow::Continue;
    }

    session.handshake_armed = false;

    // Token failures are soft: the reply carries authError and the
    // session proceeds unauthenticated.
    let mut auth_error = None;
    let signed = data
        .as_ref()
        .and_then(|data| data.get("authToken"))
        .and_then(Value::as_str);
    if let Some(signed) = signed {
        match server.auth.verify_token(signed) {
            Ok(claims) => session.auth_token = Some(claims),
            Err(error) => {
                if matches!(error, TokenError::Expired) {
                    session.deauthenticate();
                }
                auth_error = Some(error.to_wire());
                server.notify_bad_auth_token(&session.id, error);
            }
        }
    }

    match server.broker.bind(&session.id).await {
        Ok(()) => {
            session.state = SessionState::Open;
            session.bound = true;
            server.register_client(session);
            metrics::record_handshake(accepted_at.elapsed().as_secs_f64());

            let response = HandshakeResponse {
                id: session.id.clone(),
                is_authenticated: session.auth_token.is_some(),
                ping_timeout: server.config.ping_timeout_ms,
                auth_error,
            };
            let data = serde_json::to_value(response).unwrap_or(Value::Null);
            finish(server, &session.id, responder, Ok(Some(data)));

            server.notify_lifecycle(ServerEvent::Connection {
                socket_id: session.id.clone(),
            });
            PacketFlow::Continue
        }
        Err(error) => {
            let bind_error = CascadeError::BrokerBindFailed {
                message: error.message.clone(),
            };
            if error.warning {
                server.emit_warning(bind_error.clone());
            } else {
                server.emit_socket_error(&session.id, bind_error.clone());
            }

            session.send_event(FAIL_EVENT, Some(wire_value(&bind_error)));
            finish(server, &session.id, responder, Err(bind_error));
            PacketFlow::Disconnect
        }
    }
}

/// `#authenticate`: re-verify a token mid-session. Failures are soft
/// and ride in the success slot of the reply.
async fn handle_authenticate(
    server: &Arc<Server>,
    session: &mut Session,
    data: Option<Value>,
    responder: Responder,
) {
    if server.config.gate_authenticate {
        let auth_token_expired_error = session.expired_token_error();
        let request = EmitRequest {
            socket: session.socket_ref(),
            event: AUTHENTICATE_EVENT.to_string(),
            data: data.clone(),
            auth_token_expired_error,
        };
        if let StageOutcome::Blocked { error, .. } = server.middleware().run_emit(&request).await {
            metrics::record_middleware_block("emit");
            finish(server, &session.id, responder, Err(error));
            return;
        }
    }

    let mut auth_error = None;
    match data.as_ref().and_then(Value::as_str) {
        Some(signed) => match server.auth.verify_token(signed) {
            Ok(claims) => session.auth_token = Some(claims),
            Err(error) => {
                if matches!(error, TokenError::Expired) {
                    session.deauthenticate();
                }
                auth_error = Some(error.to_wire());
                server.notify_bad_auth_token(&session.id, error);
            }
        },
        None => {
            let error = TokenError::Malformed("auth token must be a string".into());
            auth_error = Some(error.to_wire());
            server.notify_bad_auth_token(&session.id, error);
        }
    }

    let response = AuthenticateResponse {
        is_authenticated: session.auth_token.is_some(),
        auth_error,
    };
    let value = serde_json::to_value(response).unwrap_or(Value::Null);
    finish(server, &session.id, responder, Ok(Some(value)));
}

/// `#removeAuthToken`: clear the session's token.
fn handle_remove_auth_token(server: &Arc<Server>, session: &mut Session, responder: Responder) {
    let previous = session.deauthenticate();
    debug!(socket = %session.id, had_token = previous.is_some(), "Auth token removed");
    finish(server, &session.id, responder, Ok(None));
}

/// `#subscribe`: gate, then record the subscription with the broker.
async fn handle_subscribe(
    server: &Arc<Server>,
    session: &mut Session,
    delivery_tx: &mpsc::UnboundedSender<Arc<ChannelMessage>>,
    data: Option<Value>,
    responder: Responder,
) {
    let channel = match data.and_then(|data| serde_json::from_value::<ChannelRequest>(data).ok()) {
        Some(request) => request.into_channel(),
        None => {
            finish(
                server,
                &session.id,
                responder,
                Err("subscribe requires a channel".into()),
            );
            return;
        }
    };

    let auth_token_expired_error = session.expired_token_error();
    let request = SubscribeRequest {
        socket: session.socket_ref(),
        channel: channel.clone(),
        auth_token_expired_error,
    };

    match server.middleware().run_subscribe(&request).await {
        StageOutcome::Allowed => match server.broker.subscribe(&session.id, &channel).await {
            Ok(receiver) => {
                let forwarder = tokio::spawn(forward_channel(receiver, delivery_tx.clone()));
                if let Some(previous) = session.subscriptions.insert(channel.clone(), forwarder) {
                    previous.abort();
                }
                metrics::record_subscription();
                metrics::set_active_channels(server.broker.channel_count());
                debug!(socket = %session.id, channel = %channel, "Subscribed");
                finish(server, &session.id, responder, Ok(None));
            }
            Err(error) => {
                finish(
                    server,
                    &session.id,
                    responder,
                    Err(CascadeError::custom("BrokerError", error.message)),
                );
            }
        },
        StageOutcome::Blocked { error, .. } => {
            metrics::record_middleware_block("subscribe");
            finish(server, &session.id, responder, Err(error));
        }
    }
}

/// `#unsubscribe`: release a subscription; no middleware stage.
async fn handle_unsubscribe(
    server: &Arc<Server>,
    session: &mut Session,
    data: Option<Value>,
    responder: Responder,
) {
    let channel = match data.and_then(|data| serde_json::from_value::<ChannelRequest>(data).ok()) {
        Some(request) => request.into_channel(),
        None => {
            finish(
                server,
                &session.id,
                responder,
                Err("unsubscribe requires a channel".into()),
            );
            return;
        }
    };

    if let Some(forwarder) = session.subscriptions.remove(&channel) {
        forwarder.abort();
    }

    match server.broker.unsubscribe(&session.id, &channel).await {
        Ok(()) => {
            metrics::set_active_channels(server.broker.channel_count());
            debug!(socket = %session.id, channel = %channel, "Unsubscribed");
            finish(server, &session.id, responder, Ok(None));
        }
        Err(error) => {
            finish(
                server,
                &session.id,
                responder,
                Err(CascadeError::custom("BrokerError", error.message)),
            );
        }
    }
}

/// Inbound `#publish`: gate, then fan out through the exchange.
async fn handle_publish_in(
    server: &Arc<Server>,
    session: &mut Session,
    data: Option<Value>,
    responder: Responder,
) {
    if !server.config.allow_client_publish {
        finish(
            server,
            &session.id,
            responder,
            Err(CascadeError::ClientPublishDisabled),
        );
        return;
    }

    let envelope = match data.and_then(|data| serde_json::from_value::<PublishEnvelope>(data).ok())
    {
        Some(envelope) => envelope,
        None => {
            finish(
                server,
                &session.id,
                responder,
                Err("publish requires a channel".into()),
            );
            return;
        }
    };

    let auth_token_expired_error = session.expired_token_error();
    let request = PublishInRequest {
        socket: session.socket_ref(),
        channel: envelope.channel.clone(),
        data: envelope.data.clone(),
        auth_token_expired_error,
    };

    match server.middleware().run_publish_in(&request).await {
        StageOutcome::Allowed => {
            match server.broker.publish(&envelope.channel, envelope.data).await {
                Ok(count) => {
                    debug!(
                        socket = %session.id,
                        channel = %envelope.channel,
                        recipients = count,
                        "Published"
                    );
                    finish(server, &session.id, responder, Ok(None));
                }
                Err(error) => {
                    finish(
                        server,
                        &session.id,
                        responder,
                        Err(CascadeError::custom("BrokerError", error.message)),
                    );
                }
            }
        }
        StageOutcome::Blocked { error, .. } => {
            metrics::record_middleware_block("publishIn");
            finish(server, &session.id, responder, Err(error));
        }
    }
}

/// A non-reserved event: gate, then deliver to server listeners.
async fn handle_emit(
    server: &Arc<Server>,
    session: &mut Session,
    packet: Packet,
    responder: Responder,
) {
    let auth_token_expired_error = session.expired_token_error();
    let request = EmitRequest {
        socket: session.socket_ref(),
        event: packet.event.clone(),
        data: packet.data.clone(),
        auth_token_expired_error,
    };

    match server.middleware().run_emit(&request).await {
        StageOutcome::Allowed => {
            let responder = packet.cid.map(|_| Arc::new(Mutex::new(responder)));
            server.notify_public(ServerEvent::Received {
                socket_id: session.id.clone(),
                event: packet.event,
                data: packet.data,
                responder,
            });
        }
        StageOutcome::Blocked { error, .. } => {
            metrics::record_middleware_block("emit");
            finish(server, &session.id, responder, Err(error));
        }
    }
}

/// Outbound delivery on a subscribed channel: gate per subscriber, then
/// write; a block drops the frame for this subscriber only.
async fn deliver_publish(server: &Arc<Server>, session: &Session, message: &ChannelMessage) {
    let request = PublishOutRequest {
        socket: session.socket_ref(),
        channel: message.channel.clone(),
        data: message.data.clone(),
    };

    match server.middleware().run_publish_out(&request).await {
        StageOutcome::Allowed => {
            let envelope = PublishEnvelope {
                channel: message.channel.clone(),
                data: message.data.clone(),
            };
            let data = serde_json::to_value(envelope).unwrap_or(Value::Null);
            session.send_event(PUBLISH_EVENT, Some(data));
        }
        StageOutcome::Blocked { silent, .. } => {
            metrics::record_middleware_block("publishOut");
            debug!(
                socket = %session.id,
                channel = %message.channel,
                silent,
                "Outbound publish blocked"
            );
        }
    }
}

/// Forward broadcast deliveries into the session's delivery queue.
async fn forward_channel(
    mut receiver: broadcast::Receiver<Arc<ChannelMessage>>,
    delivery_tx: mpsc::UnboundedSender<Arc<ChannelMessage>>,
) {
    loop {
        match receiver.recv().await {
            Ok(message) => {
                if delivery_tx.send(message).is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Subscriber lagged; dropping channel messages");
            }
        }
    }
}

/// Tear the session down: exactly one broker unbind, client map removal,
/// and disconnection events.
async fn disconnect(server: &Arc<Server>, session: &mut Session) {
    if session.state == SessionState::Closed {
        return;
    }

    server.notify_plugin(ServerEvent::Disconnect {
        socket_id: session.id.clone(),
    });

    let was_open = session.state == SessionState::Open;
    session.state = SessionState::Closed;
    session.handshake_armed = false;
    session.abort_subscriptions();

    if was_open {
        server.unregister_client(&session.id);
    }

    if session.bound {
        session.bound = false;
        if let Err(error) = server.broker.unbind(&session.id).await {
            server.emit_warning(CascadeError::BrokerUnbindFailed {
                message: error.message,
            });
        }
        metrics::set_active_channels(server.broker.channel_count());
    }

    if was_open {
        server.notify_lifecycle(ServerEvent::Disconnection {
            socket_id: session.id.clone(),
        });
    }

    debug!(socket = %session.id, "Socket disconnected");
}
