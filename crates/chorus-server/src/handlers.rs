//! Connection handlers for the Chorus server.
//!
//! This module handles the WebSocket connection lifecycle and translates
//! between protocol frames and hub calls.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use bytes::BytesMut;
use chorus_core::{
    ChannelSink, ConnectionId, Delivery, Error as CoreError, GroupId, Hub, MemoryStore,
    MessageKind, PresenceState, UserId,
};
use chorus_protocol::{codes, ContentKind, Frame, FrameCodec, PresenceStatus, PROTOCOL_VERSION};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout};
use tracing::{debug, error, info, warn};

type WsSender = SplitSink<WebSocket, Message>;

/// Shared server state.
pub struct AppState {
    /// The messaging core.
    pub hub: Arc<Hub>,
    /// Outbound queues, one per live connection.
    pub sink: Arc<ChannelSink>,
    /// Frame codec with the configured size limit.
    pub codec: FrameCodec,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let sink = Arc::new(ChannelSink::new(config.limits.outbound_buffer));
        let hub = Hub::with_config(
            Arc::new(config.authorizer()),
            Arc::new(MemoryStore::with_retention(config.history.retention)),
            sink.clone(),
            config.hub_config(),
        );

        Self {
            hub: Arc::new(hub),
            sink,
            codec: FrameCodec::new(config.transport.max_frame_size),
            config,
        }
    }
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }
    metrics::observe_hub(&state.hub);
    let _presence = state.hub.spawn_presence_fanout();

    let app = Router::new()
        .route(&config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Chorus server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    axum::serve(listener, app).await?;

    Ok(())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stats = state.hub.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": PROTOCOL_VERSION.to_string(),
        "connections": stats.connection_count,
        "online_users": stats.online_users,
        "groups": stats.group_count,
        "subscriptions": stats.total_subscriptions,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let (mut sender, mut receiver) = socket.split();

    let idle = Duration::from_millis(state.config.heartbeat.timeout_ms);
    let user_id = match timeout(idle, handshake(&state, &mut sender, &mut receiver)).await {
        Ok(Ok(Some(user_id))) => user_id,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            debug!(error = %e, "Handshake aborted");
            return;
        }
        Err(_) => {
            debug!("Handshake timed out");
            return;
        }
    };

    let connection_id = ConnectionId::generate();
    // Register the queue first so auto-join and presence deliveries are not lost.
    let mut outbound = state.sink.register(connection_id.clone());

    if let Err(e) = state.hub.on_connect(connection_id.clone(), user_id.clone()).await {
        warn!(connection = %connection_id, error = %e, "Connect rejected");
        let _ = send_frame(&state, &mut sender, &Frame::error(0, error_code(&e), e.to_string())).await;
        state.sink.unregister(&connection_id);
        return;
    }

    info!(connection = %connection_id, user = %user_id, "Client connected");

    let connected = Frame::connected(
        connection_id.as_str(),
        PROTOCOL_VERSION.major,
        state.config.heartbeat.interval_ms,
    );
    if send_frame(&state, &mut sender, &connected).await.is_ok() {
        run_session(&state, &connection_id, &mut sender, &mut receiver, &mut outbound, idle).await;
    }

    state.hub.on_disconnect(&connection_id);
    state.sink.unregister(&connection_id);

    info!(connection = %connection_id, user = %user_id, "Client disconnected");
}

/// Wait for the `Connect` frame and check it.
///
/// Returns `Ok(None)` if the client was refused and told so.
async fn handshake(
    state: &AppState,
    sender: &mut WsSender,
    receiver: &mut SplitStream<WebSocket>,
) -> Result<Option<UserId>> {
    let data = loop {
        match receiver.next().await {
            Some(Ok(Message::Binary(data))) => break data,
            Some(Ok(Message::Ping(data))) => sender.send(Message::Pong(data)).await?,
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    };
    metrics::record_frame(data.len(), "inbound");

    let refusal = match state.codec.decode(&data) {
        Ok(Frame::Connect { version, user, .. }) => {
            if PROTOCOL_VERSION.negotiate(version).is_none() {
                Frame::error(
                    0,
                    codes::UNSUPPORTED_VERSION,
                    format!("Unsupported protocol version {}, server speaks {}", version, PROTOCOL_VERSION),
                )
            } else if user.is_empty() {
                Frame::error(0, codes::BAD_FRAME, "Connect requires a user")
            } else if state.hub.registry().stats().connection_count
                >= state.config.limits.max_connections
            {
                Frame::error(0, codes::TOO_MANY_CONNECTIONS, "Server is full")
            } else {
                return Ok(Some(UserId::new(user)));
            }
        }
        Ok(other) => Frame::error(
            0,
            codes::HANDSHAKE_REQUIRED,
            format!("Expected connect, got {:?}", other.frame_type()),
        ),
        Err(e) => Frame::error(0, codes::BAD_FRAME, e.to_string()),
    };

    metrics::record_error("handshake");
    send_frame(state, sender, &refusal).await?;
    Ok(None)
}

/// Pump frames in both directions until the socket closes or idles out.
async fn run_session(
    state: &AppState,
    connection_id: &ConnectionId,
    sender: &mut WsSender,
    receiver: &mut SplitStream<WebSocket>,
    outbound: &mut mpsc::Receiver<Delivery>,
    idle: Duration,
) {
    let mut read_buffer = BytesMut::with_capacity(4096);
    let mut deadline = tokio::time::Instant::now() + idle;

    loop {
        tokio::select! {
            biased;

            delivery = outbound.recv() => {
                let Some(delivery) = delivery else {
                    break;
                };
                if send_frame(state, sender, &delivery_frame(&delivery)).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                deadline = tokio::time::Instant::now() + idle;
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let start = Instant::now();
                        read_buffer.extend_from_slice(&data);

                        match drain_frames(state, connection_id, sender, &mut read_buffer).await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                debug!(connection = %connection_id, error = %e, "Send failed");
                                break;
                            }
                        }

                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        let frame = Frame::error(0, codes::BAD_FRAME, "Text messages are not supported");
                        if send_frame(state, sender, &frame).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection = %connection_id, "Received close frame");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection = %connection_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break;
                    }
                    None => {
                        debug!(connection = %connection_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            () = sleep_until(deadline) => {
                info!(connection = %connection_id, "Heartbeat timeout");
                metrics::record_error("timeout");
                break;
            }
        }
    }
}

/// Decode and handle every complete frame in the buffer.
///
/// Returns `Ok(false)` if the stream is corrupt and the connection must close.
async fn drain_frames(
    state: &AppState,
    connection_id: &ConnectionId,
    sender: &mut WsSender,
    read_buffer: &mut BytesMut,
) -> Result<bool> {
    loop {
        match state.codec.decode_from(read_buffer) {
            Ok(Some(frame)) => {
                handle_frame(frame, connection_id, state, sender).await?;
            }
            Ok(None) => return Ok(true),
            Err(e) => {
                warn!(connection = %connection_id, error = %e, "Undecodable frame");
                metrics::record_error("decode");
                send_frame(state, sender, &Frame::error(0, codes::BAD_FRAME, e.to_string())).await?;
                return Ok(false);
            }
        }
    }
}

/// Handle a decoded frame.
async fn handle_frame(
    frame: Frame,
    connection_id: &ConnectionId,
    state: &AppState,
    sender: &mut WsSender,
) -> Result<()> {
    let hub = &state.hub;

    match frame {
        Frame::Join { id, group } => {
            debug!(connection = %connection_id, group = %group, "Join request");
            let response = match hub.on_join(connection_id, &GroupId::new(group)).await {
                Ok(_) => Frame::ack(id),
                Err(e) => error_frame(id, connection_id, &e),
            };
            send_frame(state, sender, &response).await?;
        }

        Frame::Leave { id, group } => {
            debug!(connection = %connection_id, group = %group, "Leave request");
            hub.on_leave(connection_id, &GroupId::new(group));
            send_frame(state, sender, &Frame::ack(id)).await?;
        }

        Frame::Send {
            id,
            group,
            content,
            kind,
        } => {
            let kind = message_kind(kind.unwrap_or_default());
            let response = match hub
                .on_client_message_of_kind(connection_id, &GroupId::new(group), kind, content)
                .await
            {
                Ok(receipt) => Frame::sent(id, receipt.id, receipt.sequence),
                Err(e) => error_frame(id, connection_id, &e),
            };
            send_frame(state, sender, &response).await?;
        }

        Frame::Typing { group, active, .. } => {
            if let Err(e) = hub.on_typing(connection_id, &GroupId::new(group), active) {
                send_frame(state, sender, &error_frame(0, connection_id, &e)).await?;
            }
        }

        Frame::Read { group, sequence, .. } => {
            if let Err(e) = hub.on_read(connection_id, &GroupId::new(group), sequence) {
                send_frame(state, sender, &error_frame(0, connection_id, &e)).await?;
            }
        }

        Frame::History { id, group, since } => {
            match hub.history(connection_id, &GroupId::new(group), since).await {
                Ok(messages) => {
                    debug!(connection = %connection_id, count = messages.len(), "History replay");
                    for message in messages {
                        let frame = delivery_frame(&Delivery::Message(Arc::new(message)));
                        send_frame(state, sender, &frame).await?;
                    }
                    send_frame(state, sender, &Frame::ack(id)).await?;
                }
                Err(e) => send_frame(state, sender, &error_frame(id, connection_id, &e)).await?,
            }
        }

        Frame::Ping { timestamp } => {
            send_frame(state, sender, &Frame::pong(timestamp)).await?;
        }

        Frame::Pong { .. } => {}

        other => {
            warn!(connection = %connection_id, frame_type = ?other.frame_type(), "Unexpected frame type");
            let response = Frame::error(
                other.request_id().unwrap_or(0),
                codes::BAD_FRAME,
                format!("Unexpected {:?} frame", other.frame_type()),
            );
            send_frame(state, sender, &response).await?;
        }
    }

    Ok(())
}

/// Translate a core delivery into the frame sent to the client.
fn delivery_frame(delivery: &Delivery) -> Frame {
    match delivery {
        Delivery::Message(message) => Frame::Message {
            message_id: message.id,
            group: message.group.to_string(),
            sender: message.sender.to_string(),
            sequence: message.sequence,
            kind: content_kind(message.kind),
            content: message.content.clone(),
            timestamp: message.timestamp,
        },
        Delivery::Presence { group, event } => Frame::Presence {
            group: group.to_string(),
            user: event.user_id.to_string(),
            state: match event.state {
                PresenceState::Online => PresenceStatus::Online,
                PresenceState::Offline => PresenceStatus::Offline,
            },
            timestamp: event.timestamp,
        },
        Delivery::Typing {
            group,
            user,
            active,
        } => Frame::Typing {
            group: group.to_string(),
            user: Some(user.to_string()),
            active: *active,
        },
        Delivery::Read {
            group,
            user,
            sequence,
        } => Frame::Read {
            group: group.to_string(),
            user: Some(user.to_string()),
            sequence: *sequence,
        },
    }
}

fn content_kind(kind: MessageKind) -> ContentKind {
    match kind {
        MessageKind::Text => ContentKind::Text,
        MessageKind::Image => ContentKind::Image,
        MessageKind::File => ContentKind::File,
        MessageKind::System => ContentKind::System,
    }
}

fn message_kind(kind: ContentKind) -> MessageKind {
    match kind {
        ContentKind::Text => MessageKind::Text,
        ContentKind::Image => MessageKind::Image,
        ContentKind::File => MessageKind::File,
        ContentKind::System => MessageKind::System,
    }
}

/// Protocol error code for a core error.
fn error_code(error: &CoreError) -> u16 {
    match error {
        CoreError::NotAuthorized { .. } => codes::NOT_AUTHORIZED,
        CoreError::DuplicateConnection(_) => codes::DUPLICATE_CONNECTION,
        CoreError::UnknownConnection(_) => codes::INTERNAL,
        CoreError::NotSubscribed { .. } => codes::NOT_SUBSCRIBED,
        CoreError::InvalidGroup(_) => codes::INVALID_GROUP,
        CoreError::MaxGroupsReached(_) => codes::TOO_MANY_GROUPS,
        CoreError::ContentTooLarge { .. } => codes::CONTENT_TOO_LARGE,
        CoreError::UnknownSequence { .. } | CoreError::ReservedKind(_) => codes::BAD_FRAME,
        CoreError::Authorization(_) | CoreError::Store(_) => codes::UNAVAILABLE,
    }
}

fn error_frame(id: u64, connection_id: &ConnectionId, error: &CoreError) -> Frame {
    debug!(connection = %connection_id, request = id, error = %error, "Request failed");
    metrics::record_error("request");
    Frame::error(id, error_code(error), error.to_string())
}

/// Send a frame to the WebSocket.
async fn send_frame(state: &AppState, sender: &mut WsSender, frame: &Frame) -> Result<()> {
    let data = state.codec.encode(frame)?;
    metrics::record_frame(data.len(), "outbound");
    sender.send(Message::Binary(data.to_vec())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_core::{Message as ChatMessage, PresenceEvent};
    use chorus_core::message::now_millis;

    #[test]
    fn test_error_codes() {
        let err = CoreError::NotAuthorized {
            group: "g".into(),
            user: "u".into(),
        };
        assert_eq!(error_code(&err), codes::NOT_AUTHORIZED);
        assert_eq!(
            error_code(&CoreError::ContentTooLarge { size: 2, limit: 1 }),
            codes::CONTENT_TOO_LARGE
        );
        assert_eq!(error_code(&CoreError::InvalidGroup("empty")), codes::INVALID_GROUP);
        assert_eq!(
            error_code(&CoreError::ReservedKind(MessageKind::System)),
            codes::BAD_FRAME
        );
    }

    #[test]
    fn test_message_delivery_frame() {
        let message = ChatMessage::new("lobby", "alice", "hi").with_kind(MessageKind::File);
        match delivery_frame(&Delivery::Message(Arc::new(message))) {
            Frame::Message {
                group, sender, kind, content, ..
            } => {
                assert_eq!(group, "lobby");
                assert_eq!(sender, "alice");
                assert_eq!(kind, ContentKind::File);
                assert_eq!(content, "hi");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_presence_delivery_frame() {
        let delivery = Delivery::Presence {
            group: "lobby".into(),
            event: PresenceEvent {
                user_id: "bob".into(),
                state: PresenceState::Offline,
                timestamp: now_millis(),
            },
        };
        match delivery_frame(&delivery) {
            Frame::Presence { user, state, .. } => {
                assert_eq!(user, "bob");
                assert_eq!(state, PresenceStatus::Offline);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_read_delivery_frame() {
        let delivery = Delivery::Read {
            group: "g1".into(),
            user: "carol".into(),
            sequence: 9,
        };
        assert_eq!(
            delivery_frame(&delivery),
            Frame::Read {
                group: "g1".into(),
                user: Some("carol".into()),
                sequence: 9,
            }
        );
        assert_eq!(
            error_code(&CoreError::UnknownSequence {
                group: "g1".into(),
                sequence: 10,
            }),
            codes::BAD_FRAME
        );
    }

    #[test]
    fn test_kind_mapping_is_symmetric() {
        for kind in [
            MessageKind::Text,
            MessageKind::Image,
            MessageKind::File,
            MessageKind::System,
        ] {
            assert_eq!(message_kind(content_kind(kind)), kind);
        }
    }
}
