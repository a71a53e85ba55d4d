//! `/sse/*` — the real-time control plane: push-stream handshake, WebSocket
//! handshake for the bidirectional-frame transport, subscription management,
//! and targeted/broadcast sends.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use notifyhub::model::{now_ms, Connection, ConnectionState, TransportKind};
use notifyhub::realtime::{Authenticator, HandshakeParams};

use crate::error::NotifyError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sse/connect", get(sse_connect))
        .route("/ws/connect", get(ws_connect))
        .route("/sse/subscribe", post(subscribe))
        .route("/sse/unsubscribe", post(unsubscribe))
        .route("/sse/send/{target}", post(send_targeted))
        .route("/sse/broadcast", post(broadcast))
        .route("/sse/stats", get(stats))
        .route("/sse/health", get(health))
}

#[derive(Debug, Clone, Deserialize)]
struct ConnectQuery {
    #[serde(rename = "organizationId")]
    organization_id: Option<String>,
    #[serde(rename = "siteId")]
    site_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

impl From<ConnectQuery> for HandshakeParams {
    fn from(q: ConnectQuery) -> Self {
        HandshakeParams {
            tenant_id: q.organization_id,
            site_id: q.site_id,
            user_id: q.user_id,
            session_id: q.session_id,
        }
    }
}

fn new_connection(params: &HandshakeParams, transport: TransportKind) -> Connection {
    let now = now_ms();
    Connection {
        id: Uuid::new_v4().to_string(),
        transport,
        tenant_id: params.tenant_id.clone().unwrap_or_default(),
        site_id: params.site_id.clone(),
        user_id: params.user_id.clone(),
        subscriptions: Default::default(),
        connected_at_ms: now,
        last_activity_ms: now,
        state: ConnectionState::Handshaking,
    }
}

/// `GET /sse/connect` — push-stream handshake. Authenticates, registers the
/// connection, and streams a `connected` frame followed by periodic pings
/// until the client disconnects or the heartbeat sweep times it out.
async fn sse_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, NotifyError> {
    let params: HandshakeParams = query.into();
    state.authenticator.authenticate(&params).map_err(|_| NotifyError::MissingTenant)?;

    let connection = new_connection(&params, TransportKind::PushStream);
    let connection_id = connection.id.clone();
    let (tx, rx) = mpsc::unbounded_channel();
    state.realtime.register(connection, tx.clone())?;

    let connected = serde_json::json!({
        "event": "connected",
        "data": {"connectionId": connection_id, "serverTime": chrono::Utc::now().to_rfc3339()},
    });
    let _ = tx.send(Arc::from(connected.to_string()));

    let ping_interval = state.config.pipeline.sse_ping_interval();
    let realtime = state.realtime.clone();
    let ping_connection_id = connection_id.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ping_interval);
        loop {
            ticker.tick().await;
            if realtime.get(&ping_connection_id).is_none() {
                break;
            }
            let ping = serde_json::json!({
                "event": "ping",
                "data": {"serverTime": chrono::Utc::now().to_rfc3339()},
            });
            if tx.send(Arc::from(ping.to_string())).is_err() {
                break;
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(|frame| Ok(frame_to_sse_event(&frame)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Frames carrying `{"event": "...", "data": ...}` map to a named SSE event;
/// anything else (ad-hoc broadcasts/targeted sends) is forwarded verbatim
/// under the generic `message` event.
fn frame_to_sse_event(frame: &str) -> Event {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(frame) {
        if let Some(event_name) = value.get("event").and_then(|v| v.as_str()) {
            let data = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
            return Event::default().event(event_name).data(data.to_string());
        }
    }
    Event::default().event("message").data(frame.to_string())
}

/// RFC 6455 "Policy Violation" — the bidirectional-frame handshake's
/// authentication-failure close code.
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// IANA-registered "Try Again Later" — sent when the connection cap is
/// already at `max_connections`.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// `GET /ws/connect` — bidirectional-frame handshake. Authentication and the
/// connection cap are both enforced only after the upgrade completes, since
/// a WebSocket handshake response can't carry an arbitrary HTTP status once
/// accepted; failures are reported as a close frame instead.
async fn ws_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let params: HandshakeParams = query.into();
    ws.on_upgrade(move |socket| handle_ws(socket, state, params))
}

async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>, params: HandshakeParams) {
    if state.authenticator.authenticate(&params).is_err() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_POLICY_VIOLATION,
                reason: "missing or invalid tenant".into(),
            })))
            .await;
        return;
    }

    let connection = new_connection(&params, TransportKind::BidirectionalFrame);
    let connection_id = connection.id.clone();
    let (tx, mut rx) = mpsc::unbounded_channel::<Arc<str>>();
    if state.realtime.register(connection, tx.clone()).is_err() {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "connection cap exceeded".into(),
            })))
            .await;
        return;
    }

    let ping = serde_json::json!({
        "type": "ping",
        "data": {"connectionId": connection_id, "serverTime": chrono::Utc::now().to_rfc3339()},
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    let _ = tx.send(Arc::from(ping.to_string()));

    let (mut ws_tx, mut ws_rx) = socket.split();
    loop {
        tokio::select! {
            outbound = rx.recv() => {
                match outbound {
                    Some(frame) => {
                        if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound_frame(&state, &connection_id, &text, &tx);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.realtime.unregister(&connection_id);
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn handle_inbound_frame(
    state: &Arc<AppState>,
    connection_id: &str,
    text: &str,
    tx: &mpsc::UnboundedSender<Arc<str>>,
) {
    let Ok(frame) = serde_json::from_str::<InboundFrame>(text) else {
        return;
    };
    match frame.kind.as_str() {
        "ping" | "pong" => state.realtime.touch_activity(connection_id),
        "subscribe" => {
            if let Some(channel) = frame.data.get("channel").and_then(|v| v.as_str()) {
                let _ = state.realtime.subscribe(connection_id, channel);
            }
        }
        "unsubscribe" => {
            if let Some(channel) = frame.data.get("channel").and_then(|v| v.as_str()) {
                let _ = state.realtime.unsubscribe(connection_id, channel);
            }
        }
        other => {
            let error = serde_json::json!({
                "type": "error",
                "data": {"message": format!("unrecognized frame type: {other}")},
                "timestamp": chrono::Utc::now().to_rfc3339(),
            });
            let _ = tx.send(Arc::from(error.to_string()));
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionRequest {
    #[serde(rename = "connectionId")]
    connection_id: String,
    channel: String,
}

async fn subscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<(), NotifyError> {
    if request.connection_id.is_empty() || request.channel.is_empty() {
        return Err(NotifyError::Validation("connectionId and channel are required".to_string()));
    }
    state.realtime.subscribe(&request.connection_id, &request.channel)?;
    Ok(())
}

async fn unsubscribe(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SubscriptionRequest>,
) -> Result<(), NotifyError> {
    if request.connection_id.is_empty() || request.channel.is_empty() {
        return Err(NotifyError::Validation("connectionId and channel are required".to_string()));
    }
    state.realtime.unsubscribe(&request.connection_id, &request.channel)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct TargetedSendRequest {
    id: String,
    message: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SentCountResponse {
    #[serde(rename = "sentCount")]
    sent_count: usize,
}

async fn send_targeted(
    State(state): State<Arc<AppState>>,
    Path(kind): Path<String>,
    Json(request): Json<TargetedSendRequest>,
) -> Result<Json<SentCountResponse>, NotifyError> {
    let frame: Arc<str> = Arc::from(request.message.to_string());
    let sent_count = match kind.as_str() {
        "organization" => state.realtime.send_to_organization(&request.id, frame),
        "site" => state.realtime.send_to_site(&request.id, frame),
        "user" => state.realtime.send_to_user(&request.id, frame),
        "channel" => state.realtime.send_to_channel(&request.id, frame),
        other => return Err(NotifyError::Validation(format!("unknown send target: {other}"))),
    };
    Ok(Json(SentCountResponse { sent_count }))
}

#[derive(Debug, Deserialize)]
struct BroadcastRequest {
    message: serde_json::Value,
}

async fn broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Json<SentCountResponse> {
    let frame: Arc<str> = Arc::from(request.message.to_string());
    let sent_count = state.realtime.broadcast(frame, |_| true);
    Json(SentCountResponse { sent_count })
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<notifyhub::realtime::RealtimeStats> {
    Json(state.realtime.stats())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    active_connections: usize,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", active_connections: state.realtime.stats().total_connections })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_connection_falls_back_to_empty_tenant_when_unauthenticated() {
        let params = HandshakeParams { tenant_id: None, site_id: None, user_id: None, session_id: None };
        let conn = new_connection(&params, TransportKind::PushStream);
        assert_eq!(conn.tenant_id, "");
        assert_eq!(conn.transport, TransportKind::PushStream);
        assert_eq!(conn.state, ConnectionState::Handshaking);
        assert!(!conn.id.is_empty());
    }

    #[test]
    fn new_connection_carries_handshake_params_through() {
        let params = HandshakeParams {
            tenant_id: Some("acme".to_string()),
            site_id: Some("site-1".to_string()),
            user_id: Some("u1".to_string()),
            session_id: None,
        };
        let conn = new_connection(&params, TransportKind::BidirectionalFrame);
        assert_eq!(conn.tenant_id, "acme");
        assert_eq!(conn.site_id.as_deref(), Some("site-1"));
        assert_eq!(conn.user_id.as_deref(), Some("u1"));
        assert_eq!(conn.transport, TransportKind::BidirectionalFrame);
    }

    #[test]
    fn inbound_frame_parses_subscribe_channel() {
        let text = r#"{"type": "subscribe", "data": {"channel": "org:acme"}}"#;
        let frame: InboundFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.kind, "subscribe");
        assert_eq!(frame.data.get("channel").and_then(|v| v.as_str()), Some("org:acme"));
    }

    #[test]
    fn inbound_frame_defaults_data_when_absent() {
        let text = r#"{"type": "ping"}"#;
        let frame: InboundFrame = serde_json::from_str(text).unwrap();
        assert_eq!(frame.kind, "ping");
        assert!(frame.data.is_null());
    }
}
