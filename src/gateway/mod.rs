//! WebSocket gateway: client upgrades, framing, and dispatch.
//!
//! Hosts the canonical assistant path `GET /ws/redi` and the screen-share
//! signaling plane `GET /ws/screen`. Each accepted socket is split; a
//! writer task drains a per-device outbound channel so slow clients never
//! block session fan-out. JSON control frames and raw binary audio frames
//! are both accepted on the assistant path. A panic in one connection's
//! task is confined to that task.

pub mod messages;

use crate::screenshare::{
    JoinError, PeerRole, ScreenClientMessage, ScreenServerMessage, SignalingRegistry,
    SIGNAL_CHANNEL_SIZE,
};
use crate::session::orchestrator::{self, SessionDeps};
use crate::session::registry::{SessionEvent, OUTBOUND_CHANNEL_SIZE};
use crate::session::EndReason;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use messages::{ClientMessage, Outbound, ServerMessage};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Close codes surfaced to clients.
const CLOSE_MISSING_DEVICE: u16 = 4001;
const CLOSE_INVALID_SESSION: u16 = 4002;
const CLOSE_NO_CREDITS: u16 = 4003;
const CLOSE_SESSION_ID_REQUIRED: u16 = 1008;
const CLOSE_PROVIDER_FAILURE: u16 = 1011;
const CLOSE_NORMAL: u16 = 1000;

/// Shared gateway state.
#[derive(Clone)]
pub struct GatewayState {
    pub deps: SessionDeps,
    pub signaling: Arc<SignalingRegistry>,
    /// Root token; session tasks run under child tokens of this.
    pub shutdown: CancellationToken,
}

/// Build the gateway router.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/redi", get(assistant_ws))
        .route("/ws/screen", get(screen_ws))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssistantQuery {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    join_code: Option<String>,
    #[serde(default)]
    token: Option<String>,
    /// Compatibility mode: deliver audio as base64 JSON messages instead
    /// of raw binary frames.
    #[serde(default)]
    b64_audio: bool,
}

async fn assistant_ws(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    Query(query): Query<AssistantQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_assistant(socket, state, query))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

fn close_code_for(reason: EndReason) -> u16 {
    match reason {
        EndReason::ProviderSetupFailed => CLOSE_PROVIDER_FAILURE,
        EndReason::CreditsExhausted => CLOSE_NO_CREDITS,
        _ => CLOSE_NORMAL,
    }
}

async fn handle_assistant(socket: WebSocket, state: GatewayState, query: AssistantQuery) {
    let Some(device_id) = query.device_id.filter(|d| !d.trim().is_empty()) else {
        close_with(socket, CLOSE_MISSING_DEVICE, "Missing deviceId").await;
        return;
    };
    if query.session_id.as_deref() == Some("") {
        close_with(socket, CLOSE_SESSION_ID_REQUIRED, "sessionId required").await;
        return;
    }

    // Sessions cannot run without transcription and at least one brain;
    // refuse early with 1011 instead of racing the orchestrator's
    // setup-failure teardown.
    if state.deps.providers.stt.is_none() || !state.deps.providers.has_brain() {
        close_with(socket, CLOSE_PROVIDER_FAILURE, "required provider unavailable").await;
        return;
    }

    let registry = state.deps.registry.clone();

    // Resolve the target session: join-by-code for guests, reconnect by
    // id, create-on-first-connect for a fresh host.
    let session_id = if let Some(code) = query.join_code.as_deref() {
        match registry.resolve_join_code(code) {
            Ok(id) => id,
            Err(_) => {
                close_with(socket, CLOSE_INVALID_SESSION, "Invalid session").await;
                return;
            }
        }
    } else if let Some(id) = query.session_id.clone() {
        if !registry.exists(&id) {
            close_with(socket, CLOSE_INVALID_SESSION, "Invalid session").await;
            return;
        }
        id
    } else {
        let created = registry.create(
            &device_id,
            state.deps.config.tts.default_voice.clone(),
            state.deps.config.session.default_duration_secs,
            query.token.clone(),
            None,
        );
        let session_cancel = state.shutdown.child_token();
        orchestrator::spawn(
            state.deps.clone(),
            created.session_id.clone(),
            created.events,
            session_cancel,
        );
        created.session_id
    };

    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_CHANNEL_SIZE);
    if registry
        .attach_device(&session_id, &device_id, outbound_tx)
        .is_err()
    {
        close_with(socket, CLOSE_INVALID_SESSION, "Invalid session").await;
        return;
    }
    let Some(ingress) = registry.ingress(&session_id) else {
        close_with(socket, CLOSE_INVALID_SESSION, "Invalid session").await;
        return;
    };

    info!(session = %session_id, device = %device_id, "device connected");

    let (ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(run_writer(ws_tx, outbound_rx, query.b64_audio));

    // Reader loop: tag every ingress item with the device before merging
    // into the session's event stream.
    while let Some(frame) = ws_rx.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                debug!(device = %device_id, "socket error: {e}");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => {
                    if ingress
                        .send(SessionEvent::Client {
                            device_id: device_id.clone(),
                            message,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => debug!(device = %device_id, "unparseable control message: {e}"),
            },
            Message::Binary(data) => {
                if ingress
                    .send(SessionEvent::BinaryAudio {
                        device_id: device_id.clone(),
                        data: bytes::Bytes::from(data),
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    registry.detach_device(&session_id, &device_id);
    // Let the writer drain what it has; it ends when the outbound channel
    // closes or the socket drops.
    let _ = writer.await;
    info!(session = %session_id, device = %device_id, "device disconnected");
}

/// Writer task: serialize outbound items onto the socket. Ends when the
/// outbound channel closes or a send fails; emits the mapped close code
/// when the session ends.
async fn run_writer(
    mut ws_tx: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    b64_audio: bool,
) {
    use base64::Engine as _;

    while let Some(item) = outbound_rx.recv().await {
        let result = match item {
            Outbound::Message(message) => {
                let close_code = match &message {
                    ServerMessage::SessionEnd { reason } => Some(close_code_for(*reason)),
                    _ => None,
                };
                let raw = match serde_json::to_string(&message) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!("unserializable server message: {e}");
                        continue;
                    }
                };
                let sent = ws_tx.send(Message::Text(raw.into())).await;
                if let Some(code) = close_code {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "session ended".into(),
                        })))
                        .await;
                    break;
                }
                sent
            }
            Outbound::AudioFrame(bytes) => {
                if b64_audio {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    let message = ServerMessage::Audio { data: encoded };
                    match serde_json::to_string(&message) {
                        Ok(raw) => ws_tx.send(Message::Text(raw.into())).await,
                        Err(_) => continue,
                    }
                } else {
                    ws_tx.send(Message::Binary(bytes.to_vec().into())).await
                }
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn screen_ws(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    ws.on_upgrade(move |socket| handle_screen(socket, state, addr))
}

/// Screen-share signaling connection: one socket is either the phone
/// (registers, approves) or the computer (joins by code).
async fn handle_screen(socket: WebSocket, state: GatewayState, addr: SocketAddr) {
    let signaling = state.signaling.clone();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ScreenServerMessage>(SIGNAL_CHANNEL_SIZE);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let Ok(raw) = serde_json::to_string(&message) else {
                continue;
            };
            if ws_tx.send(Message::Text(raw.into())).await.is_err() {
                break;
            }
        }
    });

    let mut role: Option<(PeerRole, String)> = None;

    while let Some(Ok(frame)) = ws_rx.next().await {
        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = serde_json::from_str::<ScreenClientMessage>(&text) else {
            debug!("unparseable signaling message");
            continue;
        };
        match message {
            ScreenClientMessage::Register => {
                signaling.purge_expired();
                let code = signaling.register_phone(tx.clone());
                role = Some((PeerRole::Phone, code.clone()));
                let _ = tx.send(ScreenServerMessage::Code { code }).await;
            }
            ScreenClientMessage::Join { code } => {
                match signaling.join_computer(addr.ip(), &code, tx.clone()) {
                    Ok(()) => {
                        role = Some((PeerRole::Computer, code.trim().to_ascii_uppercase()));
                    }
                    Err(JoinError::RateLimited { retry_after_secs }) => {
                        let _ = tx
                            .send(ScreenServerMessage::Error {
                                message: format!(
                                    "too many attempts; retry in {retry_after_secs}s"
                                ),
                            })
                            .await;
                    }
                    Err(_) => {
                        let _ = tx
                            .send(ScreenServerMessage::Error {
                                message: "invalid or expired code".into(),
                            })
                            .await;
                    }
                }
            }
            ScreenClientMessage::Approve { approved } => {
                if let Some((PeerRole::Phone, code)) = &role {
                    signaling.approve(code, approved);
                }
            }
            ScreenClientMessage::Signal { payload } => {
                if let Some((peer_role, code)) = &role {
                    if !signaling.relay_signal(code, *peer_role, payload) {
                        let _ = tx
                            .send(ScreenServerMessage::Error {
                                message: "relay unavailable".into(),
                            })
                            .await;
                    }
                }
            }
        }
    }

    if let Some((peer_role, code)) = role {
        signaling.disconnect(&code, peer_role);
    }
    writer.abort();
}
