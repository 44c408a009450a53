//! HTTP and WebSocket handlers
//!
//! Event endpoints acknowledge with 204 — the extension does not wait on
//! classification. The observer socket performs a register handshake, then
//! pumps the fan-out queue outward and dispatches inbound commands.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::events::{DomEvent, RequestEvent, TabEvent};
use crate::fanout::{InboundMessage, OutboundMessage, UpdateAction};

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn request_event(
    State(state): State<AppState>,
    Json(event): Json<RequestEvent>,
) -> StatusCode {
    state.ingestor.on_request(event).await;
    StatusCode::NO_CONTENT
}

pub async fn dom_event(State(state): State<AppState>, Json(event): Json<DomEvent>) -> StatusCode {
    state.ingestor.on_dom(event).await;
    StatusCode::NO_CONTENT
}

pub async fn tab_event(State(state): State<AppState>, Json(event): Json<TabEvent>) -> StatusCode {
    state.ingestor.on_tab(event).await;
    StatusCode::NO_CONTENT
}

pub async fn observer_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_observer(socket, state))
}

async fn handle_observer(mut socket: WebSocket, state: AppState) {
    // The first frame must be `register`; anything else closes the socket.
    let (tab_id, url) = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(InboundMessage::Register { tab_id, url }) => break (tab_id, url),
                    Ok(other) => {
                        warn!("observer sent {other:?} before register");
                        return;
                    }
                    Err(e) => {
                        warn!("unparseable register frame: {e}");
                        return;
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!("observer socket error before register: {e}");
                return;
            }
        }
    };

    let port_id = Uuid::new_v4().to_string();
    let mut outbound = state.fanout.register(&port_id, tab_id, url).await;
    info!("observer {port_id} attached (tab {tab_id:?})");

    send_initial_state(&state, &port_id, tab_id).await;

    loop {
        tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => {
                    let Ok(text) = serde_json::to_string(&message) else {
                        continue;
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                // Evicted from the registry; close our side too.
                None => break,
            },
            frame = socket.recv() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<InboundMessage>(&text) {
                        Ok(message) => state.handle_message(&port_id, message).await,
                        Err(e) => warn!("unparseable observer frame: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("observer socket error: {e}");
                    break;
                }
            }
        }
    }

    state.fanout.unregister(&port_id).await;
    info!("observer {port_id} detached");
}

/// Catch a fresh observer up: helper state, settings, the tab's visible
/// streams, and whatever downloads are active or restored.
async fn send_initial_state(state: &AppState, port_id: &str, tab_id: Option<crate::models::TabId>) {
    let connected = *state.helper.connection_state().borrow();
    state
        .fanout
        .send_to(
            port_id,
            OutboundMessage::NativeHostConnectionState { connected },
        )
        .await;

    let settings = state.settings.read().await.clone();
    state
        .fanout
        .send_to(port_id, OutboundMessage::SettingsState { settings })
        .await;

    if let Some(tab_id) = tab_id {
        let videos = state.registry.visible_streams(tab_id).await;
        state
            .fanout
            .send_to(
                port_id,
                OutboundMessage::VideosStateUpdate {
                    action: UpdateAction::FullRefresh,
                    tab_id,
                    video_url: None,
                    video: None,
                    videos: Some(videos),
                },
            )
            .await;
    }

    let downloads = state.downloads.active_downloads().await;
    let history = state.downloads.history_entries().await;
    state
        .fanout
        .send_to(
            port_id,
            OutboundMessage::ActiveDownloadsData { downloads, history },
        )
        .await;
}
