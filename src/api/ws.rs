//! WebSocket feed of task lifecycle events.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::routes::AppState;
use crate::dispatch::QueueEvent;
use crate::service::Orchestrator;

pub(crate) async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.orchestrator))
}

async fn send_event(socket: &mut WebSocket, event: &QueueEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize task event");
            true
        }
    }
}

async fn send_sync(socket: &mut WebSocket, orchestrator: &Orchestrator) -> bool {
    match orchestrator.queue().sync_event().await {
        Ok(sync) => send_event(socket, &sync).await,
        Err(e) => {
            warn!(error = %e, "Failed to build task sync");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, orchestrator: Orchestrator) {
    // Subscribe before the sync so no update falls between the two.
    let mut rx = orchestrator.subscribe();

    if !send_sync(&mut socket, &orchestrator).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }
    info!("WebSocket client connected");

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &orchestrator).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
