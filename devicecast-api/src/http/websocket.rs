//! Metadata channel over WebSocket
//!
//! Every published event is forwarded as a JSON text frame `{event, data}`.
//! Slow clients skip events they lagged behind on instead of stalling the
//! broadcaster.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::http::AppState;

/// Path: `GET /ws/metadata`
pub async fn metadata_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let mut events = state.events.subscribe();
    let (mut sender, mut receiver) = socket.split();

    info!(
        subscribers = state.events.subscriber_count(),
        "Metadata subscriber connected"
    );

    loop {
        tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                // Ignore text, binary, ping and pong from clients
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "Failed to serialize event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Metadata subscriber lagging, events skipped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    let _ = sender.close().await;
    info!("Metadata subscriber disconnected");
}
