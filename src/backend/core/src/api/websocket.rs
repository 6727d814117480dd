//! WebSocket transport: one [`Connection`](crate::messenger::Connection) per socket.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::AppState;

/// Query parameters for WebSocket upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct WsQueryParams {
    /// Bind on first read. Defaults to `messenger.live_by_default`.
    pub live: Option<bool>,
}

/// Handle WebSocket upgrade.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQueryParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let max_message_size = state.messenger.config().max_message_size;
    ws.max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, params, state))
}

/// Handle an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, params: WsQueryParams, state: AppState) {
    let messenger = Arc::clone(&state.messenger);
    let live = params.live.unwrap_or(messenger.config().live_by_default);

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (connection, mut rx) = messenger.open_connection(live);
    let conn_id = connection.id();
    info!(connection_id = %conn_id, live, "WebSocket connection opened");

    // Outbound: replies and pushes queued on the connection, until the
    // connection is closed (e.g. for lagging behind its pushes)
    let outbound = connection.clone();
    let mut forward_handle = tokio::spawn(async move {
        loop {
            let response = tokio::select! {
                response = rx.recv() => match response {
                    Some(response) => response,
                    None => break,
                },
                _ = outbound.closed() => break,
            };
            match serde_json::to_string(&response) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!(error = %e, "Failed to encode response"),
            }
        }
    });

    // Inbound: one worker handles this socket's frames in order, so the
    // read loop keeps draining the socket while a request waits on the
    // database.
    let (frame_tx, frame_rx) = mpsc::channel::<String>(messenger.config().outbound_buffer);
    {
        let messenger = Arc::clone(&messenger);
        let connection = connection.clone();
        tokio::spawn(async move { messenger.serve(&connection, frame_rx).await });
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(connection_id = %conn_id, "Ignoring non UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) => {
                        info!(connection_id = %conn_id, "Client requested close");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %conn_id, error = %e, "WebSocket error");
                        break;
                    }
                    None => {
                        debug!(connection_id = %conn_id, "WebSocket stream ended");
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                if frame_tx.send(text).await.is_err() {
                    break;
                }
            }

            _ = &mut forward_handle => {
                debug!(connection_id = %conn_id, "Outbound stream closed");
                break;
            }
        }
    }

    // In-flight requests run to completion; their replies are dropped.
    drop(frame_tx);
    messenger.close_connection(&connection);
    forward_handle.abort();
    info!(connection_id = %conn_id, "WebSocket connection closed");
}
