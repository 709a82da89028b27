//! WebSocket upgrade handler
//!
//! Validates the token, registers a [`ClientConnection`] with the hub and runs its
//! read loop and socket writer until either side ends.
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::StreamExt;
use serde::Deserialize;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::client::ClientConnection;
use super::hub::ConnectionHub;
use super::protocol::ClientMessage;
use crate::auth::middleware::AuthConfig;

#[derive(Deserialize)]
pub struct WebSocketQuery {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user: Option<String>,
}

#[derive(Clone)]
pub struct WebSocketState {
    pub hub: Arc<ConnectionHub>,
    pub auth: Arc<AuthConfig>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WebSocketQuery>,
    State(state): State<WebSocketState>,
) -> Response {
    if !state.auth.accepts(query.token.as_deref()) {
        tracing::warn!("rejected websocket upgrade with invalid token");
        return (StatusCode::UNAUTHORIZED, "Invalid or missing token").into_response();
    }

    let user_id = query.user.unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state.hub))
}

async fn handle_socket(socket: WebSocket, user_id: String, hub: Arc<ConnectionHub>) {
    let fd = format!("fd:{}", uuid::Uuid::new_v4());
    let (client, outbound) = ClientConnection::new(fd.clone(), user_id);
    let (sender, receiver) = socket.split();

    hub.join(client.clone());

    let writer_client = client.clone();
    let writer_hub = hub.clone();
    let writer = tokio::spawn(async move {
        let frames = UnboundedReceiverStream::new(outbound)
            .map(|message: ClientMessage| Ok::<_, axum::Error>(Message::Text(message.to_json())));
        tokio::select! {
            _ = writer_client.cancelled() => {}
            result = frames.forward(sender) => {
                if let Err(e) = result {
                    tracing::info!(fd = %writer_client.fd(), "socket write failed: {}", e);
                }
                writer_hub.leave(writer_client.fd());
            }
        }
    });

    client.read_loop(receiver, &hub).await;
    hub.leave(&fd);

    if let Err(e) = writer.await {
        tracing::debug!(fd = %fd, "writer task ended abnormally: {}", e);
    }
    tracing::info!(fd = %fd, "websocket disconnected");
}
