//! WebSocket endpoint.
//!
//! The bearer credential is checked before the upgrade, so a rejected
//! endpoint never gets a socket and is never registered. A handshake that
//! loses the race for the last slot is closed with code 1013. After the upgrade
//! the socket is split: a writer task drains the connection's outbound queue
//! and the read loop feeds text frames to the session.

use crate::auth::extract_bearer;
use crate::error::AuthError;
use crate::server::Relay;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tether_types::{Frame, Identity};
use tokio::sync::mpsc;

/// Query parameters accepted on upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Bearer credential for clients that cannot set headers.
    #[serde(default)]
    pub token: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    Extension(relay): Extension<Arc<Relay>>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let identity = match authenticate(&relay, &headers, params.token.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => return reject(e),
    };
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };

    let max_message_size = relay.config().limits.max_frame_bytes;
    upgrade
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, relay, identity))
}

async fn authenticate(
    relay: &Relay,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Identity, AuthError> {
    let token = match extract_bearer(headers, query_token) {
        Ok(token) => token,
        Err(e) => {
            tracing::debug!("Upgrade without usable credential: {}", e);
            return Err(e);
        }
    };
    relay.authenticate(&token).await
}

fn reject(error: AuthError) -> Response {
    let status = match error {
        AuthError::Refused(_) => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::MissingCredential
        | AuthError::InvalidCredential
        | AuthError::IdentityRejected(_) => StatusCode::UNAUTHORIZED,
    };
    (status, error.to_string()).into_response()
}

async fn handle_socket(mut socket: WebSocket, relay: Arc<Relay>, identity: Identity) {
    let (session, rx) = match relay.open_session(identity) {
        Ok(opened) => opened,
        Err(e) => {
            let _ = socket.send(Message::Close(Some(refusal_frame(&e)))).await;
            return;
        }
    };
    let (ws_sender, mut ws_receiver) = socket.split();
    let writer = tokio::spawn(write_frames(ws_sender, rx));

    while let Some(message) = ws_receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(connection_id = %session.id(), "WebSocket read error: {}", e);
                break;
            }
        };
        match message {
            Message::Text(text) => {
                if let Err(e) = session.handle_text(&text).await {
                    tracing::warn!(connection_id = %session.id(), "Dropped inbound event: {}", e);
                }
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::debug!(connection_id = %session.id(), "Ignoring binary frame");
            }
            // Ping/pong are answered by the protocol layer.
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    writer.abort();
    session.close().await;
}

/// Close frame for a connection refused after the upgrade.
fn refusal_frame(error: &AuthError) -> CloseFrame<'static> {
    CloseFrame {
        code: close_code::AGAIN,
        reason: error.to_string().into(),
    }
}

async fn write_frames(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<Frame>>,
) {
    while let Some(frame) = rx.recv().await {
        let text = match frame.to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(event = %frame.event, "Failed to encode frame: {}", e);
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
