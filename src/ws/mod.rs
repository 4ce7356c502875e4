pub mod handlers;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::{extract_token, Identity};
use crate::broadcast::{encode, Frame};
use crate::error::RaceError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

use handlers::Session;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Identity is resolved before the upgrade so
/// the socket task knows who it serves from the first frame.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let identity = authenticate(&state, params.token.as_deref(), &headers).await;

    match &identity {
        Ok(id) => tracing::info!(user_id = %id.user_id, "WebSocket connection request"),
        Err(e) => tracing::warn!("WebSocket connection without valid identity: {}", e),
    }

    ws.on_upgrade(move |socket| handle_socket(socket, identity, state))
}

/// Who is asking, from the `token` query parameter or a Bearer header
pub async fn authenticate(
    state: &AppState,
    query_token: Option<&str>,
    headers: &HeaderMap,
) -> Result<Identity, RaceError> {
    match extract_token(query_token, headers) {
        Some(token) => state.resolver.resolve(&token).await,
        None => Err(RaceError::Unauthorized),
    }
}

/// Frames sent to a socket that may not stay: the error, then a policy close
fn rejection(err: &RaceError) -> Vec<Message> {
    let mut frames = Vec::with_capacity(2);
    if let Some(frame) = encode(&ServerMessage::from(err)) {
        frames.push(Message::Text(frame));
    }
    frames.push(Message::Close(Some(CloseFrame {
        code: close_code::POLICY,
        reason: err.to_string().into(),
    })));
    frames
}

async fn reject(mut socket: WebSocket, err: RaceError) {
    for frame in rejection(&err) {
        if socket.send(frame).await.is_err() {
            break;
        }
    }
}

async fn next_frame(outbound: &mut Option<mpsc::Receiver<Frame>>) -> Option<Frame> {
    match outbound {
        Some(rx) => rx.recv().await,
        // Not bound to a room yet: wait forever
        None => std::future::pending().await,
    }
}

/// Handle individual WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    identity: Result<Identity, RaceError>,
    state: Arc<AppState>,
) {
    let identity = match identity {
        Ok(identity) => identity,
        Err(e) => return reject(socket, e).await,
    };

    let mut session = Session::new(identity, state);
    let (mut sender, mut receiver) = socket.split();
    let mut outbound: Option<mpsc::Receiver<Frame>> = None;

    tracing::info!(
        conn_id = %session.conn_id(),
        user_id = %session.identity().user_id,
        "WebSocket connected"
    );

    loop {
        tokio::select! {
            // Snapshots pushed by the room
            frame = next_frame(&mut outbound) => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // The room dropped our queue: evicted as too slow, or the room is gone
                        tracing::warn!(conn_id = %session.conn_id(), "Outbound queue closed by room");
                        break;
                    }
                }
            }

            // Handle client messages
            ws_msg = receiver.next() => {
                match ws_msg {
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!("Received message: {}", text);

                        let response = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(client_msg) => session.handle_message(client_msg).await,
                            Err(e) => {
                                tracing::warn!("Failed to parse client message: {}", e);
                                Some(ServerMessage::parse_error(&e))
                            }
                        };

                        if outbound.is_none() {
                            outbound = session.take_outbound();
                        }

                        if let Some(frame) = response.as_ref().and_then(encode) {
                            if sender.send(Message::Text(frame)).await.is_err() {
                                tracing::error!("Failed to send response");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("WebSocket closed");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::info!(
        conn_id = %session.conn_id(),
        race_id = ?session.race_id(),
        "WebSocket connection closed"
    );
    // Dropping the session unbinds it from its room
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{issue_token, AuthConfig, SignedTokenResolver};
    use crate::config::RaceConfig;
    use crate::store::MemoryStore;
    use axum::http::header::AUTHORIZATION;

    const SECRET: &str = "s3cret";

    fn app_state() -> AppState {
        AppState::new(
            RaceConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(SignedTokenResolver::new(AuthConfig {
                secret: Some(SECRET.to_string()),
            })),
        )
    }

    fn alice() -> Identity {
        Identity {
            user_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            admin: false,
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let state = app_state();
        let result = authenticate(&state, None, &HeaderMap::new()).await;
        assert_eq!(result.unwrap_err(), RaceError::Unauthorized);
    }

    #[tokio::test]
    async fn test_forged_token_is_unauthorized() {
        let state = app_state();
        let forged = issue_token(&alice(), "not-the-secret");
        let result = authenticate(&state, Some(&forged), &HeaderMap::new()).await;
        assert_eq!(result.unwrap_err(), RaceError::Unauthorized);
    }

    #[tokio::test]
    async fn test_signed_token_in_header_authenticates() {
        let state = app_state();
        let token = issue_token(&alice(), SECRET);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, format!("Bearer {}", token).parse().unwrap());

        let identity = authenticate(&state, None, &headers).await.unwrap();
        assert_eq!(identity.user_id, "alice");
    }

    #[test]
    fn test_rejection_sends_error_then_policy_close() {
        let frames = rejection(&RaceError::Unauthorized);
        assert_eq!(frames.len(), 2);

        match &frames[0] {
            Message::Text(text) => {
                let reply: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(reply["type"], "race:error");
                assert_eq!(reply["code"], "UNAUTHORIZED");
            }
            other => panic!("expected error text, got {:?}", other),
        }
        match &frames[1] {
            Message::Close(Some(close)) => assert_eq!(close.code, close_code::POLICY),
            other => panic!("expected policy close, got {:?}", other),
        }
    }
}
