//! HTTP and WebSocket surface.
//!
//! Deliberately thin: authentication, chat management, and history live in
//! other services. This layer exposes message ingestion and the real-time
//! room protocol (`join-chat` / `leave-chat` in, `new-message` out).

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::debug;
use uuid::Uuid;

use crate::error::Error;
use crate::pipeline::MessagePipeline;
use crate::rooms::RoomEvent;
use crate::store::{ChatDirectory, MessageStore};

pub fn router<D, S>(pipeline: Arc<MessagePipeline<D, S>>) -> Router
where
    D: ChatDirectory + 'static,
    S: MessageStore + 'static,
{
    Router::new()
        .route("/api/chats/:chat_id/messages", post(send_message::<D, S>))
        .route("/ws", get(ws_upgrade::<D, S>))
        .layer(TraceLayer::new_for_http())
        .with_state(pipeline)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    original_text: String,
}

/// Identity of the authenticated sender, established upstream and carried in
/// a header. Requests that arrive without it were not authenticated.
fn sender_from_headers(headers: &HeaderMap) -> Result<Uuid, Error> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| Error::Forbidden("missing or invalid sender identity".to_string()))
}

async fn send_message<D, S>(
    State(pipeline): State<Arc<MessagePipeline<D, S>>>,
    Path(chat_id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<Response, Error>
where
    D: ChatDirectory,
    S: MessageStore,
{
    let sender_id = sender_from_headers(&headers)?;
    let view = pipeline.ingest(chat_id, sender_id, &body.original_text).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "data": view,
        })),
    )
        .into_response())
}

/// Client-to-server room protocol events
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinChat { chat_id: Uuid },
    #[serde(rename_all = "camelCase")]
    LeaveChat { chat_id: Uuid },
}

async fn ws_upgrade<D, S>(
    State(pipeline): State<Arc<MessagePipeline<D, S>>>,
    ws: WebSocketUpgrade,
) -> Response
where
    D: ChatDirectory + 'static,
    S: MessageStore + 'static,
{
    ws.on_upgrade(move |socket| handle_socket(pipeline, socket))
}

async fn handle_socket<D, S>(pipeline: Arc<MessagePipeline<D, S>>, socket: WebSocket)
where
    D: ChatDirectory + 'static,
    S: MessageStore + 'static,
{
    let (mut sink, mut stream) = socket.split();

    // All joined rooms funnel into one outbound queue for this connection
    let (outbound, mut outbound_rx) = mpsc::channel::<RoomEvent>(64);
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };
            if sink.send(WsMessage::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    // One forwarding task per joined chat, so join/leave are independent
    let mut joined: HashMap<Uuid, JoinHandle<()>> = HashMap::new();

    while let Some(Ok(message)) = stream.next().await {
        match message {
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::JoinChat { chat_id }) => {
                    // Redundant joins are a no-op
                    if joined.contains_key(&chat_id) {
                        continue;
                    }
                    let mut subscription = pipeline.rooms().join(chat_id).await;
                    let outbound = outbound.clone();
                    let forwarder = tokio::spawn(async move {
                        while let Some(event) = subscription.recv().await {
                            if outbound.send(event).await.is_err() {
                                break;
                            }
                        }
                    });
                    joined.insert(chat_id, forwarder);
                }
                Ok(ClientEvent::LeaveChat { chat_id }) => {
                    // Leaving a room that was never joined is fine
                    if let Some(forwarder) = joined.remove(&chat_id) {
                        forwarder.abort();
                    }
                }
                Err(e) => debug!("Ignoring unparsable client event: {}", e),
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    for (_, forwarder) in joined {
        forwarder.abort();
    }
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_event_join_parses() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event": "join-chat", "chatId": "550e8400-e29b-41d4-a716-446655440000"}"#,
        )
        .expect("Should parse");
        assert!(matches!(event, ClientEvent::JoinChat { .. }));
    }

    #[test]
    fn test_client_event_leave_parses() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event": "leave-chat", "chatId": "550e8400-e29b-41d4-a716-446655440000"}"#,
        )
        .expect("Should parse");
        assert!(matches!(event, ClientEvent::LeaveChat { .. }));
    }

    #[test]
    fn test_unknown_client_event_rejected() {
        let result: Result<ClientEvent, _> =
            serde_json::from_str(r#"{"event": "self-destruct"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_sender_header_required() {
        let headers = HeaderMap::new();
        assert!(matches!(
            sender_from_headers(&headers),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_sender_header_parsed() {
        let mut headers = HeaderMap::new();
        let id = Uuid::new_v4();
        headers.insert("x-user-id", id.to_string().parse().unwrap());
        assert_eq!(sender_from_headers(&headers).unwrap(), id);
    }

    #[test]
    fn test_sender_header_must_be_uuid() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", "alice".parse().unwrap());
        assert!(sender_from_headers(&headers).is_err());
    }

    #[test]
    fn test_body_uses_wire_field_name() {
        let body: SendMessageBody =
            serde_json::from_str(r#"{"originalText": "hello"}"#).expect("Should parse");
        assert_eq!(body.original_text, "hello");
    }
}
