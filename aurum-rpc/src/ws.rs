use std::collections::HashSet;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::ApiState;

/// Topics a client may subscribe to; everything else is rejected.
const TOPICS: [&str; 4] = ["stats", "sync", "new_block", "new_tx"];

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_MESSAGE_BYTES: usize = 1_000_000;
const MAX_MESSAGES_PER_MINUTE: u32 = 100;
const RATE_WINDOW: Duration = Duration::from_secs(60);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    ws.on_upgrade(move |socket| client_session(socket, state))
}

/// One connected subscriber: core events fan out to its chosen topics,
/// bounded by per-client rate, size, and idle limits.
async fn client_session(mut socket: WebSocket, state: ApiState) {
    let mut events = state.events.subscribe();
    let mut topics: HashSet<String> = HashSet::new();
    let mut window_start = Instant::now();
    let mut window_count: u32 = 0;

    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);
    info!("websocket client connected");

    loop {
        tokio::select! {
            () = &mut idle => {
                debug!("websocket client idle, closing");
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                idle.as_mut().reset(Instant::now() + IDLE_TIMEOUT);

                let Message::Text(text) = message else {
                    // Pings are answered at the protocol layer; binary
                    // frames and close requests end the session.
                    if matches!(message, Message::Close(_)) {
                        break;
                    }
                    continue;
                };

                if text.len() > MAX_MESSAGE_BYTES {
                    let reply = error_frame("message exceeds size limit");
                    if socket.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                    continue;
                }

                if window_start.elapsed() > RATE_WINDOW {
                    window_start = Instant::now();
                    window_count = 0;
                }
                window_count += 1;
                if window_count > MAX_MESSAGES_PER_MINUTE {
                    let reply = error_frame("message rate limit exceeded");
                    if socket.send(Message::Text(reply)).await.is_err() {
                        break;
                    }
                    continue;
                }

                let reply = handle_client_message(&text, &mut topics);
                if socket.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if !topics.contains(event.topic()) {
                            continue;
                        }
                        let frame = serde_json::to_string(&event).unwrap_or_default();
                        if socket.send(Message::Text(frame)).await.is_err() {
                            break;
                        }
                    }
                    // A slow client skipped some events; keep streaming.
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "websocket client lagged behind event bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }
    debug!("websocket client disconnected");
}

fn handle_client_message(text: &str, topics: &mut HashSet<String>) -> String {
    let Ok(request) = serde_json::from_str::<Value>(text) else {
        return error_frame("message must be JSON");
    };
    let action = request["action"].as_str().unwrap_or_default();
    let topic = request["topic"].as_str().unwrap_or_default();

    match action {
        "subscribe" => {
            if !TOPICS.contains(&topic) {
                return error_frame("unknown topic");
            }
            topics.insert(topic.to_string());
            json!({ "success": true, "message": format!("subscribed to {topic}") }).to_string()
        }
        "unsubscribe" => {
            topics.remove(topic);
            json!({ "success": true, "message": format!("unsubscribed from {topic}") }).to_string()
        }
        _ => error_frame("unknown action"),
    }
}

fn error_frame(message: &str) -> String {
    json!({ "error": { "code": "WS_ERROR", "message": message } }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriptions_are_validated() {
        let mut topics = HashSet::new();
        let reply = handle_client_message(r#"{"action":"subscribe","topic":"new_block"}"#, &mut topics);
        assert!(reply.contains("subscribed"));
        assert!(topics.contains("new_block"));

        let reply = handle_client_message(r#"{"action":"subscribe","topic":"gossip"}"#, &mut topics);
        assert!(reply.contains("unknown topic"));

        let reply =
            handle_client_message(r#"{"action":"unsubscribe","topic":"new_block"}"#, &mut topics);
        assert!(reply.contains("unsubscribed"));
        assert!(topics.is_empty());
    }

    #[test]
    fn malformed_frames_get_error_envelopes() {
        let mut topics = HashSet::new();
        assert!(handle_client_message("not json", &mut topics).contains("WS_ERROR"));
        assert!(handle_client_message(r#"{"action":"dance"}"#, &mut topics).contains("unknown action"));
    }
}
