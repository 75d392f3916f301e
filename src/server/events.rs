//! `/api/events`: session broadcasts bridged onto a WebSocket.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use outpost_core_types::SessionEvent;

use crate::server::state::AppState;

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| stream_events(socket, state))
}

async fn stream_events(mut socket: WebSocket, state: AppState) {
    let mut events = state.orchestrator.subscribe();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = envelope(&event).to_string();
                    if socket.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "events socket lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                // inbound frames are ignored; the stream is one-way
                Some(Ok(_)) => continue,
                _ => break,
            },
        }
    }
}

/// `{type, payload?, timestamp}` envelope.
fn envelope(event: &SessionEvent) -> Value {
    let mut value = serde_json::to_value(event).unwrap_or_else(|_| json!({ "type": "unknown" }));
    if let Some(object) = value.as_object_mut() {
        object.insert("timestamp".to_string(), json!(Utc::now().to_rfc3339()));
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_core_types::SessionState;

    #[test]
    fn envelope_carries_type_payload_and_timestamp() {
        let value = envelope(&SessionEvent::StateChange(SessionState::default()));
        assert_eq!(value["type"], "state:change");
        assert!(value["payload"].is_object());
        assert!(value["timestamp"].is_string());

        let value = envelope(&SessionEvent::Ready);
        assert_eq!(value["type"], "ready");
        assert!(value["timestamp"].is_string());
    }
}
