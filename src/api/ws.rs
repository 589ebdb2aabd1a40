use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;

use crate::broadcast::{Broadcaster, FrameMessage};

use super::server::AppState;

pub async fn detections_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let hub = Arc::clone(state.pipeline.broadcaster());
    ws.on_upgrade(move |socket| stream_detections(socket, hub))
}

fn encode(frame: &FrameMessage) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            tracing::warn!(frame = frame.frame_idx, error = %e, "failed to encode frame message");
            None
        }
    }
}

/// Forwards broadcast frames to one client until either side goes away.
/// The broadcaster closing our queue (slow consumer) ends the connection.
async fn stream_detections(mut socket: WebSocket, hub: Arc<Broadcaster>) {
    let mut sub = hub.subscribe();
    tracing::info!(subscriber = sub.id, subscribers = hub.subscriber_count(), "detection stream connected");

    loop {
        tokio::select! {
            frame = sub.rx.recv() => {
                let Some(frame) = frame else { break };
                let Some(msg) = encode(&frame) else { continue };
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    hub.unsubscribe(sub.id);
    tracing::info!(subscriber = sub.id, subscribers = hub.subscriber_count(), "detection stream disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_sent_as_json_text() {
        let frame = FrameMessage {
            ts: 1.5,
            frame_idx: 9,
            boxes: Vec::new(),
            fps: 12.0,
            width: 640,
            height: 480,
        };
        let Some(Message::Text(text)) = encode(&frame) else {
            panic!("expected a text message");
        };
        let back: FrameMessage = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(back, frame);
    }
}
