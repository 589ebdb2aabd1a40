use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::EventsConfig;

const EVENTS_PATH: &str = "/api/events/create";

/// One tracked detection from a file analysis job, in the shape the event
/// backend accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub camera_id: String,
    pub model: String,
    /// Zone event kind, or `general` when no zone matched.
    #[serde(rename = "type")]
    pub kind: String,
    pub zone: Option<String>,
    pub cls: String,
    pub track_id: Option<u64>,
    pub conf: f32,
    pub t_start: f64,
    pub bbox_xyxy: [f32; 4],
}

/// Best-effort event delivery. Never blocks and never reports failure to
/// the caller.
pub trait EventSink: Send + Sync {
    fn emit(&self, record: EventRecord);
}

/// Queues records and POSTs them to the event backend from a background task.
pub struct HttpEventSink {
    tx: mpsc::UnboundedSender<EventRecord>,
}

impl HttpEventSink {
    /// Must be called from within a tokio runtime.
    pub fn spawn(config: &EventsConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let url = format!("{}{}", config.backend_url.trim_end_matches('/'), EVENTS_PATH);
        let (tx, rx) = mpsc::unbounded_channel();

        tracing::info!(url = %url, "event sink started");
        tokio::spawn(forward(client, url, rx));

        Ok(Self { tx })
    }
}

impl EventSink for HttpEventSink {
    fn emit(&self, record: EventRecord) {
        if self.tx.send(record).is_err() {
            tracing::warn!("event forwarder gone, dropping event");
        }
    }
}

async fn forward(
    client: reqwest::Client,
    url: String,
    mut rx: mpsc::UnboundedReceiver<EventRecord>,
) {
    while let Some(record) = rx.recv().await {
        let result = client
            .post(&url)
            .json(&record)
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = result {
            tracing::warn!(event = %record.event_id, error = %e, "failed to deliver event");
        }
    }
    tracing::debug!("event forwarder stopped");
}


#[cfg(test)]
mod tests {
    use axum::extract::State;
    use axum::routing::post;
    use axum::{Json, Router};

    use super::*;

    fn record(id: &str) -> EventRecord {
        EventRecord {
            event_id: id.to_string(),
            camera_id: "file".into(),
            model: "coco".into(),
            kind: "general".into(),
            zone: None,
            cls: "person".into(),
            track_id: Some(1),
            conf: 0.9,
            t_start: 1.0,
            bbox_xyxy: [0.0, 0.0, 10.0, 10.0],
        }
    }

    #[test]
    fn record_uses_backend_field_names() {
        let json = serde_json::to_value(record("j_1_1")).unwrap();
        assert_eq!(json["type"], "general");
        assert!(json["zone"].is_null());
        assert_eq!(json["bbox_xyxy"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn posts_records_to_backend() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<EventRecord>();
        let app = Router::new()
            .route(
                EVENTS_PATH,
                post(
                    |State(tx): State<mpsc::UnboundedSender<EventRecord>>,
                     Json(record): Json<EventRecord>| async move {
                        let _ = tx.send(record);
                    },
                ),
            )
            .with_state(seen_tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let config = EventsConfig {
            backend_url: format!("http://{addr}/"),
            ..EventsConfig::default()
        };
        let sink = HttpEventSink::spawn(&config).unwrap();
        sink.emit(record("a"));
        sink.emit(record("b"));

        let first = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(5), seen_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.event_id, "a");
        assert_eq!(second.event_id, "b");
    }

    #[tokio::test]
    async fn unreachable_backend_does_not_panic() {
        let config = EventsConfig {
            backend_url: "http://127.0.0.1:9".into(),
            timeout_secs: 1,
            ..EventsConfig::default()
        };
        let sink = HttpEventSink::spawn(&config).unwrap();
        sink.emit(record("lost"));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
