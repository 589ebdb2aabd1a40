use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::analytics::{Detection, ZoneEvent};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxMessage {
    /// Track id; 0 when the detection was not tracked.
    pub id: u64,
    pub cls: String,
    pub conf: f32,
    pub xyxy: [f32; 4],
    pub model: Option<String>,
    pub zone: Option<String>,
    pub event: Option<String>,
}

impl BoxMessage {
    pub fn new(detection: &Detection, zone: Option<&ZoneEvent>) -> Self {
        Self {
            id: detection.track_id.unwrap_or(0),
            cls: detection.class_name.clone(),
            conf: detection.confidence,
            xyxy: detection.bbox.xyxy(),
            model: detection.model.clone(),
            zone: zone.map(|z| z.zone_name.clone()),
            event: zone.map(|z| z.kind.as_str().to_string()),
        }
    }
}

/// One processed frame as pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMessage {
    pub ts: f64,
    pub frame_idx: u64,
    pub boxes: Vec<BoxMessage>,
    pub fps: f32,
    pub width: u32,
    pub height: u32,
}

pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<FrameMessage>>,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Arc<FrameMessage>>,
}

/// Fans frame messages out to subscribers without ever blocking the
/// publisher. A subscriber whose queue is full or whose receiver is gone is
/// removed on the spot.
pub struct Broadcaster {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    queue: usize,
}

impl Broadcaster {
    pub fn new(queue: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            queue: queue.max(1),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subs = self.lock();
        subs.push(Subscriber { id, tx });
        tracing::debug!(subscriber = id, total = subs.len(), "subscriber added");
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.lock();
        subs.retain(|s| s.id != id);
        tracing::debug!(subscriber = id, total = subs.len(), "subscriber removed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Returns how many subscribers accepted the message.
    pub fn publish(&self, message: FrameMessage) -> usize {
        let mut subs = self.lock();
        if subs.is_empty() {
            return 0;
        }

        let message = Arc::new(message);
        subs.retain(|sub| match sub.tx.try_send(Arc::clone(&message)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(subscriber = sub.id, "subscriber too slow, dropping");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(subscriber = sub.id, "subscriber disconnected");
                false
            }
        });
        subs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::{BBox, EventKind};

    fn message(frame_idx: u64) -> FrameMessage {
        FrameMessage {
            ts: 0.0,
            frame_idx,
            boxes: Vec::new(),
            fps: 0.0,
            width: 640,
            height: 480,
        }
    }

    #[tokio::test]
    async fn every_subscriber_receives() {
        let hub = Broadcaster::new(4);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.publish(message(1)), 2);
        assert_eq!(a.rx.recv().await.unwrap().frame_idx, 1);
        assert_eq!(b.rx.recv().await.unwrap().frame_idx, 1);
    }

    #[test]
    fn publish_without_subscribers_is_noop() {
        let hub = Broadcaster::new(4);
        assert_eq!(hub.publish(message(1)), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_others_kept() {
        let hub = Broadcaster::new(1);
        let _slow = hub.subscribe();
        let mut fast = hub.subscribe();

        assert_eq!(hub.publish(message(1)), 2);
        assert_eq!(fast.rx.recv().await.unwrap().frame_idx, 1);

        // slow never drained its single slot
        assert_eq!(hub.publish(message(2)), 1);
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(fast.rx.recv().await.unwrap().frame_idx, 2);
    }

    #[test]
    fn closed_subscriber_is_dropped() {
        let hub = Broadcaster::new(4);
        let sub = hub.subscribe();
        drop(sub);
        assert_eq!(hub.publish(message(1)), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_only_that_subscriber() {
        let hub = Broadcaster::new(4);
        let a = hub.subscribe();
        let _b = hub.subscribe();
        hub.unsubscribe(a.id);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn box_message_wire_format() {
        let mut det = Detection::new("person", 0.5, BBox::new(1.0, 2.0, 3.0, 4.0));
        det.track_id = Some(7);
        det.model = Some("coco".into());
        let zone = ZoneEvent {
            zone_id: "z1".into(),
            zone_name: "Gate".into(),
            kind: EventKind::Intrusion,
        };

        let json = serde_json::to_value(BoxMessage::new(&det, Some(&zone))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7, "cls": "person", "conf": 0.5, "xyxy": [1.0, 2.0, 3.0, 4.0],
                "model": "coco", "zone": "Gate", "event": "intrusion"
            })
        );

        let untracked = serde_json::to_value(BoxMessage::new(&Detection::new("car", 0.5, BBox::default()), None)).unwrap();
        assert_eq!(untracked["id"], 0);
        assert!(untracked["zone"].is_null());
        assert!(untracked["event"].is_null());
    }
}
