use super::detection::Detection;

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.1;
pub const DEFAULT_MAX_AGE: u32 = 30;

#[derive(Debug, Clone)]
pub struct Track {
    pub id: u64,
    pub detection: Detection,
    pub first_seen: f64,
    pub last_seen: f64,
    pub hits: u32,
    /// Update calls survived since creation, matched or not.
    pub age: u32,
}

/// Greedy IoU tracker. Tracks are kept in creation order, which is also the
/// tie-break when two tracks match a detection equally well.
pub struct Tracker {
    tracks: Vec<Track>,
    next_id: u64,
    iou_threshold: f32,
    max_age: u32,
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(DEFAULT_IOU_THRESHOLD, DEFAULT_MAX_AGE)
    }
}

impl Tracker {
    pub fn new(iou_threshold: f32, max_age: u32) -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold,
            max_age,
        }
    }

    /// Associates `detections` with tracks, stamping each with a track id.
    pub fn update(&mut self, detections: Vec<Detection>, timestamp: f64) -> Vec<Detection> {
        let mut tracked = Vec::with_capacity(detections.len());

        for mut det in detections {
            let mut best: Option<usize> = None;
            let mut best_iou = self.iou_threshold;

            for (idx, track) in self.tracks.iter().enumerate() {
                if track.detection.class_name != det.class_name {
                    continue;
                }
                let iou = det.bbox.iou(&track.detection.bbox);
                if iou > best_iou {
                    best_iou = iou;
                    best = Some(idx);
                }
            }

            match best {
                Some(idx) => {
                    let track = &mut self.tracks[idx];
                    det.track_id = Some(track.id);
                    track.detection = det.clone();
                    track.last_seen = timestamp;
                    track.hits += 1;
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    det.track_id = Some(id);
                    tracing::trace!(track = id, class = %det.class_name, "new track");
                    self.tracks.push(Track {
                        id,
                        detection: det.clone(),
                        first_seen: timestamp,
                        last_seen: timestamp,
                        hits: 1,
                        age: 0,
                    });
                }
            }

            tracked.push(det);
        }

        let limit = self.max_age.saturating_mul(2);
        for track in &mut self.tracks {
            track.age += 1;
        }
        self.tracks.retain(|t| {
            let keep = t.age <= limit;
            if !keep {
                tracing::trace!(
                    track = t.id,
                    hits = t.hits,
                    seen_for = t.last_seen - t.first_seen,
                    "track expired"
                );
            }
            keep
        });

        tracked
    }
}

#[cfg(test)]
impl Tracker {
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::detection::BBox;

    fn det(class: &str, x: f32) -> Detection {
        Detection::new(class, 0.9, BBox::new(x, 0.0, x + 10.0, 10.0))
    }

    #[test]
    fn same_detection_keeps_track_id() {
        let mut tracker = Tracker::default();
        let first = tracker.update(vec![det("person", 0.0)], 1.0);
        let second = tracker.update(vec![det("person", 0.0)], 2.0);
        assert_eq!(first[0].track_id, Some(1));
        assert_eq!(second[0].track_id, Some(1));
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.tracks()[0].hits, 2);
        assert_eq!(tracker.tracks()[0].first_seen, 1.0);
        assert_eq!(tracker.tracks()[0].last_seen, 2.0);
    }

    #[test]
    fn different_class_gets_new_track() {
        let mut tracker = Tracker::default();
        let first = tracker.update(vec![det("person", 0.0)], 1.0);
        let second = tracker.update(vec![det("car", 0.0)], 2.0);
        assert_ne!(first[0].track_id, second[0].track_id);
        assert_eq!(second[0].track_id, Some(2));
    }

    #[test]
    fn low_overlap_starts_new_track() {
        let mut tracker = Tracker::default();
        tracker.update(vec![det("person", 0.0)], 1.0);
        // IoU of 1/19 is below the 0.1 threshold
        let moved = tracker.update(vec![det("person", 9.0)], 2.0);
        assert_eq!(moved[0].track_id, Some(2));
    }

    #[test]
    fn ids_are_never_reused() {
        let mut tracker = Tracker::new(0.1, 1);
        tracker.update(vec![det("person", 0.0)], 0.0);
        for i in 0..3 {
            tracker.update(Vec::new(), i as f64);
        }
        assert!(tracker.is_empty());
        let again = tracker.update(vec![det("person", 0.0)], 5.0);
        assert_eq!(again[0].track_id, Some(2));
    }

    #[test]
    fn tracks_expire_after_twice_max_age_updates() {
        let mut tracker = Tracker::new(0.1, 2);
        tracker.update(vec![det("person", 0.0)], 0.0);
        // age 1 after creation; survives while age <= 4
        for _ in 0..3 {
            tracker.update(Vec::new(), 0.0);
        }
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.tracks()[0].age, 4);
        tracker.update(Vec::new(), 0.0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn matched_tracks_still_age() {
        let mut tracker = Tracker::new(0.1, 1);
        for _ in 0..2 {
            tracker.update(vec![det("person", 0.0)], 0.0);
        }
        assert_eq!(tracker.tracks()[0].age, 2);
        let out = tracker.update(vec![det("person", 0.0)], 0.0);
        assert_eq!(out[0].track_id, Some(1));
        assert!(tracker.is_empty());
    }

    #[test]
    fn ties_resolve_to_oldest_track() {
        let mut tracker = Tracker::default();
        let a = Detection::new("person", 0.9, BBox::new(0.0, 0.0, 10.0, 10.0));
        tracker.update(vec![a.clone()], 0.0);
        tracker.tracks.push(Track {
            id: 99,
            detection: a.clone(),
            first_seen: 0.0,
            last_seen: 0.0,
            hits: 1,
            age: 0,
        });
        let out = tracker.update(vec![a], 1.0);
        assert_eq!(out[0].track_id, Some(1));
        assert_eq!(tracker.tracks()[0].hits, 2);
        assert_eq!(tracker.tracks()[1].hits, 1);
    }
}
