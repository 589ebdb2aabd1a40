use serde::{Deserialize, Serialize};

use super::detection::Detection;

pub const DEFAULT_TRIPWIRE_THRESHOLD: f32 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ZoneKind {
    Polygon,
    Tripwire,
}

fn default_zone_kind() -> ZoneKind {
    ZoneKind::Polygon
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Zone {
    pub zone_id: String,
    pub name: String,
    #[serde(rename = "type", default = "default_zone_kind")]
    pub kind: ZoneKind,
    #[serde(default)]
    pub points: Vec<[f32; 2]>,
    /// Empty means every class is allowed.
    #[serde(default)]
    pub allowed_classes: Vec<String>,
    #[serde(default)]
    pub min_size_px: u32,
    /// Accepted for compatibility; not evaluated.
    #[serde(default)]
    pub dwell_sec: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<serde_json::Value>,
}

impl Zone {
    fn admits(&self, class_name: &str) -> bool {
        self.allowed_classes.is_empty() || self.allowed_classes.iter().any(|c| c == class_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Intrusion,
    Tripwire,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Intrusion => "intrusion",
            EventKind::Tripwire => "tripwire",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneEvent {
    pub zone_id: String,
    pub zone_name: String,
    pub kind: EventKind,
}

/// Even-odd ray casting. The polygon is closed implicitly from the last
/// point back to the first.
pub fn point_in_polygon(point: (f32, f32), polygon: &[[f32; 2]]) -> bool {
    let (x, y) = point;
    let n = polygon.len();
    if n < 3 {
        return false;
    }

    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > y) != (yj > y) {
            let x_cross = (xj - xi) * (y - yi) / (yj - yi) + xi;
            if x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Perpendicular distance from `point` to the segment `a`-`b`, or `None`
/// when the projection falls outside the segment or the segment is a point.
pub fn distance_to_segment(point: (f32, f32), a: [f32; 2], b: [f32; 2]) -> Option<f32> {
    let (px, py) = point;
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len_sq = dx * dx + dy * dy;
    if len_sq == 0.0 {
        return None;
    }

    let t = ((px - a[0]) * dx + (py - a[1]) * dy) / len_sq;
    if !(0.0..=1.0).contains(&t) {
        return None;
    }

    let (cx, cy) = (a[0] + t * dx, a[1] + t * dy);
    Some(((px - cx).powi(2) + (py - cy).powi(2)).sqrt())
}

pub struct ZoneEvaluator {
    zones: Vec<Zone>,
    tripwire_threshold: f32,
}

impl Default for ZoneEvaluator {
    fn default() -> Self {
        Self::new(Vec::new(), DEFAULT_TRIPWIRE_THRESHOLD)
    }
}

impl ZoneEvaluator {
    pub fn new(zones: Vec<Zone>, tripwire_threshold: f32) -> Self {
        Self {
            zones,
            tripwire_threshold,
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    /// First zone in list order that the detection's box center falls into.
    pub fn check(&self, detection: &Detection) -> Option<ZoneEvent> {
        let center = detection.bbox.center();

        for zone in &self.zones {
            if zone.points.is_empty() || !zone.admits(&detection.class_name) {
                continue;
            }

            let kind = match zone.kind {
                ZoneKind::Polygon if point_in_polygon(center, &zone.points) => EventKind::Intrusion,
                ZoneKind::Tripwire if zone.points.len() >= 2 => {
                    match distance_to_segment(center, zone.points[0], zone.points[1]) {
                        Some(d) if d < self.tripwire_threshold => EventKind::Tripwire,
                        _ => continue,
                    }
                }
                _ => continue,
            };

            return Some(ZoneEvent {
                zone_id: zone.zone_id.clone(),
                zone_name: zone.name.clone(),
                kind,
            });
        }

        None
    }
}
