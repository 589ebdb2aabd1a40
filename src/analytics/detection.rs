use serde::Serialize;

/// Axis-aligned box in original-frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Builds a box from corner coordinates, ordering and clamping them into
    /// `[0, width] x [0, height]`.
    pub fn clamped(x1: f32, y1: f32, x2: f32, y2: f32, width: f32, height: f32) -> Self {
        let cx = |v: f32| if v.is_finite() { v.clamp(0.0, width) } else { 0.0 };
        let cy = |v: f32| if v.is_finite() { v.clamp(0.0, height) } else { 0.0 };
        let (x1, x2) = (cx(x1), cx(x2));
        let (y1, y2) = (cy(y1), cy(y2));
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn xyxy(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Intersection over union. Boxes that do not overlap on either axis
    /// score exactly 0.
    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);

        if ix2 < ix1 || iy2 < iy1 {
            return 0.0;
        }

        let intersection = (ix2 - ix1) * (iy2 - iy1);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            return 0.0;
        }
        intersection / union
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BBox,
    /// Assigned by the tracker.
    pub track_id: Option<u64>,
    /// Assigned by the engine once the detection survives filtering.
    pub model: Option<String>,
}

impl Detection {
    pub fn new(class_name: impl Into<String>, confidence: f32, bbox: BBox) -> Self {
        Self {
            class_name: class_name.into(),
            confidence,
            bbox,
            track_id: None,
            model: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_with_self_is_one() {
        let b = BBox::new(10.0, 20.0, 110.0, 220.0);
        assert!((b.iou(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
        // overlapping on x only
        let c = BBox::new(5.0, 50.0, 15.0, 60.0);
        assert_eq!(a.iou(&c), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = BBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BBox::new(5.0, 0.0, 15.0, 10.0);
        // 50 / (100 + 100 - 50)
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn clamped_orders_and_bounds_corners() {
        let b = BBox::clamped(700.0, -5.0, 600.0, 100.0, 640.0, 480.0);
        assert_eq!(b, BBox::new(600.0, 0.0, 640.0, 100.0));
        assert_eq!(b.center(), (620.0, 50.0));
    }

    #[test]
    fn clamped_maps_nan_to_origin() {
        let b = BBox::clamped(f32::NAN, 10.0, 20.0, 30.0, 640.0, 480.0);
        assert_eq!(b.x1, 0.0);
        assert_eq!(b.x2, 20.0);
    }
}
