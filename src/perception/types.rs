use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned pixel rectangle in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn center(&self) -> (i32, i32) {
        (self.x + self.width as i32 / 2, self.y + self.height as i32 / 2)
    }

    pub fn contains_rect(&self, other: &Rect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    /// Intersection over union; 0.0 for disjoint or empty rectangles.
    pub fn iou(&self, other: &Rect) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }
        let inter = (x2 - x1) as f64 * (y2 - y1) as f64;
        let union = self.area() as f64 + other.area() as f64 - inter;
        if union <= 0.0 {
            0.0
        } else {
            (inter / union) as f32
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Button,
    Input,
    Link,
    Text,
    Image,
    Checkbox,
    Radio,
    Select,
    Menu,
    MenuItem,
    Icon,
    Container,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UIElement {
    pub id: String,
    pub node_type: ElementType,
    pub bbox: Rect,
    /// Visible text or accessible name.
    pub content: Option<String>,
    pub confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotMeta {
    pub monitor_index: u32,
    pub scale_factor: f64,
    /// Top-left of the captured area in desktop coordinates.
    pub origin_x: i32,
    pub origin_y: i32,
    pub physical_width: u32,
    pub physical_height: u32,
}

impl ScreenshotMeta {
    pub fn for_image(width: u32, height: u32) -> Self {
        Self {
            monitor_index: 0,
            scale_factor: 1.0,
            origin_x: 0,
            origin_y: 0,
            physical_width: width,
            physical_height: height,
        }
    }
}

/// Pixels plus geometry, as handed over by a capture source.
#[derive(Debug, Clone)]
pub struct RawCapture {
    pub image: RgbaImage,
    pub meta: ScreenshotMeta,
}

/// The extent inside which actions may target coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenBounds {
    pub origin_x: i32,
    pub origin_y: i32,
    pub width: u32,
    pub height: u32,
}

impl ScreenBounds {
    pub fn new(width: u32, height: u32) -> Self {
        Self { origin_x: 0, origin_y: 0, width, height }
    }

    /// Whether a frame-relative point lies inside the extent.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as i64) < self.width as i64 && (y as i64) < self.height as i64
    }
}

/// One interpreted look at the screen. Recomputed every iteration, never persisted.
#[derive(Debug, Clone)]
pub struct ScreenState {
    pub frame: Arc<RgbaImage>,
    pub elements: Option<Vec<UIElement>>,
    pub captured_at: DateTime<Utc>,
    pub meta: ScreenshotMeta,
}

impl ScreenState {
    pub fn bounds(&self) -> ScreenBounds {
        ScreenBounds {
            origin_x: self.meta.origin_x,
            origin_y: self.meta.origin_y,
            width: self.frame.width(),
            height: self.frame.height(),
        }
    }

    /// Lightweight reference kept in the step history instead of the pixels.
    pub fn frame_ref(&self) -> FrameRef {
        FrameRef {
            captured_at: self.captured_at,
            width: self.frame.width(),
            height: self.frame.height(),
            fingerprint: crate::perception::stability::frame_fingerprint(self.frame.as_raw()),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    pub fingerprint: u64,
    /// Saved copy of the frame, when step screenshots are enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_overlapping_boxes() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 0, 10, 10);
        let iou = a.iou(&b);
        assert!((iou - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&Rect::new(20, 20, 5, 5)), 0.0);
    }

    #[test]
    fn bounds_are_half_open() {
        let b = ScreenBounds::new(100, 50);
        assert!(b.contains(0, 0));
        assert!(b.contains(99, 49));
        assert!(!b.contains(100, 10));
        assert!(!b.contains(10, 50));
        assert!(!b.contains(-1, 10));
    }
}
