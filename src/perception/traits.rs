use async_trait::async_trait;
use image::RgbaImage;

use crate::config::CaptureTarget;
use crate::errors::DeskResult;
use crate::perception::types::{RawCapture, ScreenshotMeta, UIElement};

/// Raw display grabbing. Implemented over xcap for real desktops and by fakes in tests.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn grab(&self, target: &CaptureTarget) -> DeskResult<RawCapture>;
}

/// Strategy trait for UI element detection (accessibility tree, detector model, ...).
#[async_trait]
pub trait ElementRecognizer: Send + Sync {
    async fn recognize(&self, frame: &RgbaImage, meta: &ScreenshotMeta) -> DeskResult<Vec<UIElement>>;
}
