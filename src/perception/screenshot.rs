use async_trait::async_trait;

use crate::config::CaptureTarget;
use crate::errors::{DeskPilotError, DeskResult};
use crate::perception::traits::CaptureSource;
use crate::perception::types::{RawCapture, ScreenshotMeta};

/// Desktop capture backed by xcap. Grabbing happens on the blocking pool.
#[derive(Debug, Default, Clone)]
pub struct XcapCapture;

impl XcapCapture {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CaptureSource for XcapCapture {
    async fn grab(&self, target: &CaptureTarget) -> DeskResult<RawCapture> {
        let target = target.clone();
        tokio::task::spawn_blocking(move || match target {
            CaptureTarget::PrimaryMonitor => capture_monitor(None),
            CaptureTarget::Monitor { index } => capture_monitor(Some(index)),
            CaptureTarget::FocusedWindow => capture_front_window(),
        })
        .await
        .map_err(|e| DeskPilotError::Perception(format!("capture join: {e}")))?
    }
}

fn capture_monitor(index: Option<usize>) -> DeskResult<RawCapture> {
    let monitors = xcap::Monitor::all()
        .map_err(|e| DeskPilotError::Perception(format!("enumerate monitors: {e}")))?;

    let (idx, monitor) = match index {
        Some(i) => monitors
            .into_iter()
            .enumerate()
            .nth(i)
            .ok_or_else(|| DeskPilotError::Perception(format!("monitor {i} not present")))?,
        None => monitors
            .into_iter()
            .enumerate()
            .find(|(_, m)| m.is_primary())
            .ok_or_else(|| DeskPilotError::Perception("no primary monitor".into()))?,
    };

    let image = monitor
        .capture_image()
        .map_err(|e| DeskPilotError::Perception(format!("capture monitor: {e}")))?;

    let meta = ScreenshotMeta {
        monitor_index: idx as u32,
        scale_factor: monitor.scale_factor() as f64,
        origin_x: monitor.x(),
        origin_y: monitor.y(),
        physical_width: image.width(),
        physical_height: image.height(),
    };
    tracing::debug!(
        monitor = idx,
        w = meta.physical_width,
        h = meta.physical_height,
        scale = meta.scale_factor,
        "monitor captured"
    );
    Ok(RawCapture { image, meta })
}

/// xcap lists windows front-to-back; the first visible one is the focused window.
fn capture_front_window() -> DeskResult<RawCapture> {
    let windows = xcap::Window::all()
        .map_err(|e| DeskPilotError::Perception(format!("enumerate windows: {e}")))?;

    let window = windows
        .into_iter()
        .find(|w| !w.is_minimized() && w.width() > 0 && w.height() > 0)
        .ok_or_else(|| DeskPilotError::Perception("no visible window to capture".into()))?;

    let image = window
        .capture_image()
        .map_err(|e| DeskPilotError::Perception(format!("capture window: {e}")))?;

    let meta = ScreenshotMeta {
        monitor_index: 0,
        scale_factor: 1.0,
        origin_x: window.x(),
        origin_y: window.y(),
        physical_width: image.width(),
        physical_height: image.height(),
    };
    tracing::debug!(title = %window.title(), w = meta.physical_width, h = meta.physical_height, "window captured");
    Ok(RawCapture { image, meta })
}
