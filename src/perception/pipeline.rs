/// Perception pipeline: grab the configured target within the capture ceiling,
/// optionally run element recognition, and hand back a `ScreenState`.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use image::{imageops, GrayImage};
use tokio::time::Instant;

use crate::config::PerceptionConfig;
use crate::errors::{DeskPilotError, DeskResult};
use crate::perception::stability;
use crate::perception::template::{MatchCandidate, TemplateMatcher};
use crate::perception::traits::{CaptureSource, ElementRecognizer};
use crate::perception::types::{ScreenState, UIElement};

pub struct ScreenPerception {
    source: Arc<dyn CaptureSource>,
    recognizer: Option<Arc<dyn ElementRecognizer>>,
    matcher: TemplateMatcher,
    config: PerceptionConfig,
}

impl ScreenPerception {
    pub fn new(source: Arc<dyn CaptureSource>, config: PerceptionConfig) -> Self {
        Self {
            source,
            recognizer: None,
            matcher: TemplateMatcher::default(),
            config,
        }
    }

    pub fn with_recognizer(mut self, recognizer: Arc<dyn ElementRecognizer>) -> Self {
        self.recognizer = Some(recognizer);
        self
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    pub fn matcher(&self) -> &TemplateMatcher {
        &self.matcher
    }

    /// Capture the screen. Fails with `CaptureTimeout` when the grab overruns the ceiling.
    /// Recognition is best effort: a failing or slow recognizer leaves `elements` empty.
    pub async fn capture(&self) -> DeskResult<ScreenState> {
        let ceiling = self.config.capture_timeout();
        let raw = match tokio::time::timeout(ceiling, self.source.grab(&self.config.target)).await {
            Ok(res) => res?,
            Err(_) => {
                tracing::warn!(ms = self.config.capture_timeout_ms, "screen capture timed out");
                return Err(DeskPilotError::CaptureTimeout { ms: self.config.capture_timeout_ms });
            }
        };
        let captured_at = chrono::Utc::now();

        let elements = match &self.recognizer {
            Some(recognizer) => {
                match tokio::time::timeout(ceiling, recognizer.recognize(&raw.image, &raw.meta)).await {
                    Ok(Ok(mut elements)) => {
                        assign_element_ids(&mut elements);
                        tracing::debug!(count = elements.len(), "elements recognized");
                        Some(elements)
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(error = %e, "element recognition failed, continuing without");
                        None
                    }
                    Err(_) => {
                        tracing::warn!("element recognition timed out, continuing without");
                        None
                    }
                }
            }
            None => None,
        };

        Ok(ScreenState {
            frame: Arc::new(raw.image),
            elements,
            captured_at,
            meta: raw.meta,
        })
    }

    /// Locate a template in an already captured state, at every configured scale.
    ///
    /// The scan runs on the blocking pool. Dropping the returned future (a timeout or
    /// a cancelled `select!`) stops the scan at the next frame row.
    pub async fn find(&self, state: &ScreenState, template: Arc<GrayImage>) -> DeskResult<Vec<MatchCandidate>> {
        let frame = state.frame.clone();
        let matcher = self.matcher.clone();
        let threshold = self.config.match_threshold;
        let scales = self.config.match_scales.clone();
        let stop = StopOnDrop(Arc::new(AtomicBool::new(false)));
        let flag = stop.0.clone();

        let scanned = tokio::task::spawn_blocking(move || {
            let gray = imageops::grayscale(&*frame);
            matcher.locate_scaled(&gray, &template, threshold, &scales, &flag)
        })
        .await
        .map_err(|e| DeskPilotError::Perception(format!("template scan join: {e}")))?;
        Ok(scanned.unwrap_or_default())
    }

    /// Re-capture until `template` shows up or `timeout` passes. `Ok(None)` is the
    /// normal "did not appear" outcome; capture timeouts while polling are skipped.
    pub async fn wait_for_template(
        &self,
        template: Arc<GrayImage>,
        timeout: Duration,
        poll: Duration,
    ) -> DeskResult<Option<MatchCandidate>> {
        let deadline = Instant::now() + timeout;
        loop {
            let attempt = async {
                let state = self.capture().await?;
                self.find(&state, template.clone()).await
            };
            match tokio::time::timeout_at(deadline, attempt).await {
                Ok(Ok(found)) => {
                    if let Some(best) = found.into_iter().next() {
                        tracing::debug!(x = best.region.x, y = best.region.y, conf = best.confidence, "template appeared");
                        return Ok(Some(best));
                    }
                }
                Ok(Err(DeskPilotError::CaptureTimeout { .. })) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => return Ok(None),
            }
            if Instant::now() + poll > deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Wait for the screen to stop changing after an action, when enabled.
    pub async fn settle(&self) -> DeskResult<bool> {
        if !self.config.settle.enabled {
            return Ok(true);
        }
        let this = self;
        stability::wait_for_settle(
            move || async move { this.capture().await.map(|s| s.frame.as_raw().clone()) },
            &self.config.settle,
        )
        .await
    }
}

/// Raises the stop flag of an in-flight scan when the waiting future goes away.
struct StopOnDrop(Arc<AtomicBool>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Give elements short numeric ids and link each to its smallest enclosing element,
/// so the model can address nested controls like `3>7`.
fn assign_element_ids(elements: &mut [UIElement]) {
    let n = elements.len();
    let mut parent_indices: Vec<Option<usize>> = vec![None; n];
    for i in 0..n {
        let inner = elements[i].bbox;
        let mut best: Option<usize> = None;
        for j in 0..n {
            if i == j {
                continue;
            }
            let outer = elements[j].bbox;
            if outer.area() > inner.area()
                && outer.contains_rect(&inner)
                && best.map_or(true, |b| outer.area() < elements[b].bbox.area())
            {
                best = Some(j);
            }
        }
        parent_indices[i] = best;
    }

    for (idx, elem) in elements.iter_mut().enumerate() {
        elem.id = format!("{}", idx + 1);
    }
    for i in 0..n {
        elements[i].parent_id = parent_indices[i].map(|p| format!("{}", p + 1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureTarget;
    use crate::perception::types::{ElementType, RawCapture, Rect, ScreenshotMeta};
    use async_trait::async_trait;
    use image::{Luma, Rgba, RgbaImage};

    struct SlowSource;

    #[async_trait]
    impl CaptureSource for SlowSource {
        async fn grab(&self, _target: &CaptureTarget) -> DeskResult<RawCapture> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Err(DeskPilotError::Perception("unreachable".into()))
        }
    }

    struct StaticSource(RgbaImage);

    #[async_trait]
    impl CaptureSource for StaticSource {
        async fn grab(&self, _target: &CaptureTarget) -> DeskResult<RawCapture> {
            let meta = ScreenshotMeta::for_image(self.0.width(), self.0.height());
            Ok(RawCapture { image: self.0.clone(), meta })
        }
    }

    struct BoxRecognizer;

    #[async_trait]
    impl ElementRecognizer for BoxRecognizer {
        async fn recognize(
            &self,
            _frame: &RgbaImage,
            _meta: &ScreenshotMeta,
        ) -> DeskResult<Vec<UIElement>> {
            let el = |x, y, w, h| UIElement {
                id: String::new(),
                node_type: ElementType::Container,
                bbox: Rect::new(x, y, w, h),
                content: None,
                confidence: 0.9,
                parent_id: None,
            };
            Ok(vec![el(0, 0, 100, 100), el(10, 10, 20, 20), el(12, 12, 5, 5)])
        }
    }

    fn config(ms: u64) -> PerceptionConfig {
        PerceptionConfig { capture_timeout_ms: ms, ..PerceptionConfig::default() }
    }

    #[tokio::test]
    async fn slow_capture_times_out() {
        let p = ScreenPerception::new(Arc::new(SlowSource), config(20));
        let err = p.capture().await.unwrap_err();
        assert!(matches!(err, DeskPilotError::CaptureTimeout { ms: 20 }));
    }

    #[tokio::test]
    async fn recognized_elements_get_ids_and_parents() {
        let img = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        let p = ScreenPerception::new(Arc::new(StaticSource(img)), config(500))
            .with_recognizer(Arc::new(BoxRecognizer));
        let state = p.capture().await.unwrap();
        let elements = state.elements.unwrap();
        assert_eq!(elements[0].id, "1");
        assert_eq!(elements[0].parent_id, None);
        assert_eq!(elements[1].parent_id.as_deref(), Some("1"));
        assert_eq!(elements[2].parent_id.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn wait_for_absent_template_returns_none() {
        let img = RgbaImage::from_pixel(40, 40, Rgba([0, 0, 0, 255]));
        let p = ScreenPerception::new(Arc::new(StaticSource(img)), config(500));
        let template = GrayImage::from_pixel(4, 4, Luma([200]));
        let found = p
            .wait_for_template(Arc::new(template), Duration::from_millis(30), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    fn noise_rgba(w: u32, h: u32, seed: u64) -> RgbaImage {
        let mut state = seed;
        RgbaImage::from_fn(w, h, |_, _| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let v = (state >> 56) as u8;
            Rgba([v, v, v, 255])
        })
    }

    #[tokio::test]
    async fn wait_on_full_hd_frame_keeps_its_deadline_and_the_runtime_free() {
        let p = ScreenPerception::new(Arc::new(StaticSource(noise_rgba(1920, 1080, 7))), config(500));
        let template = Arc::new(GrayImage::from_fn(48, 48, |x, y| Luma([((x * 7 + y * 13) % 251) as u8])));

        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::Relaxed);
                }
            })
        };

        let started = std::time::Instant::now();
        let found = p
            .wait_for_template(template, Duration::from_millis(50), Duration::from_millis(10))
            .await
            .unwrap();
        let elapsed = started.elapsed();
        ticker.abort();

        assert!(found.is_none());
        assert!(elapsed < Duration::from_secs(2), "wait took {elapsed:?}");
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn find_uses_configured_scales() {
        let template = GrayImage::from_fn(10, 10, |x, y| Luma([((x * 31 + y * 17) % 256) as u8]));
        let big = imageops::resize(&template, 15, 15, imageops::FilterType::Triangle);
        let mut frame = image::DynamicImage::ImageRgba8(noise_rgba(80, 60, 3)).to_luma8();
        imageops::replace(&mut frame, &big, 30, 20);
        let frame = image::DynamicImage::ImageLuma8(frame).to_rgba8();
        let template = Arc::new(template);

        let exact = ScreenPerception::new(Arc::new(StaticSource(frame.clone())), config(500));
        let state = exact.capture().await.unwrap();
        let at_stored_size = exact.find(&state, template.clone()).await.unwrap();
        assert!(at_stored_size.iter().all(|c| c.region.width == 10));

        let scaled_config = PerceptionConfig { match_threshold: 0.9, match_scales: vec![1.0, 1.5], ..config(500) };
        let scaled = ScreenPerception::new(Arc::new(StaticSource(frame)), scaled_config);
        let state = scaled.capture().await.unwrap();
        let found = scaled.find(&state, template).await.unwrap();
        assert_eq!(found[0].region, Rect::new(30, 20, 15, 15));
    }
}
