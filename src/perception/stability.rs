use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use crate::config::SettleConfig;
use crate::errors::DeskResult;

/// Sampled hash of a pixel buffer. Cheap enough to compute every step.
pub fn frame_fingerprint(frame: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    frame.len().hash(&mut hasher);
    let sample_step = (frame.len() / 1000).max(1);
    for i in (0..frame.len()).step_by(sample_step) {
        frame[i].hash(&mut hasher);
    }
    hasher.finish()
}

/// Fraction of sampled bytes that differ noticeably between two frames.
pub fn frame_difference(frame1: &[u8], frame2: &[u8]) -> f64 {
    if frame1.is_empty() || frame2.is_empty() || frame1.len() != frame2.len() {
        return 1.0;
    }

    let sample_step = (frame1.len() / 1000).max(1);
    let mut diff_count = 0usize;
    let mut total_samples = 0usize;

    for i in (0..frame1.len()).step_by(sample_step) {
        if (frame1[i] as i32 - frame2[i] as i32).abs() > 10 {
            diff_count += 1;
        }
        total_samples += 1;
    }

    if total_samples == 0 {
        return 0.0;
    }
    diff_count as f64 / total_samples as f64
}

/// Poll frames until two consecutive ones are close enough, or the ceiling passes.
/// Returns `Ok(true)` when the screen settled.
pub async fn wait_for_settle<F, Fut>(capture_frame: F, config: &SettleConfig) -> DeskResult<bool>
where
    F: Fn() -> Fut,
    Fut: Future<Output = DeskResult<Vec<u8>>>,
{
    let start = Instant::now();
    let ceiling = Duration::from_millis(config.max_wait_ms);
    let interval = Duration::from_millis(config.check_interval_ms);
    let mut last_frame: Option<Vec<u8>> = None;

    while start.elapsed() < ceiling {
        let current = capture_frame().await?;
        if let Some(prev) = &last_frame {
            let diff = frame_difference(prev, &current);
            tracing::trace!(diff, "settle check");
            if diff < config.stability_threshold {
                tracing::debug!(elapsed = ?start.elapsed(), "screen settled");
                return Ok(true);
            }
        }
        last_frame = Some(current);
        tokio::time::sleep(interval).await;
    }

    tracing::warn!(elapsed = ?start.elapsed(), "screen did not settle before ceiling");
    Ok(false)
}
