//! Template matching over grayscale frames.
//!
//! Scores are zero-mean normalized cross-correlation (the same measure as
//! OpenCV's `TM_CCOEFF_NORMED`), in `[-1, 1]`. Window sums come from integral
//! images over integer pixel values, so identical windows always score
//! identically and the tie-break below stays deterministic.

use std::sync::atomic::{AtomicBool, Ordering};

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::perception::types::Rect;

const FLAT_EPSILON: f64 = 1e-6;

pub const DEFAULT_SCALES: [f32; 5] = [0.5, 0.75, 1.0, 1.25, 1.5];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub region: Rect,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
pub struct TemplateMatcher {
    /// Candidates overlapping a better one by at least this IoU are dropped.
    pub nms_iou: f32,
    pub max_results: usize,
}

impl Default for TemplateMatcher {
    fn default() -> Self {
        Self { nms_iou: 0.5, max_results: 100 }
    }
}

impl TemplateMatcher {
    pub fn new(nms_iou: f32, max_results: usize) -> Self {
        Self { nms_iou, max_results }
    }

    /// All regions of `frame` resembling `template` at least `threshold`, best first.
    /// An empty result means "not on screen" and is not an error.
    pub fn locate(&self, frame: &GrayImage, template: &GrayImage, threshold: f32) -> Vec<MatchCandidate> {
        self.locate_scaled(frame, template, threshold, &[1.0], &AtomicBool::new(false))
            .unwrap_or_default()
    }

    pub fn locate_rgba(&self, frame: &RgbaImage, template: &GrayImage, threshold: f32) -> Vec<MatchCandidate> {
        let gray = imageops::grayscale(frame);
        self.locate(&gray, template, threshold)
    }

    /// Same as [`locate`](Self::locate) but also tries resized copies of the template.
    pub fn locate_multiscale(
        &self,
        frame: &GrayImage,
        template: &GrayImage,
        threshold: f32,
        scales: &[f32],
    ) -> Vec<MatchCandidate> {
        self.locate_scaled(frame, template, threshold, scales, &AtomicBool::new(false))
            .unwrap_or_default()
    }

    /// Search at every scale in `scales` (`1.0` when empty). The scan polls `stop`
    /// once per frame row and returns `None` as soon as it is set.
    pub fn locate_scaled(
        &self,
        frame: &GrayImage,
        template: &GrayImage,
        threshold: f32,
        scales: &[f32],
        stop: &AtomicBool,
    ) -> Option<Vec<MatchCandidate>> {
        let scales = if scales.is_empty() { &[1.0][..] } else { scales };
        let mut all = Vec::new();
        for &scale in scales {
            let w = (template.width() as f32 * scale).round() as u32;
            let h = (template.height() as f32 * scale).round() as u32;
            if w == 0 || h == 0 || w > frame.width() || h > frame.height() {
                continue;
            }
            if w == template.width() && h == template.height() {
                all.extend(scan(frame, template, threshold, stop)?);
            } else {
                let resized = imageops::resize(template, w, h, FilterType::Triangle);
                all.extend(scan(frame, &resized, threshold, stop)?);
            }
        }
        Some(self.finish(all))
    }

    fn finish(&self, mut candidates: Vec<MatchCandidate>) -> Vec<MatchCandidate> {
        sort_candidates(&mut candidates);
        let mut kept: Vec<MatchCandidate> = Vec::new();
        for c in candidates {
            if kept.iter().all(|k| k.region.iou(&c.region) < self.nms_iou) {
                kept.push(c);
                if kept.len() >= self.max_results {
                    break;
                }
            }
        }
        kept
    }
}

/// Highest confidence first, then smallest area, then top-most, then left-most.
pub fn sort_candidates(candidates: &mut [MatchCandidate]) {
    candidates.sort_by(|a, b| {
        b.confidence
            .total_cmp(&a.confidence)
            .then_with(|| a.region.area().cmp(&b.region.area()))
            .then_with(|| a.region.y.cmp(&b.region.y))
            .then_with(|| a.region.x.cmp(&b.region.x))
    });
}

struct Integral {
    width: usize,
    sum: Vec<f64>,
    sq: Vec<f64>,
}

impl Integral {
    fn new(img: &GrayImage) -> Self {
        let (w, h) = (img.width() as usize, img.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = img.get_pixel(x as u32, y as u32)[0] as f64;
                row_sum += v;
                row_sq += v * v;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sq[(y + 1) * stride + x + 1] = sq[y * stride + x + 1] + row_sq;
            }
        }
        Self { width: w, sum, sq }
    }

    fn window(&self, table: &[f64], x: usize, y: usize, w: usize, h: usize) -> f64 {
        let stride = self.width + 1;
        table[(y + h) * stride + x + w] - table[y * stride + x + w] - table[(y + h) * stride + x]
            + table[y * stride + x]
    }
}

fn scan(frame: &GrayImage, template: &GrayImage, threshold: f32, stop: &AtomicBool) -> Option<Vec<MatchCandidate>> {
    let (fw, fh) = (frame.width() as usize, frame.height() as usize);
    let (tw, th) = (template.width() as usize, template.height() as usize);
    if tw == 0 || th == 0 || tw > fw || th > fh {
        return Some(Vec::new());
    }

    let n = (tw * th) as f64;
    let t_vals: Vec<f64> = template.pixels().map(|p| p[0] as f64).collect();
    let t_mean = t_vals.iter().sum::<f64>() / n;
    let t_zero: Vec<f64> = t_vals.iter().map(|v| v - t_mean).collect();
    let t_norm = t_zero.iter().map(|v| v * v).sum::<f64>().sqrt();
    let t_flat = t_norm < FLAT_EPSILON;

    let f_vals: Vec<f64> = frame.pixels().map(|p| p[0] as f64).collect();
    let integral = Integral::new(frame);

    let mut out = Vec::new();
    for v in 0..=(fh - th) {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        for u in 0..=(fw - tw) {
            let s = integral.window(&integral.sum, u, v, tw, th);
            let s2 = integral.window(&integral.sq, u, v, tw, th);
            let var_sum = (s2 - s * s / n).max(0.0);
            let w_flat = var_sum < FLAT_EPSILON;

            let score = if t_flat || w_flat {
                // Correlation is undefined for a constant patch: only a constant
                // window of the same brightness counts as a match.
                if t_flat && w_flat && ((s / n) - t_mean).abs() < 1.0 {
                    1.0
                } else {
                    continue;
                }
            } else {
                let mut num = 0.0;
                for ty in 0..th {
                    let f_row = &f_vals[(v + ty) * fw + u..(v + ty) * fw + u + tw];
                    let t_row = &t_zero[ty * tw..(ty + 1) * tw];
                    for (a, b) in f_row.iter().zip(t_row) {
                        num += a * b;
                    }
                }
                (num / (t_norm * var_sum.sqrt())).clamp(-1.0, 1.0)
            };

            if score as f32 >= threshold {
                out.push(MatchCandidate {
                    region: Rect::new(u as i32, v as i32, tw as u32, th as u32),
                    confidence: score as f32,
                });
            }
        }
    }
    Some(out)
}
