//! Sharpness-based face quality.
//!
//! The score is the variance of the Laplacian over the grayscale crop,
//! mapped piecewise-linearly into [0, 1].

use image::{imageops::FilterType, DynamicImage};
use imageproc::filter::laplacian_filter;
use std::sync::atomic::{AtomicU32, Ordering};

/// Crops smaller than this on either side are upscaled before measuring
pub const MIN_MEASURE_SIDE: u32 = 32;
pub const UPSCALE_SIDE: u32 = 64;
/// Score used when the crop cannot be measured
pub const FALLBACK_SCORE: f32 = 0.5;
pub const DEFAULT_LOW_QUALITY_THRESHOLD: f32 = 0.4;

/// Map Laplacian variance to a score; monotonic non-decreasing in `variance`
pub fn score_from_variance(variance: f64) -> f32 {
    let v = variance.max(0.0);
    let score = if v > 100.0 {
        0.9 + ((v - 100.0).min(200.0) / 200.0) * 0.1
    } else if v > 30.0 {
        0.5 + (v - 30.0) / 70.0 * 0.4
    } else if v > 10.0 {
        0.2 + (v - 10.0) / 20.0 * 0.3
    } else {
        v / 10.0 * 0.2
    };
    score.clamp(0.0, 1.0) as f32
}

pub fn laplacian_variance(crop: &DynamicImage) -> Option<f64> {
    if crop.width() == 0 || crop.height() == 0 {
        return None;
    }
    let gray = if crop.width() < MIN_MEASURE_SIDE || crop.height() < MIN_MEASURE_SIDE {
        crop.resize_exact(UPSCALE_SIDE, UPSCALE_SIDE, FilterType::CatmullRom)
            .to_luma8()
    } else {
        crop.to_luma8()
    };

    let lap = laplacian_filter(&gray);
    let n = f64::from(lap.width()) * f64::from(lap.height());
    if n == 0.0 {
        return None;
    }
    let (sum, sum_sq) = lap.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = f64::from(p[0]);
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    variance.is_finite().then_some(variance)
}

/// Quality of a face crop; never fails, falls back to [`FALLBACK_SCORE`]
pub fn face_quality(crop: Option<&DynamicImage>) -> f32 {
    match crop.and_then(laplacian_variance) {
        Some(variance) => score_from_variance(variance),
        None => {
            tracing::debug!("face quality unavailable, using fallback");
            FALLBACK_SCORE
        }
    }
}

/// Process-wide low-quality threshold, adjustable at runtime
#[derive(Debug)]
pub struct QualityThreshold(AtomicU32);

impl QualityThreshold {
    pub fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.clamp(0.0, 1.0).to_bits()))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// Set the threshold; values outside [0, 1] are rejected
    pub fn set(&self, value: f32) -> anyhow::Result<()> {
        common::validation::validate_range(value, 0.0, 1.0, "quality threshold")?;
        self.0.store(value.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    pub fn is_low(&self, score: f32) -> bool {
        score < self.get()
    }
}

impl Default for QualityThreshold {
    fn default() -> Self {
        Self::new(DEFAULT_LOW_QUALITY_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma};

    #[test]
    fn test_breakpoints() {
        assert_eq!(score_from_variance(0.0), 0.0);
        assert!((score_from_variance(10.0) - 0.2).abs() < 1e-6);
        assert!((score_from_variance(30.0) - 0.5).abs() < 1e-6);
        assert!((score_from_variance(100.0) - 0.9).abs() < 1e-6);
        assert!((score_from_variance(200.0) - 0.95).abs() < 1e-6);
        assert!((score_from_variance(300.0) - 1.0).abs() < 1e-6);
        assert_eq!(score_from_variance(1000.0), 1.0);
        assert_eq!(score_from_variance(1e9), 1.0);
        assert_eq!(score_from_variance(-5.0), 0.0);
    }

    #[test]
    fn test_monotonic() {
        let mut prev = score_from_variance(0.0);
        let mut v = 0.0;
        while v < 2000.0 {
            v += 0.5;
            let s = score_from_variance(v);
            assert!(s >= prev, "score dropped at variance {}", v);
            prev = s;
        }
    }

    #[test]
    fn test_flat_crop_scores_low_and_edges_score_high() {
        let flat = DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([120])));
        assert_eq!(face_quality(Some(&flat)), 0.0);

        let checker = DynamicImage::ImageLuma8(GrayImage::from_fn(64, 64, |x, y| {
            if (x + y) % 2 == 0 {
                Luma([0])
            } else {
                Luma([255])
            }
        }));
        assert!(face_quality(Some(&checker)) > 0.9);
    }

    #[test]
    fn test_small_and_missing_crops() {
        let tiny = DynamicImage::ImageLuma8(GrayImage::from_pixel(8, 8, Luma([50])));
        assert!(laplacian_variance(&tiny).is_some());
        assert_eq!(face_quality(None), FALLBACK_SCORE);
        assert_eq!(face_quality(Some(&DynamicImage::new_luma8(0, 0))), FALLBACK_SCORE);
    }

    #[test]
    fn test_threshold_bounds() {
        let threshold = QualityThreshold::default();
        assert!((threshold.get() - 0.4).abs() < 1e-6);
        assert!(threshold.is_low(0.3));
        assert!(threshold.set(0.2).is_ok());
        assert!(!threshold.is_low(0.3));
        assert!(threshold.set(1.5).is_err());
        assert!((threshold.get() - 0.2).abs() < 1e-6);
    }
}
