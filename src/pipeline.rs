//! Pre- and post-processing around a single inference call.
//!
//! Everything here is pure: the same image and probability map always give the
//! same overlay, mask image and summary.

use std::fmt;

use image::{imageops, imageops::FilterType, GrayImage, Luma, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{NeuroSegError, Result};
use crate::imageops_ai::{add_weighted, mask};

/// Side length of the square resolution the model works at.
pub const IMAGE_SIZE: u32 = 256;

/// Probabilities strictly above this value are tumor pixels.
pub const THRESHOLD: f32 = 0.5;

/// Crimson used to highlight tumor pixels in the overlay.
pub const HIGHLIGHT_COLOR: Rgb<u8> = Rgb([220, 20, 60]);

pub const IMAGE_WEIGHT: f32 = 0.7;
pub const MASK_WEIGHT: f32 = 0.3;

/// Per-pixel tumor probabilities, indexed `[[y, x]]`.
pub type ProbabilityMap = Array2<f32>;

/// 0/1 mask derived from a [`ProbabilityMap`].
pub type BinaryMask = GrayImage;

/// Stretch `image` to `size x size` with bilinear filtering.
///
/// An image that already has the target size is returned unchanged.
pub fn resize(image: &RgbImage, size: u32) -> RgbImage {
    if image.dimensions() == (size, size) {
        return image.clone();
    }
    imageops::resize(image, size, size, FilterType::Triangle)
}

/// Scale pixel values to `[0, 1]`, channel-first (`[3, H, W]`).
pub fn normalize(image: &RgbImage) -> Array3<f32> {
    image.as_ndarray3().map(|&v| f32::from(v) / 255.0)
}

pub fn threshold(probabilities: &ProbabilityMap) -> BinaryMask {
    let (height, width) = probabilities.dim();
    GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([u8::from(probabilities[[y as usize, x as usize]] > THRESHOLD)])
    })
}

/// Blend the resized image with the highlighted mask region.
pub fn overlay(resized: &RgbImage, binary_mask: &BinaryMask) -> Result<RgbImage> {
    let colored = mask::colorize(binary_mask, HIGHLIGHT_COLOR);
    Ok(add_weighted(resized, IMAGE_WEIGHT, &colored, MASK_WEIGHT)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Prediction {
    #[serde(rename = "Tumor Detected")]
    TumorDetected,
    #[serde(rename = "No Tumor Detected")]
    NoTumorDetected,
}

impl Prediction {
    pub const fn label(self) -> &'static str {
        match self {
            Self::TumorDetected => "Tumor Detected",
            Self::NoTumorDetected => "No Tumor Detected",
        }
    }
}

impl fmt::Display for Prediction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaskStatistics {
    pub tumor_pixels: usize,
    pub total_pixels: usize,
    /// Mean probability over tumor pixels; `None` when there are none.
    pub mean_probability: Option<f64>,
}

impl MaskStatistics {
    pub fn compute(probabilities: &ProbabilityMap, binary_mask: &BinaryMask) -> Self {
        let (tumor_pixels, sum) = binary_mask
            .enumerate_pixels()
            .filter(|(_, _, Luma([v]))| *v > 0)
            .fold((0usize, 0f64), |(count, sum), (x, y, _)| {
                let p = probabilities[[y as usize, x as usize]];
                (count + 1, sum + f64::from(p))
            });

        let mean_probability = (tumor_pixels > 0).then(|| sum / tumor_pixels as f64);

        Self {
            tumor_pixels,
            total_pixels: binary_mask.len(),
            mean_probability,
        }
    }

    /// Share of the image covered by tumor pixels, in `[0, 1]`.
    pub fn area_fraction(&self) -> f64 {
        if self.total_pixels == 0 {
            return 0.0;
        }
        self.tumor_pixels as f64 / self.total_pixels as f64
    }
}

/// Textual result of one analysis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub prediction: Prediction,
    pub confidence: String,
    pub tumor_area: String,
}

impl From<&MaskStatistics> for Summary {
    fn from(stats: &MaskStatistics) -> Self {
        match stats.mean_probability {
            Some(mean) if stats.tumor_pixels > 0 => Self {
                prediction: Prediction::TumorDetected,
                confidence: format_percentage(mean),
                tumor_area: format_percentage(stats.area_fraction()),
            },
            _ => Self {
                prediction: Prediction::NoTumorDetected,
                confidence: "N/A".to_string(),
                tumor_area: "0.00%".to_string(),
            },
        }
    }
}

fn format_percentage(fraction: f64) -> String {
    format!("{:.2}%", fraction * 100.0)
}

/// Images and summary derived from one probability map.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub overlay: RgbImage,
    pub mask_image: RgbImage,
    pub statistics: MaskStatistics,
    pub summary: Summary,
}

/// Threshold, composite and summarize a model output for `resized`.
pub fn postprocess(resized: &RgbImage, probabilities: &ProbabilityMap) -> Result<Analysis> {
    let (width, height) = resized.dimensions();
    if probabilities.dim() != (height as usize, width as usize) {
        return Err(NeuroSegError::ImageProcessing {
            path: "unknown".to_string(),
            operation: "post-processing".to_string(),
            source: format!(
                "probability map has shape {:?}, expected ({}, {})",
                probabilities.dim(),
                height,
                width
            )
            .into(),
        });
    }

    let binary_mask = threshold(probabilities);
    let overlay = overlay(resized, &binary_mask)?;
    let mask_image = mask::to_rgb(&binary_mask);
    let statistics = MaskStatistics::compute(probabilities, &binary_mask);
    let summary = Summary::from(&statistics);

    Ok(Analysis {
        overlay,
        mask_image,
        statistics,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = IMAGE_SIZE as usize;

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_resize_is_idempotent() {
        let once = resize(&gradient_image(640, 480), IMAGE_SIZE);
        assert_eq!(once.dimensions(), (IMAGE_SIZE, IMAGE_SIZE));

        let twice = resize(&once, IMAGE_SIZE);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_resize_stretches_aspect_ratio() {
        let resized = resize(&gradient_image(100, 20), IMAGE_SIZE);
        assert_eq!(resized.dimensions(), (IMAGE_SIZE, IMAGE_SIZE));
    }

    #[test]
    fn test_normalize_range_and_layout() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(3, 1, Rgb([255, 0, 51]));

        let tensor = normalize(&image);
        assert_eq!(tensor.dim(), (3, 2, 4));
        assert_eq!(tensor[[0, 1, 3]], 1.0);
        assert_eq!(tensor[[1, 1, 3]], 0.0);
        assert!((tensor[[2, 1, 3]] - 0.2).abs() < 1e-6);
        assert!(tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_threshold_boundary_is_background() {
        let probabilities = array![[0.5, 0.500_001], [0.0, 1.0]];
        let mask = threshold(&probabilities);
        assert_eq!(mask.get_pixel(0, 0).0, [0]);
        assert_eq!(mask.get_pixel(1, 0).0, [1]);
        assert_eq!(mask.get_pixel(0, 1).0, [0]);
        assert_eq!(mask.get_pixel(1, 1).0, [1]);
    }

    #[test]
    fn test_all_zero_map_means_no_tumor() {
        let resized = gradient_image(IMAGE_SIZE, IMAGE_SIZE);
        let analysis = postprocess(&resized, &ProbabilityMap::zeros((N, N))).unwrap();

        assert_eq!(analysis.summary.prediction, Prediction::NoTumorDetected);
        assert_eq!(analysis.summary.confidence, "N/A");
        assert_eq!(analysis.summary.tumor_area, "0.00%");
        assert!(analysis.mask_image.pixels().all(|p| p.0 == [0, 0, 0]));
        assert_eq!(analysis.statistics.mean_probability, None);
    }

    #[test]
    fn test_below_threshold_map_means_no_tumor() {
        let resized = gradient_image(IMAGE_SIZE, IMAGE_SIZE);
        let analysis = postprocess(&resized, &ProbabilityMap::from_elem((N, N), 0.5)).unwrap();

        assert_eq!(analysis.summary.prediction, Prediction::NoTumorDetected);
        assert_eq!(analysis.summary.confidence, "N/A");
        assert_eq!(analysis.summary.tumor_area, "0.00%");
    }

    #[test]
    fn test_single_tumor_pixel() {
        let resized = gradient_image(IMAGE_SIZE, IMAGE_SIZE);
        let mut probabilities = ProbabilityMap::from_elem((N, N), 0.1);
        probabilities[[10, 20]] = 0.9;

        let analysis = postprocess(&resized, &probabilities).unwrap();
        assert_eq!(analysis.statistics.tumor_pixels, 1);
        assert_eq!(analysis.statistics.total_pixels, N * N);
        assert_eq!(analysis.summary.prediction, Prediction::TumorDetected);
        assert_eq!(analysis.summary.confidence, "90.00%");
        // 1 / 65536 is 0.0015%
        assert_eq!(analysis.summary.tumor_area, "0.00%");
        assert_eq!(*analysis.mask_image.get_pixel(20, 10), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_area_and_confidence_formatting() {
        let resized = gradient_image(IMAGE_SIZE, IMAGE_SIZE);
        let mut probabilities = ProbabilityMap::zeros((N, N));
        // 16 pixels, half at 0.6 and half at 0.8
        for i in 0..16 {
            probabilities[[i, 0]] = if i % 2 == 0 { 0.6 } else { 0.8 };
        }

        let analysis = postprocess(&resized, &probabilities).unwrap();
        assert_eq!(analysis.statistics.tumor_pixels, 16);
        assert_eq!(analysis.summary.tumor_area, "0.02%");
        assert_eq!(analysis.summary.confidence, "70.00%");
    }

    #[test]
    fn test_quarter_area() {
        let resized = gradient_image(IMAGE_SIZE, IMAGE_SIZE);
        let mut probabilities = ProbabilityMap::zeros((N, N));
        probabilities.slice_mut(s![..N / 2, ..N / 2]).fill(1.0);

        let analysis = postprocess(&resized, &probabilities).unwrap();
        assert_eq!(analysis.summary.tumor_area, "25.00%");
        assert_eq!(analysis.summary.confidence, "100.00%");
    }

    #[test]
    fn test_overlay_outside_mask_is_scaled_original() {
        let resized = RgbImage::from_pixel(IMAGE_SIZE, IMAGE_SIZE, Rgb([100, 200, 50]));
        let mut probabilities = ProbabilityMap::zeros((N, N));
        probabilities[[0, 0]] = 1.0;

        let analysis = postprocess(&resized, &probabilities).unwrap();
        assert_eq!(*analysis.overlay.get_pixel(5, 5), Rgb([70, 140, 35]));
        // 0.7 * 100 + 0.3 * 220 = 136, 0.7 * 200 + 0.3 * 20 = 146, 0.7 * 50 + 0.3 * 60 = 53
        assert_eq!(*analysis.overlay.get_pixel(0, 0), Rgb([136, 146, 53]));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let resized = gradient_image(IMAGE_SIZE, IMAGE_SIZE);
        let err = postprocess(&resized, &ProbabilityMap::zeros((N, N / 2))).unwrap_err();
        assert!(matches!(err, NeuroSegError::ImageProcessing { .. }));
        assert_eq!(err.category(), crate::errors::ErrorCategory::Pipeline);
    }
}
