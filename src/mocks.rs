use std::sync::atomic::{AtomicUsize, Ordering};

use crate::errors::{NeuroSegError, Result};
use crate::pipeline::{ProbabilityMap, IMAGE_SIZE};
use crate::traits::SegmentationModel;
use image::RgbImage;

/// Segmentation model that returns a fixed probability map.
#[derive(Debug)]
pub struct MockSegmentationModel {
    pub image_size: u32,
    probabilities: ProbabilityMap,
    calls: AtomicUsize,
}

impl MockSegmentationModel {
    pub fn new(probabilities: ProbabilityMap) -> Self {
        let (height, width) = probabilities.dim();
        debug_assert_eq!(height, width, "mock probability map must be square");
        Self {
            image_size: height as u32,
            probabilities,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every pixel below threshold.
    pub fn empty() -> Self {
        let n = IMAGE_SIZE as usize;
        Self::new(ProbabilityMap::zeros((n, n)))
    }

    /// Background at 0.1 with one 0.9 pixel at `(x, y)`.
    pub fn single_pixel(x: usize, y: usize) -> Self {
        let n = IMAGE_SIZE as usize;
        let mut probabilities = ProbabilityMap::from_elem((n, n), 0.1);
        probabilities[[y, x]] = 0.9;
        Self::new(probabilities)
    }

    /// Number of `infer` calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentationModel for MockSegmentationModel {
    fn image_size(&self) -> u32 {
        self.image_size
    }

    fn infer(&self, image: &RgbImage) -> Result<ProbabilityMap> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if image.dimensions() != (self.image_size, self.image_size) {
            return Err(NeuroSegError::invalid_data(
                "inference input check",
                format!("image is {:?}, mock expects {}", image.dimensions(), self.image_size),
            ));
        }
        Ok(self.probabilities.clone())
    }
}

pub fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::empty()
}
