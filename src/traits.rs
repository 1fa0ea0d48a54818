use crate::errors::Result;
use crate::pipeline::ProbabilityMap;
use image::RgbImage;

/// Abstraction over the segmentation model.
///
/// The session and the batch analyzer depend on this trait rather than on the
/// ONNX adapter so the whole request path can run against a mock.
pub trait SegmentationModel: Send + Sync {
    /// Side length of the square input the model expects.
    fn image_size(&self) -> u32;

    /// Run the model on one image that has already been resized to
    /// `image_size() x image_size()`.
    ///
    /// Returns per-pixel tumor probabilities with the same spatial size.
    fn infer(&self, image: &RgbImage) -> Result<ProbabilityMap>;
}
