//! Request orchestration: one idle state, a submit and a clear transition.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{DynamicImage, ImageFormat, RgbImage};
use tracing::{debug, info};

use crate::errors::{NeuroSegError, Result};
use crate::model::ModelHandle;
use crate::pipeline::{self, MaskStatistics, Prediction, Summary};
use crate::report;
use crate::traits::SegmentationModel;

/// What the presentation layer should do with the results area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplaySignal {
    ShowResults,
    HideResults,
}

/// Everything produced by one successful submit.
#[derive(Debug, Clone)]
pub struct ResultBundle {
    pub overlay: RgbImage,
    pub mask: RgbImage,
    pub original: RgbImage,
    pub prediction: Prediction,
    pub confidence: String,
    pub tumor_area: String,
    pub statistics: MaskStatistics,
    pub report_path: PathBuf,
}

impl ResultBundle {
    /// Save overlay, mask and original as `{prefix}overlay.png` and so on.
    pub fn save_images(&self, output_dir: &Path, prefix: &str) -> Result<()> {
        let outputs = [
            ("overlay", &self.overlay),
            ("mask", &self.mask),
            ("original", &self.original),
        ];
        for (kind, image) in outputs {
            let path = output_dir.join(format!("{prefix}{kind}.png"));
            image
                .save_with_format(&path, ImageFormat::Png)
                .map_err(|e| NeuroSegError::ImageProcessing {
                    path: path.display().to_string(),
                    operation: format!("{kind} image save"),
                    source: Box::new(e),
                })?;
        }
        Ok(())
    }

    pub fn summary(&self) -> Summary {
        Summary {
            prediction: self.prediction,
            confidence: self.confidence.clone(),
            tumor_area: self.tumor_area.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub signal: DisplaySignal,
    pub bundle: Arc<ResultBundle>,
}

/// Run one image through the model and the post-processing pipeline, then
/// write the report. Nothing is written unless every earlier step succeeded.
pub fn analyze<M: SegmentationModel + ?Sized>(
    model: &M,
    image: &DynamicImage,
    report_path: &Path,
) -> Result<ResultBundle> {
    let resized = pipeline::resize(&image.to_rgb8(), model.image_size());
    let probabilities = model.infer(&resized)?;
    let analysis = pipeline::postprocess(&resized, &probabilities)?;

    report::write(report_path, &analysis.summary)?;

    Ok(ResultBundle {
        overlay: analysis.overlay,
        mask: analysis.mask_image,
        original: image.to_rgb8(),
        prediction: analysis.summary.prediction,
        confidence: analysis.summary.confidence,
        tumor_area: analysis.summary.tumor_area,
        statistics: analysis.statistics,
        report_path: report_path.to_path_buf(),
    })
}

/// Per-user state of the service: the pending input image and the results on
/// display.
pub struct Session<M> {
    model: Arc<ModelHandle<M>>,
    report_path: PathBuf,
    input: Option<DynamicImage>,
    displayed: Option<Arc<ResultBundle>>,
}

impl<M: SegmentationModel> Session<M> {
    pub fn new(model: Arc<ModelHandle<M>>, report_path: impl Into<PathBuf>) -> Self {
        Self {
            model,
            report_path: report_path.into(),
            input: None,
            displayed: None,
        }
    }

    pub fn model_available(&self) -> bool {
        self.model.is_available()
    }

    pub fn report_path(&self) -> &Path {
        &self.report_path
    }

    pub fn set_input(&mut self, image: DynamicImage) {
        self.input = Some(image);
    }

    pub fn input(&self) -> Option<&DynamicImage> {
        self.input.as_ref()
    }

    pub fn results_visible(&self) -> bool {
        self.displayed.is_some()
    }

    pub fn last_result(&self) -> Option<Arc<ResultBundle>> {
        self.displayed.clone()
    }

    /// Analyze the stored input.
    ///
    /// Fails without touching any state when the model is unavailable or no
    /// image has been provided.
    pub fn submit(&mut self) -> Result<Submission> {
        let model = self.model.get()?;
        let image = self.input.as_ref().ok_or(NeuroSegError::MissingImage)?;

        let bundle = Arc::new(analyze(model, image, &self.report_path)?);
        info!(
            prediction = %bundle.prediction,
            confidence = %bundle.confidence,
            tumor_area = %bundle.tumor_area,
            "analysis complete"
        );

        self.displayed = Some(Arc::clone(&bundle));
        Ok(Submission {
            signal: DisplaySignal::ShowResults,
            bundle,
        })
    }

    /// Hide results and forget the input image. The report file stays.
    pub fn clear(&mut self) -> DisplaySignal {
        debug!("clearing session");
        self.input = None;
        self.displayed = None;
        DisplaySignal::HideResults
    }
}
