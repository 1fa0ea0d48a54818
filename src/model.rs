use std::error::Error as _;
use std::path::Path;

use crate::{
    errors::{NeuroSegError, Result},
    pipeline::{normalize, ProbabilityMap, IMAGE_SIZE},
    traits::SegmentationModel,
};
use image::RgbImage;
use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{error, info};

/// Where the channel axis sits in the model's input tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    /// `[1, 3, H, W]`
    ChannelsFirst,
    /// `[1, H, W, 3]`, what Keras exports produce.
    ChannelsLast,
}

impl TensorLayout {
    /// Work out the layout and spatial size from a declared input shape.
    ///
    /// Dynamic spatial dimensions (`-1`) are taken to be [`IMAGE_SIZE`].
    pub fn detect(dims: &[i64]) -> Result<(Self, u32)> {
        let (layout, size) = match dims {
            [_, h, w, 3] if h == w || *h < 0 || *w < 0 => (Self::ChannelsLast, (*h).max(*w)),
            [_, 3, h, w] if h == w || *h < 0 || *w < 0 => (Self::ChannelsFirst, (*h).max(*w)),
            _ => {
                return Err(NeuroSegError::invalid_data(
                    "model input shape detection",
                    format!("expected a square 3-channel input, got {dims:?}"),
                ))
            }
        };

        let size = if size < 0 { IMAGE_SIZE } else { size as u32 };
        if size != IMAGE_SIZE {
            return Err(NeuroSegError::invalid_data(
                "model input shape detection",
                format!("model expects {size}x{size} input, only {IMAGE_SIZE}x{IMAGE_SIZE} is supported"),
            ));
        }
        Ok((layout, size))
    }

    /// Add the batch axis (and move channels if needed) to a `[3, H, W]` tensor.
    pub fn batch(self, chw: Array3<f32>) -> Array4<f32> {
        match self {
            Self::ChannelsFirst => chw.insert_axis(Axis(0)),
            Self::ChannelsLast => chw.permuted_axes([1, 2, 0]).insert_axis(Axis(0)),
        }
    }
}

/// Strip the batch and channel axes from a raw model output.
pub fn probability_map_from_output(output: ArrayViewD<f32>, size: u32) -> Result<ProbabilityMap> {
    let n = size as usize;
    let spatial: Vec<usize> = output.shape().iter().copied().filter(|&d| d != 1).collect();
    if output.len() != n * n || (n > 1 && spatial != [n, n]) {
        return Err(NeuroSegError::invalid_data(
            "model output conversion",
            format!("expected a single {n}x{n} mask, got shape {:?}", output.shape()),
        ));
    }
    Ok(ProbabilityMap::from_shape_vec(
        (n, n),
        output.iter().copied().collect(),
    )?)
}

/// ONNX Runtime backed segmentation model.
pub struct Model {
    pub image_size: u32,
    layout: TensorLayout,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

impl Model {
    pub fn new(model_path: &Path, device_id: i32) -> Result<Self> {
        let mut session = SessionBuilder::new()
            .map_err(|e| NeuroSegError::model("session builder init", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| NeuroSegError::model("execution provider setup", e))?
            .with_memory_pattern(true)
            .map_err(|e| NeuroSegError::model("memory pattern setup", e))?
            .commit_from_file(model_path)
            .map_err(|e| {
                NeuroSegError::model(format!("model file load: {}", model_path.display()), e)
            })?;

        let input = session.inputs.first().ok_or_else(|| {
            NeuroSegError::invalid_data("model input lookup", "model declares no inputs")
        })?;
        let dims: Vec<i64> = input
            .input_type
            .tensor_shape()
            .ok_or_else(|| {
                NeuroSegError::invalid_data("model input shape lookup", "input is not a tensor")
            })?
            .iter()
            .copied()
            .collect();
        let (layout, image_size) = TensorLayout::detect(&dims)?;
        let input_name = input.name.clone();

        let output_name = session
            .outputs
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| {
                NeuroSegError::invalid_data("model output lookup", "model declares no outputs")
            })?;

        // warm up
        let data = layout.batch(Array3::<f32>::zeros((3, image_size as usize, image_size as usize)));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data.as_standard_layout())
                .map_err(|e| NeuroSegError::model("warm-up tensor creation", e))?])
            .map_err(|e| NeuroSegError::model("warm-up run", e))?;

        Ok(Self {
            image_size,
            layout,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }

    pub fn predict(&self, tensor: ArrayView4<f32>) -> Result<ArrayD<f32>> {
        let mut binding = self.session.lock();
        let outputs = binding.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?
        ])?;
        let mask = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .to_owned();
        Ok(mask)
    }
}

impl SegmentationModel for Model {
    fn image_size(&self) -> u32 {
        self.image_size
    }

    fn infer(&self, image: &RgbImage) -> Result<ProbabilityMap> {
        if image.dimensions() != (self.image_size, self.image_size) {
            return Err(NeuroSegError::invalid_data(
                "inference input check",
                format!(
                    "image is {:?}, model expects {}x{}",
                    image.dimensions(),
                    self.image_size,
                    self.image_size
                ),
            ));
        }

        let tensor = self.layout.batch(normalize(image));
        let output = self.predict(tensor.view())?;
        probability_map_from_output(output.view(), self.image_size)
    }
}

/// Process-wide model handle.
///
/// Loaded once before serving; when loading fails the handle stays
/// `Unavailable` and every request fails fast with the recorded reason.
pub enum ModelHandle<M> {
    Ready(M),
    Unavailable { reason: String },
}

impl<M: SegmentationModel> ModelHandle<M> {
    pub fn get(&self) -> Result<&M> {
        match self {
            Self::Ready(model) => Ok(model),
            Self::Unavailable { reason } => Err(NeuroSegError::ModelUnavailable {
                reason: reason.clone(),
            }),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn into_inner(self) -> Result<M> {
        match self {
            Self::Ready(model) => Ok(model),
            Self::Unavailable { reason } => Err(NeuroSegError::ModelUnavailable { reason }),
        }
    }
}

impl ModelHandle<Model> {
    pub fn load(model_path: &Path, device_id: i32) -> Self {
        if !model_path.exists() {
            let reason = format!("model file {} does not exist", model_path.display());
            error!(path = %model_path.display(), "failed to load model: {reason}");
            return Self::Unavailable { reason };
        }

        match Model::new(model_path, device_id) {
            Ok(model) => {
                info!(path = %model_path.display(), image_size = model.image_size, layout = ?model.layout, "model loaded");
                Self::Ready(model)
            }
            Err(e) => {
                let reason = error_chain(&e);
                error!(path = %model_path.display(), "failed to load model: {reason}");
                Self::Unavailable { reason }
            }
        }
    }
}

fn error_chain(err: &NeuroSegError) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
