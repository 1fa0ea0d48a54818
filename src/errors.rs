use std::path::PathBuf;
use thiserror::Error;

type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the segmentation service.
///
/// Each variant carries the context of its own domain (filesystem, image
/// processing, model operations, request validation) so callers can match on
/// the failure instead of parsing messages. [`NeuroSegError::category`] folds
/// the variants into the three request-level outcomes the service reports.
#[derive(Error, Debug)]
pub enum NeuroSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("Model is not loaded: {reason}")]
    ModelUnavailable { reason: String },

    #[error("Please upload an image before submitting")]
    MissingImage,
}

pub type Result<T> = std::result::Result<T, NeuroSegError>;

/// Request-level classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The process could not become ready to serve (model artifact, config).
    Startup,
    /// The caller's request cannot be served as sent.
    UserInput,
    /// Something broke while analyzing an otherwise valid request.
    Pipeline,
}

impl NeuroSegError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration { .. } => ErrorCategory::Startup,
            Self::MissingImage | Self::ModelUnavailable { .. } | Self::Validation { .. } => {
                ErrorCategory::UserInput
            }
            Self::FileSystem { .. } | Self::ImageProcessing { .. } | Self::Model { .. } => {
                ErrorCategory::Pipeline
            }
        }
    }

    pub(crate) fn model(operation: impl Into<String>, source: impl Into<BoxedSource>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn invalid_data(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::model(
            operation,
            std::io::Error::new(std::io::ErrorKind::InvalidData, message.into()),
        )
    }
}

/// Fallback for I/O errors raised without path context. Code that knows the
/// path should build [`NeuroSegError::FileSystem`] itself.
impl From<std::io::Error> for NeuroSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// `anyhow` only surfaces from the pixel helpers in `imageops_ai`.
impl From<anyhow::Error> for NeuroSegError {
    fn from(err: anyhow::Error) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "pixel operation".to_string(),
            source: err.into(),
        }
    }
}

impl From<image::ImageError> for NeuroSegError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for NeuroSegError {
    fn from(err: ort::Error) -> Self {
        Self::model("ort operation", err)
    }
}

/// Shape errors come out of tensor reshaping around inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for NeuroSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::model("tensor shape conversion", err)
    }
}
