pub mod config;
pub mod errors;
pub mod imageops_ai;
pub mod model;
pub mod pipeline;
pub mod report;
pub mod server;
pub mod session;
pub mod traits;

pub mod mocks;

use image::{DynamicImage, ImageFormat};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use walkdir::WalkDir;

pub use config::Config;
pub use errors::{ErrorCategory, NeuroSegError, Result};
pub use model::{Model, ModelHandle};
pub use pipeline::{Prediction, ProbabilityMap, Summary};
pub use session::{DisplaySignal, ResultBundle, Session, Submission};
pub use traits::*;

/// Outcome for one image of a batch run.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub input: PathBuf,
    pub summary: Summary,
}

/// Analyzes every supported image below `input_dir`.
///
/// Each image gets its own overlay, mask and report under `output_dir`,
/// mirroring the input tree.
pub struct BatchAnalyzer<M: SegmentationModel> {
    model: M,
    input_dir: PathBuf,
    output_dir: PathBuf,
}

impl<M: SegmentationModel> BatchAnalyzer<M> {
    pub fn new(model: M, input_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            model,
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
        }
    }

    pub fn process_directory(&self) -> Result<Vec<BatchEntry>> {
        if !self.input_dir.exists() {
            return Err(NeuroSegError::FileSystem {
                path: self.input_dir.clone(),
                operation: "input directory check".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "input directory does not exist",
                ),
            });
        }

        fs::create_dir_all(&self.output_dir).map_err(|e| NeuroSegError::FileSystem {
            path: self.output_dir.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let image_files = self.collect_image_files();
        if image_files.is_empty() {
            warn!(input_dir = %self.input_dir.display(), "no images to analyze");
            return Ok(Vec::new());
        }
        info!(count = image_files.len(), "analyzing images");

        let pb = ProgressBar::new(image_files.len() as u64);
        pb.set_style(
            ProgressStyle::with_template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
            )
            .map_err(|e| NeuroSegError::Configuration {
                message: e.to_string(),
            })?
            .progress_chars("#>-"),
        );

        let mut entries = image_files
            .par_iter()
            .progress_with(pb.clone())
            .map(|input_file| self.process_single_image(input_file))
            .collect::<Result<Vec<_>>>()?;
        pb.finish();

        entries.sort_by(|a, b| a.input.cmp(&b.input));
        Ok(entries)
    }

    fn collect_image_files(&self) -> Vec<PathBuf> {
        WalkDir::new(&self.input_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && is_supported_image_format(e.path()))
            .map(|e| e.into_path())
            .collect()
    }

    fn process_single_image(&self, input_file: &Path) -> Result<BatchEntry> {
        let img = open_image(input_file)?;

        let relative_path = self.get_relative_path(input_file)?;
        let output_dir = self
            .output_dir
            .join(relative_path.parent().unwrap_or(Path::new("")));
        fs::create_dir_all(&output_dir).map_err(|e| NeuroSegError::FileSystem {
            path: output_dir.clone(),
            operation: "output directory creation".to_string(),
            source: e,
        })?;

        let prefix = output_prefix(input_file);
        let report_path = output_dir.join(format!("{prefix}report.txt"));

        let bundle = session::analyze(&self.model, &img, &report_path)?;
        bundle.save_images(&output_dir, &prefix)?;

        Ok(BatchEntry {
            input: input_file.to_path_buf(),
            summary: bundle.summary(),
        })
    }

    pub fn get_relative_path(&self, input_file: &Path) -> Result<PathBuf> {
        input_file
            .strip_prefix(&self.input_dir)
            .map(|p| p.to_path_buf())
            .map_err(|_| NeuroSegError::FileSystem {
                path: input_file.to_path_buf(),
                operation: "relative path lookup".to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "input file is not inside the input directory",
                ),
            })
    }
}

/// Output file prefix for a batch input. `scan.png` gives `scan_png_`, so
/// inputs that differ only by extension keep separate outputs.
fn output_prefix(input_file: &Path) -> String {
    let stem = input_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    match input_file.extension() {
        Some(ext) => format!("{stem}_{}_", ext.to_string_lossy()),
        None => format!("{stem}_"),
    }
}

/// Analyze one image file, writing `overlay.png`, `mask.png` and
/// `original.png` into `output_dir` and the report to `report_path`.
pub fn analyze_image<M: SegmentationModel>(
    model: Arc<ModelHandle<M>>,
    image_path: &Path,
    output_dir: &Path,
    report_path: &Path,
) -> Result<Arc<ResultBundle>> {
    model.get()?;
    let image = open_image(image_path)?;
    fs::create_dir_all(output_dir).map_err(|e| NeuroSegError::FileSystem {
        path: output_dir.to_path_buf(),
        operation: "output directory creation".to_string(),
        source: e,
    })?;

    let mut session = Session::new(model, report_path);
    session.set_input(image);
    let bundle = session.submit()?.bundle;
    bundle.save_images(output_dir, "")?;
    Ok(bundle)
}

/// Whether `path` has an extension the enabled image decoders can read.
pub fn is_supported_image_format(path: &Path) -> bool {
    ImageFormat::from_path(path).is_ok_and(|format| format.reading_enabled())
}

pub fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| NeuroSegError::ImageProcessing {
        path: path.display().to_string(),
        operation: "image load".to_string(),
        source: Box::new(e),
    })
}
