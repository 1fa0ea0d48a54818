use std::fs;
use std::path::Path;

use crate::errors::{NeuroSegError, Result};
use crate::pipeline::Summary;

/// Plain-text report offered for download after each analysis.
pub fn render(summary: &Summary) -> String {
    format!(
        "Analysis Report\n{}\nPrediction: {}\nConfidence: {}\nTumor Area: {}\n",
        "=".repeat(17),
        summary.prediction,
        summary.confidence,
        summary.tumor_area
    )
}

/// Write the report to `path`, replacing whatever is there.
pub fn write(path: &Path, summary: &Summary) -> Result<()> {
    fs::write(path, render(summary)).map_err(|e| NeuroSegError::FileSystem {
        path: path.to_path_buf(),
        operation: "report write".to_string(),
        source: e,
    })
}
