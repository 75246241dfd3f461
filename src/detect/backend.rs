use std::path::Path;

use anyhow::anyhow;

use crate::detect::result::BoundingBox;
use crate::error::PipelineError;

/// Object detector backend.
///
/// The detector is a black box: it receives encoded image bytes and returns
/// boxes in absolute pixel coordinates of that image. It is constructed once
/// and handed to the pipeline; there is no process-wide instance.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run detection on an encoded image.
    ///
    /// Upstream failures map to `PipelineError::DetectionService`.
    fn detect(&mut self, image_bytes: &[u8]) -> Result<Vec<BoundingBox>, PipelineError>;
}

/// Read an image from local storage and run it through `detector`.
pub fn detect_image(
    detector: &mut dyn Detector,
    image_path: &Path,
) -> Result<Vec<BoundingBox>, PipelineError> {
    if !image_path.exists() {
        return Err(PipelineError::ImageNotFound(
            image_path.display().to_string(),
        ));
    }
    let bytes = std::fs::read(image_path)
        .map_err(|e| anyhow!("failed to read image {}: {}", image_path.display(), e))?;
    log::debug!(
        "running {} detector on {} ({} bytes)",
        detector.name(),
        image_path.display(),
        bytes.len()
    );
    let boxes = detector.detect(&bytes)?;
    log::debug!("{} detector returned {} boxes", detector.name(), boxes.len());
    Ok(boxes)
}
