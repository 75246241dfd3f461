//! Per-request prediction pipeline.
//!
//! `Received -> Detecting -> Pairing -> Emitting -> Done`. A failure while
//! detecting fails the request. Failures while emitting are contained per
//! candidate and the request still completes.

use std::path::Path;

use anyhow::anyhow;
use serde::Serialize;

use crate::crop::{CropStore, EvidenceImage};
use crate::detect::{detect_image, BoundingBox, Detector};
use crate::emit::{emit, CropOutcome, EmitReport};
use crate::error::PipelineError;
use crate::pairing::pair;
use crate::storage::ViolationStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Detecting,
    Pairing,
    Emitting,
    Done,
}

/// Outcome of one prediction request.
#[derive(Clone, Debug, Serialize)]
pub struct PredictionReport {
    pub status: &'static str,
    pub image_id: String,
    pub predictions: Vec<BoundingBox>,
    /// Paths of the crop files written for recorded violations.
    pub cropped_images: Vec<String>,
    pub message: String,
    #[serde(skip)]
    pub outcomes: Vec<CropOutcome>,
}

/// Runs the pipeline with an injected detector.
pub struct PredictionService {
    detector: Box<dyn Detector>,
}

impl PredictionService {
    pub fn new(detector: Box<dyn Detector>) -> Self {
        Self { detector }
    }

    pub fn detector_name(&self) -> &'static str {
        self.detector.name()
    }

    /// Predict violations for a stored image.
    pub fn predict_image(
        &mut self,
        image_id: &str,
        store: &mut dyn ViolationStore,
        crops: &mut dyn CropStore,
    ) -> Result<PredictionReport, PipelineError> {
        let mut stage = PipelineStage::Received;
        log::debug!("prediction {}: {:?}", image_id, stage);

        let image = store
            .get_image(image_id)?
            .ok_or_else(|| PipelineError::ImageNotFound(image_id.to_string()))?;
        let image_path = Path::new(&image.filepath);

        stage = advance(image_id, stage, PipelineStage::Detecting);
        let boxes = detect_image(self.detector.as_mut(), image_path)?;
        store
            .record_predictions(image_id, &boxes)
            .map_err(|e| anyhow!("failed to store predictions for {}: {:#}", image_id, e))?;

        stage = advance(image_id, stage, PipelineStage::Pairing);
        let candidates = pair(&boxes);
        log::info!(
            "image {}: {} boxes, {} drivers without helmet",
            image_id,
            boxes.len(),
            candidates.len()
        );

        stage = advance(image_id, stage, PipelineStage::Emitting);
        let report = if candidates.is_empty() {
            EmitReport::default()
        } else {
            match EvidenceImage::open(image_path) {
                Ok(evidence) => emit(image_id, &evidence, &candidates, crops, store),
                Err(err) => {
                    log::error!("cannot open {} for cropping: {}", image_path.display(), err);
                    EmitReport::all_failed(&candidates, &err.to_string())
                }
            }
        };

        advance(image_id, stage, PipelineStage::Done);
        let message = summary_message(boxes.len(), &report);
        Ok(PredictionReport {
            status: "success",
            image_id: image_id.to_string(),
            predictions: boxes,
            cropped_images: report
                .written
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            message,
            outcomes: report.outcomes,
        })
    }
}

fn advance(image_id: &str, from: PipelineStage, to: PipelineStage) -> PipelineStage {
    log::debug!("prediction {}: {:?} -> {:?}", image_id, from, to);
    to
}

fn summary_message(detected: usize, report: &EmitReport) -> String {
    let mut message = format!(
        "Detected {} objects, recorded {} violations",
        detected,
        report.recorded()
    );
    let skipped = report.skipped();
    let failed = report.failed();
    if skipped > 0 || failed > 0 {
        message.push_str(&format!(" ({} skipped, {} failed)", skipped, failed));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crop::FilesystemCropStore;
    use crate::detect::StubDetector;
    use crate::storage::{ImageRecord, InMemoryViolationStore};
    use image::{DynamicImage, ImageFormat};

    fn store_with_image(path: &Path) -> InMemoryViolationStore {
        let mut store = InMemoryViolationStore::new();
        store
            .insert_image(&ImageRecord {
                id: "img-1".to_string(),
                filename: "img-1.png".to_string(),
                filepath: path.display().to_string(),
                content_type: "image/png".to_string(),
                size: 0,
                upload_time: 0,
                predictions: None,
            })
            .unwrap();
        store
    }

    #[test]
    fn unknown_image_id_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut service = PredictionService::new(Box::new(StubDetector::default()));
        let mut store = InMemoryViolationStore::new();
        let mut crops = FilesystemCropStore::new(dir.path(), "http://x");
        let err = service
            .predict_image("nope", &mut store, &mut crops)
            .unwrap_err();
        assert!(matches!(err, PipelineError::ImageNotFound(_)));
    }

    #[test]
    fn detector_failure_fails_request_without_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img-1.png");
        DynamicImage::new_rgb8(64, 64)
            .save_with_format(&path, ImageFormat::Png)
            .unwrap();
        let mut store = store_with_image(&path);
        let mut crops = FilesystemCropStore::new(dir.path().join("crops"), "http://x");
        let mut service =
            PredictionService::new(Box::new(StubDetector::unavailable(502, "bad gateway")));

        let err = service
            .predict_image("img-1", &mut store, &mut crops)
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::DetectionService {
                status: Some(502),
                ..
            }
        ));
        assert_eq!(store.count_violations().unwrap(), 0);
        assert!(store.get_image("img-1").unwrap().unwrap().predictions.is_none());
    }

    #[test]
    fn undecodable_image_reports_failures_but_completes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img-1.png");
        std::fs::write(&path, b"garbage").unwrap();
        let mut store = store_with_image(&path);
        let mut crops = FilesystemCropStore::new(dir.path().join("crops"), "http://x");
        let boxes = vec![BoundingBox::new(10.0, 10.0, 4.0, 4.0, 0.9, "driver")];
        let mut service = PredictionService::new(Box::new(StubDetector::new(boxes)));

        let report = service
            .predict_image("img-1", &mut store, &mut crops)
            .unwrap();
        assert!(report.cropped_images.is_empty());
        assert_eq!(report.outcomes.len(), 1);
        assert!(report.message.contains("1 failed"));
        assert_eq!(store.count_violations().unwrap(), 0);
    }

    #[test]
    fn no_candidates_skips_emission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img-1.png");
        std::fs::write(&path, b"never decoded").unwrap();
        let mut store = store_with_image(&path);
        let mut crops = FilesystemCropStore::new(dir.path().join("crops"), "http://x");
        let boxes = vec![
            BoundingBox::new(10.0, 10.0, 4.0, 4.0, 0.9, "driver"),
            BoundingBox::new(12.0, 8.0, 4.0, 4.0, 0.9, "helmet"),
        ];
        let mut service = PredictionService::new(Box::new(StubDetector::new(boxes)));

        let report = service
            .predict_image("img-1", &mut store, &mut crops)
            .unwrap();
        assert_eq!(report.predictions.len(), 2);
        assert!(report.outcomes.is_empty());
        assert_eq!(report.message, "Detected 2 objects, recorded 0 violations");
        assert!(!dir.path().join("crops").exists());
    }
}
