//! Crop and record emission.
//!
//! Each violation candidate is handled independently: a failure for one
//! driver is logged and reported in the `EmitReport`, and processing moves
//! on to the next driver. A crop file is only kept when its violation record
//! was created.

use std::path::PathBuf;

use crate::crop::{CropRect, CropStore, CropTask, EvidenceImage};
use crate::pairing::Candidate;
use crate::storage::{NewViolation, ViolationStore};

/// Violation type code for a rider without a helmet.
pub const NO_HELMET_VIOLATION: i64 = 1;

/// What happened to one candidate.
#[derive(Clone, Debug, PartialEq)]
pub enum CropOutcome {
    Recorded {
        index: usize,
        path: PathBuf,
        image_url: String,
        violation_id: i64,
    },
    CropSkipped {
        index: usize,
        rect: CropRect,
    },
    CropWriteFailure {
        index: usize,
        reason: String,
    },
    RecordPersistError {
        index: usize,
        reason: String,
    },
}

impl CropOutcome {
    pub fn index(&self) -> usize {
        match self {
            CropOutcome::Recorded { index, .. }
            | CropOutcome::CropSkipped { index, .. }
            | CropOutcome::CropWriteFailure { index, .. }
            | CropOutcome::RecordPersistError { index, .. } => *index,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, CropOutcome::Recorded { .. })
    }
}

/// Result of emitting one batch of candidates.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EmitReport {
    /// Crop files written and backed by a violation record, in candidate order.
    pub written: Vec<PathBuf>,
    pub outcomes: Vec<CropOutcome>,
}

impl EmitReport {
    pub fn recorded(&self) -> usize {
        self.written.len()
    }

    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, CropOutcome::CropSkipped { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    CropOutcome::CropWriteFailure { .. } | CropOutcome::RecordPersistError { .. }
                )
            })
            .count()
    }

    /// Record a failure for every candidate, used when the source image
    /// cannot be opened at all.
    pub(crate) fn all_failed(candidates: &[Candidate], reason: &str) -> Self {
        Self {
            written: Vec::new(),
            outcomes: candidates
                .iter()
                .map(|c| CropOutcome::CropWriteFailure {
                    index: c.index,
                    reason: reason.to_string(),
                })
                .collect(),
        }
    }
}

/// Crop, save and record every candidate of one image.
pub fn emit(
    image_id: &str,
    image: &EvidenceImage,
    candidates: &[Candidate],
    crops: &mut dyn CropStore,
    store: &mut dyn ViolationStore,
) -> EmitReport {
    let mut report = EmitReport::default();
    for candidate in candidates {
        let task = CropTask::plan(image_id, candidate, image.width(), image.height());
        let outcome = emit_one(image_id, image, &task, crops, store);
        if let CropOutcome::Recorded { path, .. } = &outcome {
            report.written.push(path.clone());
        }
        report.outcomes.push(outcome);
    }
    report
}

fn emit_one(
    image_id: &str,
    image: &EvidenceImage,
    task: &CropTask,
    crops: &mut dyn CropStore,
    store: &mut dyn ViolationStore,
) -> CropOutcome {
    let index = task.candidate.index;
    if task.rect.is_degenerate() {
        log::warn!(
            "skipping crop {} for image {}: rectangle {:?} is empty after clamping to {}x{}",
            index,
            image_id,
            task.rect,
            image.width(),
            image.height()
        );
        return CropOutcome::CropSkipped {
            index,
            rect: task.rect,
        };
    }

    let saved = image
        .crop(&task.rect)
        .and_then(|crop| crops.save(&crop, &task.filename));
    let path = match saved {
        Ok(path) => path,
        Err(err) => {
            log::error!(
                "failed to write crop {} for image {}: {:#}",
                task.filename,
                image_id,
                err
            );
            return CropOutcome::CropWriteFailure {
                index,
                reason: format!("{:#}", err),
            };
        }
    };

    let image_url = crops.public_url(&task.filename);
    let violation = NewViolation {
        image_id: image_id.to_string(),
        violation_type: NO_HELMET_VIOLATION,
        image_url: image_url.clone(),
    };
    match store.record_violation(&violation) {
        Ok(violation_id) => {
            log::info!(
                "recorded violation {} for image {} driver {} -> {}",
                violation_id,
                image_id,
                index,
                path.display()
            );
            CropOutcome::Recorded {
                index,
                path,
                image_url,
                violation_id,
            }
        }
        Err(err) => {
            log::error!(
                "failed to record violation for {}: {:#}",
                task.filename,
                err
            );
            if let Err(remove_err) = crops.remove(&task.filename) {
                log::error!(
                    "failed to remove orphaned crop {}: {:#}",
                    task.filename,
                    remove_err
                );
            }
            CropOutcome::RecordPersistError {
                index,
                reason: format!("{:#}", err),
            }
        }
    }
}
