use std::path::Path;

use anyhow::{anyhow, Result};

use crate::detect::backend::Detector;
use crate::detect::result::BoundingBox;
use crate::error::PipelineError;

#[derive(Clone, Debug)]
enum StubResponse {
    Boxes(Vec<BoundingBox>),
    Unavailable { status: u16, detail: String },
}

/// Stub detector for tests and offline runs. Returns a fixed box list.
#[derive(Clone, Debug)]
pub struct StubDetector {
    response: StubResponse,
    calls: u64,
}

impl StubDetector {
    pub fn new(boxes: Vec<BoundingBox>) -> Self {
        Self {
            response: StubResponse::Boxes(boxes),
            calls: 0,
        }
    }

    /// A detector that always fails with the given upstream status.
    pub fn unavailable(status: u16, detail: impl Into<String>) -> Self {
        Self {
            response: StubResponse::Unavailable {
                status,
                detail: detail.into(),
            },
            calls: 0,
        }
    }

    /// Load the fixed box list from a JSON array of boxes.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read stub boxes {}: {}", path.display(), e))?;
        let boxes: Vec<BoundingBox> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid stub boxes {}: {}", path.display(), e))?;
        Ok(Self::new(boxes))
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, image_bytes: &[u8]) -> Result<Vec<BoundingBox>, PipelineError> {
        self.calls += 1;
        if image_bytes.is_empty() {
            return Err(PipelineError::DetectionService {
                status: Some(400),
                detail: "empty image payload".to_string(),
            });
        }
        match &self.response {
            StubResponse::Boxes(boxes) => Ok(boxes.clone()),
            StubResponse::Unavailable { status, detail } => Err(PipelineError::DetectionService {
                status: Some(*status),
                detail: detail.clone(),
            }),
        }
    }
}
