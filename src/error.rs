//! Error types for the prediction pipeline.

use thiserror::Error;

/// Request-level failures.
///
/// Item-level problems during crop emission are not errors; they are
/// reported as `CropOutcome` values and never abort a request.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("image not found: {0}")]
    ImageNotFound(String),

    #[error("detection service error: {}", upstream_detail(.status, .detail))]
    DetectionService { status: Option<u16>, detail: String },

    #[error("file must be an image (content type '{0}')")]
    InvalidImageFormat(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub(crate) fn malformed_response(detail: impl Into<String>) -> Self {
        PipelineError::DetectionService {
            status: None,
            detail: format!("malformed detection response: {}", detail.into()),
        }
    }
}

fn upstream_detail(status: &Option<u16>, detail: &str) -> String {
    match status {
        Some(code) => format!("upstream status {}: {}", code, detail),
        None => detail.to_string(),
    }
}
