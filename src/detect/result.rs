use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Class label of a motorcycle rider.
pub const DRIVER_CLASS: &str = "driver";
/// Class label of a helmet.
pub const HELMET_CLASS: &str = "helmet";

/// A detected object in absolute pixel coordinates.
///
/// `x` and `y` are the box center, not its top-left corner.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
    pub class_name: String,
}

impl BoundingBox {
    pub fn new(
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        confidence: f64,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            x,
            y,
            width,
            height,
            confidence,
            class_name: class_name.into(),
        }
    }

    pub fn is_driver(&self) -> bool {
        self.class_name == DRIVER_CLASS
    }

    pub fn is_helmet(&self) -> bool {
        self.class_name == HELMET_CLASS
    }

    /// Euclidean distance between the two box centers.
    pub fn center_distance(&self, other: &BoundingBox) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

/// Response body of the hosted detection endpoint.
#[derive(Debug, Deserialize)]
struct DetectionResponse {
    predictions: Vec<WirePrediction>,
}

#[derive(Debug, Deserialize)]
struct WirePrediction {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    confidence: f64,
    #[serde(rename = "class")]
    class_name: String,
}

impl From<WirePrediction> for BoundingBox {
    fn from(p: WirePrediction) -> Self {
        BoundingBox {
            x: p.x,
            y: p.y,
            width: p.width,
            height: p.height,
            confidence: p.confidence,
            class_name: p.class_name,
        }
    }
}

/// Parse a detection response body.
///
/// Every element of `predictions` becomes one box. A missing or mistyped
/// field fails the whole response.
pub fn parse_detection_response(body: &[u8]) -> Result<Vec<BoundingBox>, PipelineError> {
    let response: DetectionResponse = serde_json::from_slice(body)
        .map_err(|e| PipelineError::malformed_response(e.to_string()))?;
    Ok(response
        .predictions
        .into_iter()
        .map(BoundingBox::from)
        .collect())
}
