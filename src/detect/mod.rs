mod backend;
mod backends;
mod result;

pub use backend::{detect_image, Detector};
pub use backends::{build_detector, HttpDetector, HttpDetectorConfig, StubDetector};
pub use result::{parse_detection_response, BoundingBox, DRIVER_CLASS, HELMET_CLASS};
