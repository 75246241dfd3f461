pub mod remote;
pub mod stub;

use std::path::Path;

use anyhow::Result;

use crate::config::DetectorSettings;
use crate::detect::backend::Detector;

pub use remote::{HttpDetector, HttpDetectorConfig};
pub use stub::StubDetector;

/// Build the detector named by the configured URL.
///
/// `stub://` yields a stub with no boxes; `stub:///path/boxes.json` loads the
/// fixed box list from that file. Anything else is a hosted endpoint.
pub fn build_detector(settings: &DetectorSettings) -> Result<Box<dyn Detector>> {
    if let Some(rest) = settings.url.strip_prefix("stub://") {
        if rest.is_empty() {
            log::warn!("using stub detector with no boxes");
            return Ok(Box::new(StubDetector::default()));
        }
        log::warn!("using stub detector with boxes from {}", rest);
        return Ok(Box::new(StubDetector::from_file(Path::new(rest))?));
    }
    let detector = HttpDetector::new(HttpDetectorConfig {
        url: settings.url.clone(),
        api_key: settings.api_key.clone(),
        timeout: settings.timeout,
    })?;
    log::info!("using hosted detector at {}", detector.endpoint_display());
    Ok(Box::new(detector))
}
