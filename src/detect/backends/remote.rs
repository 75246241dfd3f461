//! Hosted inference endpoint backend.
//!
//! The endpoint accepts a base64-encoded image as an
//! `application/x-www-form-urlencoded` body, authenticated by an `api_key`
//! query parameter, and answers with a JSON document holding a
//! `predictions` array of center-based boxes.

use std::io::Read;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::Url;

use crate::detect::backend::Detector;
use crate::detect::result::{parse_detection_response, BoundingBox};
use crate::error::PipelineError;

const MAX_RESPONSE_BYTES: u64 = 4 * 1024 * 1024;
const MAX_ERROR_DETAIL_CHARS: usize = 512;

/// Configuration for the hosted detector.
#[derive(Clone, Debug)]
pub struct HttpDetectorConfig {
    /// Model endpoint, e.g. `https://detect.roboflow.com/helm-motor-siter/2`.
    pub url: String,
    pub api_key: String,
    pub timeout: Duration,
}

/// Detector backed by a remote HTTP inference endpoint.
pub struct HttpDetector {
    endpoint: Url,
    agent: ureq::Agent,
}

impl HttpDetector {
    pub fn new(config: HttpDetectorConfig) -> Result<Self> {
        let mut endpoint = Url::parse(&config.url).context("parse detector url")?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => {
                return Err(anyhow!(
                    "unsupported detector scheme '{}'; expected http(s)",
                    other
                ))
            }
        }
        if !config.api_key.is_empty() {
            endpoint
                .query_pairs_mut()
                .append_pair("api_key", &config.api_key);
        }
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Ok(Self { endpoint, agent })
    }

    /// Endpoint without the api key, for diagnostics.
    pub fn endpoint_display(&self) -> String {
        let mut shown = self.endpoint.clone();
        shown.set_query(None);
        shown.to_string()
    }
}

impl Detector for HttpDetector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect(&mut self, image_bytes: &[u8]) -> Result<Vec<BoundingBox>, PipelineError> {
        let encoded = STANDARD.encode(image_bytes);
        let response = self
            .agent
            .post(self.endpoint.as_str())
            .set("Content-Type", "application/x-www-form-urlencoded")
            .send_string(&encoded);

        match response {
            Ok(response) => {
                let mut body = Vec::new();
                response
                    .into_reader()
                    .take(MAX_RESPONSE_BYTES)
                    .read_to_end(&mut body)
                    .map_err(|e| PipelineError::DetectionService {
                        status: None,
                        detail: format!("failed to read detector response: {}", e),
                    })?;
                parse_detection_response(&body)
            }
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                log::warn!(
                    "detector {} returned status {}",
                    self.endpoint_display(),
                    status
                );
                Err(PipelineError::DetectionService {
                    status: Some(status),
                    detail: truncate_detail(&body),
                })
            }
            Err(ureq::Error::Transport(transport)) => {
                log::warn!(
                    "detector {} unreachable: {}",
                    self.endpoint_display(),
                    transport
                );
                Err(PipelineError::DetectionService {
                    status: None,
                    detail: transport.to_string(),
                })
            }
        }
    }
}

fn truncate_detail(body: &str) -> String {
    body.chars().take(MAX_ERROR_DETAIL_CHARS).collect()
}
