//! Remote inference backend.
//!
//! Posts each sampled frame as `image/jpeg` to an inference service and reads
//! back `{"detections": [...]}`. Whatever model runs behind the endpoint
//! (plate detector + OCR, pose estimator) is opaque here.

use std::time::Duration;

use serde::Deserialize;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::error::InferenceError;
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct HttpBackendConfig {
    pub url: String,
    pub timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

pub struct HttpBackend {
    config: HttpBackendConfig,
    agent: ureq::Agent,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        Self { config, agent }
    }
}

impl DetectorBackend for HttpBackend {
    fn name(&self) -> &'static str {
        "http"
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, InferenceError> {
        let jpeg = frame
            .to_jpeg()
            .map_err(|e| InferenceError::new(format!("encode frame: {:#}", e)))?;
        let response = match self
            .agent
            .post(&self.config.url)
            .set("Content-Type", "image/jpeg")
            .send_bytes(&jpeg)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) => {
                return Err(InferenceError::new(format!(
                    "detector at {} returned status {}",
                    self.config.url, code
                )))
            }
            Err(e) => {
                return Err(InferenceError::new(format!(
                    "detector at {} unreachable: {}",
                    self.config.url, e
                )))
            }
        };
        let parsed: DetectResponse = response
            .into_json()
            .map_err(|e| InferenceError::new(format!("invalid detector response: {}", e)))?;
        Ok(parsed.detections)
    }
}
