//! HTTP scoring backend.
//!
//! Posts the finalised turn recording as a multipart form to a scoring
//! service and reads back an [`EngineOutput`] JSON body: a bare string for a
//! transcript, or an object of 0–100 sub-scores for an assessment.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{multipart, Client};
use tracing::{debug, warn};

use crate::error::{ChorusError, Result};
use crate::inference::{EngineOutput, FileModel, TurnContext};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct HttpFileModelConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl HttpFileModelConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

pub struct HttpFileModel {
    config: HttpFileModelConfig,
    client: Client,
}

impl HttpFileModel {
    /// # Errors
    /// Fails when the TLS backend cannot be initialised.
    pub fn new(config: HttpFileModelConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ChorusError::Remote(format!("http client build failed: {e}")))?;
        Ok(Self { config, client })
    }
}

impl FileModel for HttpFileModel {
    fn analyze(&mut self, recording: &Path, context: &TurnContext) -> Result<EngineOutput> {
        let wav_bytes = std::fs::read(recording)?;
        debug!(url = %self.config.url, bytes = wav_bytes.len(), "posting recording");

        let file_part = multipart::Part::bytes(wav_bytes)
            .file_name("turn.wav")
            .mime_str("audio/wav")
            .map_err(|e| ChorusError::Remote(format!("multipart file part failed: {e}")))?;
        let form = multipart::Form::new()
            .text("reference_text", context.reference_text.clone())
            .text("language", context.language.clone())
            .part("file", file_part);

        let mut request = self.client.post(&self.config.url).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .map_err(|e| ChorusError::Remote(format!("scoring request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "scoring service returned non-success status");
            return Err(ChorusError::Remote(format!("scoring service returned {status}")));
        }
        let body = response
            .text()
            .map_err(|e| ChorusError::Remote(format!("reading scoring response failed: {e}")))?;
        parse_output(&body)
    }
}

/// Decode a service response body. Scores are clamped into 0–100.
fn parse_output(body: &str) -> Result<EngineOutput> {
    let output: EngineOutput = serde_json::from_str(body)
        .map_err(|e| ChorusError::Remote(format!("malformed scoring response: {e}")))?;
    Ok(match output {
        EngineOutput::Score(score) => EngineOutput::Score(score.clamped()),
        other => other,
    })
}
