//! Client for the backend frame analysis endpoint

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tracing::{instrument, trace};

use crate::error::AnalysisError;
use crate::frames::Frame;
use crate::reading::{AnalysisResult, PatientId};

/// Remote procedure that scores one frame
#[async_trait]
pub trait AnalysisEndpoint: Send + Sync + 'static {
    async fn analyze(&self, frame: Frame, patient: PatientId)
    -> Result<AnalysisResult, AnalysisError>;
}

/// Request body for `POST /api/analyze/frame`
#[derive(Debug, Serialize)]
struct FrameRequest {
    /// Base64-encoded image
    frame: String,
    patient_id: PatientId,
}

/// HTTP implementation of [`AnalysisEndpoint`]
///
/// The underlying client is built once and reused for every request.
#[derive(Debug, Clone)]
pub struct HttpAnalysisClient {
    client: reqwest::Client,
    url: String,
}

impl HttpAnalysisClient {
    pub fn new(api_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/api/analyze/frame", api_url.trim_end_matches('/')),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AnalysisEndpoint for HttpAnalysisClient {
    #[instrument(skip(self, frame), fields(bytes = frame.data.len()))]
    async fn analyze(
        &self,
        frame: Frame,
        patient: PatientId,
    ) -> Result<AnalysisResult, AnalysisError> {
        let body = FrameRequest {
            frame: STANDARD.encode(&frame.data),
            patient_id: patient,
        };

        trace!("submitting frame to {}", self.url);

        let response = self.client.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AnalysisError::Status(status.as_u16()));
        }

        let text = response.text().await?;
        let result: AnalysisResult = serde_json::from_str(&text)?;

        trace!("analysis composite={:?}", result.composite_score);

        Ok(result)
    }
}
