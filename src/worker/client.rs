use std::time::Duration;

use reqwest::{Client, Response};
use tracing::debug;

use super::TranscriptionWorker;
use super::error::WorkerError;
use super::types::{DispatchAck, DispatchRequest, WorkerResult};
use crate::config::{TimeoutConfig, WorkerConfig};

/// reqwest client for the worker's HTTP API.
///
/// `POST {base}/transcribe/sync` returns the result inline,
/// `POST {base}/transcribe` only acknowledges.
pub struct HttpWorker {
    client: Client,
    base_url: String,
}

impl HttpWorker {
    pub fn new(worker: &WorkerConfig, timeouts: &TimeoutConfig) -> Result<Self, WorkerError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(worker.connect_timeout_secs))
            .timeout(timeouts.transport())
            .build()?;
        Ok(Self {
            client,
            base_url: worker.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post(&self, path: &str, req: &DispatchRequest) -> Result<Response, WorkerError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(job_id = %req.job_id, %url, "posting to worker");
        let response = self.client.post(&url).json(req).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(WorkerError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

impl TranscriptionWorker for HttpWorker {
    async fn transcribe(&self, req: &DispatchRequest) -> Result<WorkerResult, WorkerError> {
        let response = self.post("/transcribe/sync", req).await?;
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| WorkerError::InvalidResponse(e.to_string()))
    }

    async fn submit(&self, req: &DispatchRequest) -> Result<DispatchAck, WorkerError> {
        let response = self.post("/transcribe", req).await?;
        let body = response.text().await?;
        if body.trim().is_empty() {
            return Ok(DispatchAck::default());
        }
        Ok(serde_json::from_str(&body).unwrap_or(DispatchAck {
            message: Some(body),
        }))
    }
}
