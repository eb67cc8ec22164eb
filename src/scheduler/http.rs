//! REST client for a cluster-management API.
//!
//! Endpoints, relative to the configured base URL:
//!
//! | Operation    | Request                                 | Response                          |
//! |--------------|-----------------------------------------|-----------------------------------|
//! | `create_job` | `POST /jobs` (JSON `SubmissionRequest`) | `{"id": "..."}`                   |
//! | `get_status` | `GET /jobs/{id}`                        | `{"state": "pending"}` or `{"state": "exited", "exit_code": N}` |
//! | `get_logs`   | `GET /jobs/{id}/logs?offset=N`          | `{"content": "<base64>", "next_offset": M}` |
//! | `cancel`     | `POST /jobs/{id}/cancel`                | any 2xx                           |
//!
//! A 404 from the status endpoint is reported as `Pending`: freshly created
//! jobs are often not visible until the scheduler has accepted them.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use super::backend::ClusterBackend;
use super::job::{JobHandle, JobStatus, LogChunk, SubmissionRequest};
use crate::error::BackendError;

/// Default per-request timeout.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct CreateJobResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    #[serde(default)]
    content: String,
    next_offset: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    #[serde(alias = "error")]
    message: String,
}

/// HTTP implementation of [`ClusterBackend`].
pub struct HttpBackend {
    /// Base URL, without a trailing slash.
    api_base: String,
    /// Bearer token, if the API requires one.
    api_token: Option<String>,
    http_client: Client,
}

impl HttpBackend {
    /// Creates a client for `api_base` with the default request timeout.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Request` if the HTTP client cannot be built.
    pub fn new(api_base: impl Into<String>, api_token: Option<String>) -> Result<Self, BackendError> {
        Self::with_timeout(api_base, api_token, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a client with an explicit per-request timeout.
    pub fn with_timeout(
        api_base: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Request(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_token,
            http_client,
        })
    }

    /// Get the API base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Check if an API token is configured.
    pub fn has_api_token(&self) -> bool {
        self.api_token.is_some()
    }

    fn job_url(&self, handle: &JobHandle) -> String {
        format!("{}/jobs/{}", self.api_base, urlencoding::encode(handle.as_str()))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.api_token {
            Some(ref token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| BackendError::Request(e.to_string()))
    }
}

/// Maps a non-2xx response to a `BackendError`.
async fn error_from_response(response: Response) -> BackendError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());
    let message = serde_json::from_str::<ApiErrorResponse>(&body)
        .map(|e| e.message)
        .unwrap_or(body);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Unauthorized(message),
        _ => BackendError::Api {
            code: status.as_u16(),
            message,
        },
    }
}

fn decode_logs(response: LogResponse, since_offset: u64) -> Result<LogChunk, BackendError> {
    let data = STANDARD
        .decode(response.content.as_bytes())
        .map_err(|e| BackendError::Parse(format!("Invalid base64 log content: {}", e)))?;

    if response.next_offset < since_offset {
        return Err(BackendError::Parse(format!(
            "Log offset went backwards: requested {}, got {}",
            since_offset, response.next_offset
        )));
    }

    Ok(LogChunk {
        data,
        next_offset: response.next_offset,
    })
}

#[async_trait]
impl ClusterBackend for HttpBackend {
    fn name(&self) -> &str {
        "http"
    }

    async fn create_job(&self, request: &SubmissionRequest) -> Result<JobHandle, BackendError> {
        let url = format!("{}/jobs", self.api_base);
        let response = self.send(self.http_client.post(&url).json(request)).await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let created: CreateJobResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(format!("Failed to parse create response: {}", e)))?;

        Ok(JobHandle::new(created.id))
    }

    async fn get_status(&self, handle: &JobHandle) -> Result<JobStatus, BackendError> {
        let response = self.send(self.http_client.get(self.job_url(handle))).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(handle = %handle, "Job not visible yet, treating as pending");
            return Ok(JobStatus::Pending);
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::Parse(format!("Failed to parse job status: {}", e)))
    }

    async fn get_logs(&self, handle: &JobHandle, since_offset: u64) -> Result<LogChunk, BackendError> {
        let url = format!("{}/logs?offset={}", self.job_url(handle), since_offset);
        let response = self.send(self.http_client.get(&url)).await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let logs: LogResponse = response
            .json()
            .await
            .map_err(|e| BackendError::Parse(format!("Failed to parse log response: {}", e)))?;

        decode_logs(logs, since_offset)
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<(), BackendError> {
        let url = format!("{}/cancel", self.job_url(handle));
        let response = self.send(self.http_client.post(&url)).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::JobNotFound(handle.to_string())),
            _ => Err(error_from_response(response).await),
        }
    }
}
