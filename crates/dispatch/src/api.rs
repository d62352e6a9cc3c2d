//! HTTP client for the dispatch server.
//!
//! Every call classifies failures into [`DispatchError::Transient`]
//! (network errors, timeouts, 5xx: safe to retry with backoff),
//! [`DispatchError::Auth`] (credentials rejected: fatal, never blindly
//! retried), or [`DispatchError::Fatal`] (other 4xx validation
//! rejections). Callers choose their own patience; the classification
//! is made once, here.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use shepherd_core::hardware::HardwareSummary;
use shepherd_core::job::{ComputeType, RequestOutcome};

use crate::messages::{
    AuthRequest, AuthResponse, FailureReport, JobRequest, JobRequestStatus, JobResponse,
    KeepAliveResponse,
};
use crate::session::Session;

/// Default per-request timeout for small API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Asset downloads and result uploads move real data; give them room.
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Outcome of a keepalive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAlive {
    Renewed,
    Expired,
}

/// Errors from the dispatch API, pre-classified by retry policy.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Credentials or session rejected. Fatal; the engine stops.
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// Network trouble or a server-side error. Retry with backoff.
    #[error("Transient dispatch error: {0}")]
    Transient(String),

    /// The server rejected the request as invalid. Not retryable.
    #[error("Dispatch request rejected: {0}")]
    Fatal(String),
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }

    /// Classify a non-2xx HTTP status.
    fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => DispatchError::Auth(body),
            400..=499 => DispatchError::Fatal(format!("HTTP {status}: {body}")),
            _ => DispatchError::Transient(format!("HTTP {status}: {body}")),
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(e: reqwest::Error) -> Self {
        // Connection failures, timeouts, and malformed bodies all look
        // like server trouble from here.
        DispatchError::Transient(e.to_string())
    }
}

/// The server operations the work engine consumes.
///
/// The HTTP implementation is [`DispatchApi`]; tests drive the engine
/// with an in-memory implementation.
#[async_trait]
pub trait DispatchService: Send + Sync {
    async fn authenticate(&self, hardware: &HardwareSummary)
        -> Result<Session, DispatchError>;

    async fn request_job(
        &self,
        token: &str,
        compute: ComputeType,
        gpu_model: Option<&str>,
    ) -> Result<RequestOutcome, DispatchError>;

    /// Stream an asset's bytes into `dest`.
    async fn download_asset(
        &self,
        token: &str,
        asset_id: &str,
        dest: &Path,
    ) -> Result<(), DispatchError>;

    async fn upload_result(
        &self,
        token: &str,
        job_id: &str,
        artifact: &Path,
    ) -> Result<(), DispatchError>;

    async fn keep_alive(&self, token: &str) -> Result<KeepAlive, DispatchError>;

    /// Tell the server a job failed on this worker. Best effort; callers
    /// may ignore the result.
    async fn report_job_failure(
        &self,
        token: &str,
        job_id: &str,
        reason: &str,
    ) -> Result<(), DispatchError>;
}

/// HTTP implementation of [`DispatchService`].
pub struct DispatchApi {
    client: reqwest::Client,
    base_url: String,
    login: String,
    password: String,
}

impl DispatchApi {
    pub fn new(base_url: String, login: String, password: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            login,
            password,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Return the response on 2xx, a classified error otherwise.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, DispatchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(DispatchError::from_status(status.as_u16(), body));
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DispatchError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl DispatchService for DispatchApi {
    async fn authenticate(
        &self,
        hardware: &HardwareSummary,
    ) -> Result<Session, DispatchError> {
        let response = self
            .client
            .post(self.url("/api/worker/auth"))
            .json(&AuthRequest {
                login: &self.login,
                password: &self.password,
                hardware,
            })
            .send()
            .await?;

        let auth: AuthResponse = Self::parse_response(response).await?;

        tracing::info!(heartbeat_secs = auth.heartbeat_secs, "Authenticated with dispatch server");

        Ok(Session {
            token: auth.token,
            expires_at: Utc::now() + chrono::Duration::seconds(auth.expires_in_secs as i64),
            heartbeat: Duration::from_secs(auth.heartbeat_secs),
        })
    }

    async fn request_job(
        &self,
        token: &str,
        compute: ComputeType,
        gpu_model: Option<&str>,
    ) -> Result<RequestOutcome, DispatchError> {
        let response = self
            .client
            .post(self.url("/api/worker/request"))
            .bearer_auth(token)
            .json(&JobRequest {
                compute_type: compute,
                gpu_model,
            })
            .send()
            .await?;

        let body: JobResponse = Self::parse_response(response).await?;

        Ok(match (body.status, body.job) {
            (JobRequestStatus::Assigned, Some(dto)) => RequestOutcome::Assigned(dto.into()),
            (JobRequestStatus::Assigned, None) => {
                RequestOutcome::Fatal("server assigned a job without a body".into())
            }
            (JobRequestStatus::NoJob, _) => RequestOutcome::NoJobAvailable,
            (JobRequestStatus::RetryLater, _) => RequestOutcome::RetryLater,
        })
    }

    async fn download_asset(
        &self,
        token: &str,
        asset_id: &str,
        dest: &Path,
    ) -> Result<(), DispatchError> {
        let response = self
            .client
            .get(self.url(&format!("/api/worker/asset/{asset_id}")))
            .bearer_auth(token)
            .timeout(TRANSFER_TIMEOUT)
            .send()
            .await?;

        let mut response = Self::ensure_success(response).await?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| DispatchError::Fatal(format!("cannot create {}: {e}", dest.display())))?;

        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk)
                .await
                .map_err(|e| DispatchError::Fatal(format!("cannot write {}: {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| DispatchError::Fatal(format!("cannot flush {}: {e}", dest.display())))?;

        Ok(())
    }

    async fn upload_result(
        &self,
        token: &str,
        job_id: &str,
        artifact: &Path,
    ) -> Result<(), DispatchError> {
        let bytes = tokio::fs::read(artifact).await.map_err(|e| {
            DispatchError::Fatal(format!("cannot read artifact {}: {e}", artifact.display()))
        })?;

        let response = self
            .client
            .post(self.url(&format!("/api/worker/job/{job_id}/result")))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .timeout(TRANSFER_TIMEOUT)
            .body(bytes)
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }

    async fn keep_alive(&self, token: &str) -> Result<KeepAlive, DispatchError> {
        let response = self
            .client
            .post(self.url("/api/worker/keepalive"))
            .bearer_auth(token)
            .send()
            .await?;

        // An expired session answers 401; that is a signal here, not an
        // authentication failure.
        if response.status().as_u16() == 401 {
            return Ok(KeepAlive::Expired);
        }

        let body: KeepAliveResponse = Self::parse_response(response).await?;
        Ok(if body.renewed {
            KeepAlive::Renewed
        } else {
            KeepAlive::Expired
        })
    }

    async fn report_job_failure(
        &self,
        token: &str,
        job_id: &str,
        reason: &str,
    ) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(self.url(&format!("/api/worker/job/{job_id}/failure")))
            .bearer_auth(token)
            .json(&FailureReport { reason })
            .send()
            .await?;

        Self::ensure_success(response).await?;
        Ok(())
    }
}
