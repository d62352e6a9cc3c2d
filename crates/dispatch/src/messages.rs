//! Wire types for the dispatch HTTP API.
//!
//! These mirror the JSON bodies the server sends and receives; the
//! conversion into domain types happens here so the rest of the client
//! never touches raw payloads.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use shepherd_core::hardware::HardwareSummary;
use shepherd_core::job::{AssetRef, ComputeType, FrameDescriptor, Job};

/// Body of the authentication request.
#[derive(Debug, Serialize)]
pub struct AuthRequest<'a> {
    pub login: &'a str,
    pub password: &'a str,
    pub hardware: &'a HardwareSummary,
}

/// Successful authentication response.
#[derive(Debug, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub expires_in_secs: u64,
    pub heartbeat_secs: u64,
}

/// Body of a job request.
#[derive(Debug, Serialize)]
pub struct JobRequest<'a> {
    pub compute_type: ComputeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_model: Option<&'a str>,
}

/// How the server answered a job request.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobRequestStatus {
    Assigned,
    NoJob,
    RetryLater,
}

/// Envelope of the job request response.
#[derive(Debug, Deserialize)]
pub struct JobResponse {
    pub status: JobRequestStatus,
    #[serde(default)]
    pub job: Option<JobDto>,
}

/// A job as the server describes it.
#[derive(Debug, Deserialize)]
pub struct JobDto {
    pub id: String,
    pub compute_type: ComputeType,
    pub renderer: AssetRef,
    pub scene: AssetRef,
    pub frame: FrameDescriptor,
    pub estimated_duration_secs: u64,
    #[serde(default)]
    pub cpu_fallback_allowed: bool,
}

impl From<JobDto> for Job {
    fn from(dto: JobDto) -> Self {
        Job {
            id: dto.id,
            compute: dto.compute_type,
            renderer: dto.renderer,
            scene: dto.scene,
            frame: dto.frame,
            estimated_duration: Duration::from_secs(dto.estimated_duration_secs),
            cpu_fallback_allowed: dto.cpu_fallback_allowed,
        }
    }
}

/// Keepalive response.
#[derive(Debug, Deserialize)]
pub struct KeepAliveResponse {
    pub renewed: bool,
}

/// Body of a best-effort job failure report.
#[derive(Debug, Serialize)]
pub struct FailureReport<'a> {
    pub reason: &'a str,
}
