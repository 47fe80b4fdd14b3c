//! Replicated command payloads and results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::entity::{DeploymentJob, HostConfigurationStatus, HostDeploymentStatus};

/// Outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitJobStatus {
    Success,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitJobResponse {
    pub submit_job_status: SubmitJobStatus,
    pub job: DeploymentJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelJobRequest {
    pub namespace: String,
    pub service: String,
    pub job_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationUpdateRequest {
    pub namespace: String,
    pub job_id: String,
    pub service: String,

    pub host_name: String,
    pub status: HostConfigurationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationUpdateResponse {
    /// Mirrors the job's trust flag
    pub confirm_immediately: bool,

    /// Set only on the update that completed the configuring phase
    pub all_configured: bool,

    pub trigger_host: String,

    pub job: DeploymentJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfirmation {
    pub namespace: String,
    pub job_id: String,
    pub service: String,

    /// Who confirmed
    pub agent: String,

    #[serde(default)]
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRestartConfirmationResponse {
    pub current_step: usize,

    /// Host that must restart next; unset once the cursor reached the end
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,

    #[serde(default)]
    pub message: String,

    pub job: DeploymentJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRestartServiceUpdateRequest {
    pub namespace: String,
    pub job_id: String,
    pub service: String,

    pub host_name: String,
    pub status: HostDeploymentStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Step the host acted on, if it knows it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRestartServiceUpdateResponse {
    pub current_step: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,

    pub trigger_host: String,

    /// Mirrors the job's trust flag while more hosts remain
    pub deploy_immediately: bool,

    pub failed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,

    pub job: DeploymentJob,
}
