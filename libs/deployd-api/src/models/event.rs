//! Events broadcast after a command is applied

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::command::{
    ConfigurationUpdateResponse, HostRestartConfirmationResponse,
    HostRestartServiceUpdateResponse, SubmitJobResponse,
};
use crate::models::entity::{DeploymentJob, JobKey};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCancelled {
    pub job: DeploymentJob,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured progress record written by a host task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub job: JobKey,
    pub host: String,

    /// `install` or `restart`
    pub task: String,

    pub step: String,
    pub level: ProgressLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Everything published on the event bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    JobCreated(SubmitJobResponse),
    HostConfigured(ConfigurationUpdateResponse),
    AllHostsConfigured(ConfigurationUpdateResponse),
    RestartConfirmed(HostRestartConfirmationResponse),
    HostRestartProgress(HostRestartServiceUpdateResponse),
    ServiceRestarted(HostRestartServiceUpdateResponse),
    AllServicesRestarted(HostRestartServiceUpdateResponse),
    DeploymentFailed(HostRestartServiceUpdateResponse),
    JobCancelled(JobCancelled),
    Progress(ProgressRecord),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::JobCreated(_) => "job_created",
            Event::HostConfigured(_) => "host_configured",
            Event::AllHostsConfigured(_) => "all_hosts_configured",
            Event::RestartConfirmed(_) => "restart_confirmed",
            Event::HostRestartProgress(_) => "host_restart_progress",
            Event::ServiceRestarted(_) => "service_restarted",
            Event::AllServicesRestarted(_) => "all_services_restarted",
            Event::DeploymentFailed(_) => "deployment_failed",
            Event::JobCancelled(_) => "job_cancelled",
            Event::Progress(_) => "progress",
        }
    }

    /// Job snapshot carried by the event, if any
    pub fn job(&self) -> Option<&DeploymentJob> {
        match self {
            Event::JobCreated(e) => Some(&e.job),
            Event::HostConfigured(e) | Event::AllHostsConfigured(e) => Some(&e.job),
            Event::RestartConfirmed(e) => Some(&e.job),
            Event::HostRestartProgress(e)
            | Event::ServiceRestarted(e)
            | Event::AllServicesRestarted(e)
            | Event::DeploymentFailed(e) => Some(&e.job),
            Event::JobCancelled(e) => Some(&e.job),
            Event::Progress(_) => None,
        }
    }
}
