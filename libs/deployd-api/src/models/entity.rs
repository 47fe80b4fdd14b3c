//! Replicated entities

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job-level lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted, no host has reported yet
    Queued,

    /// At least one host is installing
    Configuring,

    /// Every host installed successfully
    Configured,

    /// Hosts are being cut over one at a time
    Deploying,

    /// Every host restarted on the new build
    Deployed,

    Cancelled,

    #[serde(rename = "TIMEOUT")]
    TimedOut,

    Failed,
}

impl JobStatus {
    /// No command may move the job out of a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Deployed | JobStatus::Cancelled | JobStatus::TimedOut | JobStatus::Failed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Configuring => "CONFIGURING",
            JobStatus::Configured => "CONFIGURED",
            JobStatus::Deploying => "DEPLOYING",
            JobStatus::Deployed => "DEPLOYED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::TimedOut => "TIMEOUT",
            JobStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-host status during the configuring phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostConfigurationStatus {
    Pending,
    Configuring,
    Success,
    Failed,
    Cancelled,
    #[serde(rename = "TIMEOUT")]
    TimedOut,
}

impl HostConfigurationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostConfigurationStatus::Pending => "PENDING",
            HostConfigurationStatus::Configuring => "CONFIGURING",
            HostConfigurationStatus::Success => "SUCCESS",
            HostConfigurationStatus::Failed => "FAILED",
            HostConfigurationStatus::Cancelled => "CANCELLED",
            HostConfigurationStatus::TimedOut => "TIMEOUT",
        }
    }
}

impl fmt::Display for HostConfigurationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-host status during the deploying phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HostDeploymentStatus {
    Pending,
    Starting,
    DrainTraffic,
    Restarting,
    WaitReady,
    RoutingTraffic,
    Success,
    Failed,
    #[serde(rename = "TIMEOUT")]
    TimedOut,
}

impl HostDeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HostDeploymentStatus::Pending => "PENDING",
            HostDeploymentStatus::Starting => "STARTING",
            HostDeploymentStatus::DrainTraffic => "DRAIN_TRAFFIC",
            HostDeploymentStatus::Restarting => "RESTARTING",
            HostDeploymentStatus::WaitReady => "WAIT_READY",
            HostDeploymentStatus::RoutingTraffic => "ROUTING_TRAFFIC",
            HostDeploymentStatus::Success => "SUCCESS",
            HostDeploymentStatus::Failed => "FAILED",
            HostDeploymentStatus::TimedOut => "TIMEOUT",
        }
    }
}

impl fmt::Display for HostDeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfigurationStatusInfo {
    pub status: HostConfigurationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HostConfigurationStatusInfo {
    pub fn pending() -> Self {
        Self {
            status: HostConfigurationStatus::Pending,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDeploymentStatusInfo {
    pub status: HostDeploymentStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl HostDeploymentStatusInfo {
    pub fn pending() -> Self {
        Self {
            status: HostDeploymentStatus::Pending,
            error_message: None,
        }
    }
}

/// Configuring phase bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    pub status: BTreeMap<String, HostConfigurationStatusInfo>,
}

impl Configuration {
    pub fn all_succeeded(&self) -> bool {
        !self.status.is_empty()
            && self
                .status
                .values()
                .all(|info| info.status == HostConfigurationStatus::Success)
    }
}

/// Deploying phase bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    /// Agent that confirmed the first restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_by: Option<String>,

    /// Index into `host_order`; unset until the job starts deploying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_order: Option<usize>,

    pub host_order: Vec<String>,

    pub status: BTreeMap<String, HostDeploymentStatusInfo>,
}

impl Deployment {
    /// The only host allowed to report a restart outcome right now
    pub fn head_host(&self) -> Option<&str> {
        self.current_order
            .and_then(|order| self.host_order.get(order))
            .map(String::as_str)
    }
}

/// Service to deploy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    #[serde(default)]
    pub namespace: String,

    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Path of the executable relative to the release root
    #[serde(default)]
    pub executable_path: String,
}

/// Replica settings a host offers for a replicated service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRaftConfig {
    pub replica_id: u64,

    #[serde(default)]
    pub wal_dir: String,

    #[serde(default)]
    pub node_host_dir: String,
}

/// Host a new service is first deployed to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHost {
    pub host: String,

    #[serde(default)]
    pub raft_config: HostRaftConfig,
}

/// A deployment submission, immutable once accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitDeploymentJobRequest {
    pub namespace: String,

    pub service: ServiceDefinition,

    pub build_version: u64,

    /// `0` means the service has no managed environment
    #[serde(default)]
    pub env_version: u64,

    #[serde(default)]
    pub secret_version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Auto-advance the rollout gates without waiting for a confirmation
    #[serde(default, alias = "is_believe")]
    pub trust: bool,

    /// Required only when the service has no instances yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_hosts: Vec<TargetHost>,

    /// SHA-256 (hex) of the modify key handed to the submitter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modify_key_digest: Option<String>,

    pub published_at: DateTime<Utc>,
}

/// Identifies a job within the fleet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub service: String,
    pub job_id: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}\\{}", self.namespace, self.service, self.job_id)
    }
}

/// The replicated aggregate for one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentJob {
    pub namespace: String,

    /// Assigned by the store on creation
    #[serde(default)]
    pub id: String,

    pub status: JobStatus,

    pub request: SubmitDeploymentJobRequest,

    pub deployment: Deployment,

    pub configuration: Configuration,

    pub published_at: DateTime<Utc>,
}

impl DeploymentJob {
    pub fn service_id(&self) -> &str {
        &self.request.service.id
    }

    pub fn key(&self) -> JobKey {
        JobKey {
            namespace: self.namespace.clone(),
            service: self.request.service.id.clone(),
            job_id: self.id.clone(),
        }
    }

    pub fn is_participant(&self, host: &str) -> bool {
        self.configuration.status.contains_key(host)
    }
}

/// Replica wiring of a service instance on one host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub raft_port: u16,
    pub replica_id: u64,
    pub wal_dir: String,
    pub node_host_dir: String,
    pub rtt_millisecond: u64,
}

/// Where one instance of a service runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstanceHost {
    pub namespace: String,
    pub service: String,
    pub host: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raft_config: Option<RaftConfig>,

    pub published_at: DateTime<Utc>,
}
