//! Settings file management

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DeploydError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::utils::CooldownOptions;

pub const DEFAULT_SETTINGS_PATH: &str = "/etc/deployd/settings.json";

/// Daemon settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit JSON logs on stdout
    #[serde(default)]
    pub log_json: bool,

    /// Directory for daily-rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Identity of this host in the fleet
    #[serde(default)]
    pub host: HostSettings,

    /// Filesystem roots services are installed under
    #[serde(default)]
    pub paths: PathSettings,

    /// Local HTTP server
    #[serde(default)]
    pub server: ServerSettings,

    /// Artifact and env store
    #[serde(default)]
    pub artifact_store: ArtifactStoreSettings,

    #[serde(default)]
    pub jobs: JobSettings,

    #[serde(default)]
    pub rollout: RolloutSettings,
}

impl Settings {
    /// Read settings from `path`, falling back to defaults when the file is missing
    pub async fn load(path: &std::path::Path) -> Result<Self, DeploydError> {
        let file = File::new(path);
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json()
            .await
            .map_err(|e| DeploydError::ConfigError(format!("{}: {}", path.display(), e)))
    }
}

/// Host identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Name this host is known by in job host lists
    #[serde(default = "default_host_name")]
    pub name: String,

    #[serde(default = "default_os")]
    pub os: String,

    #[serde(default = "default_arch")]
    pub arch: String,
}

fn default_host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

fn default_os() -> String {
    std::env::consts::OS.to_string()
}

fn default_arch() -> String {
    match std::env::consts::ARCH {
        "x86_64" => "amd64".to_string(),
        "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

impl HostSettings {
    /// Attachment key of the build archive for this platform
    pub fn attachment_key(&self) -> String {
        format!("{}/{}", self.os, self.arch)
    }
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            name: default_host_name(),
            os: default_os(),
            arch: default_arch(),
        }
    }
}

/// Filesystem roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    #[serde(default = "default_opt_dir")]
    pub opt_dir: PathBuf,

    #[serde(default = "default_etc_dir")]
    pub etc_dir: PathBuf,

    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Where unit definitions are written
    #[serde(default = "default_unit_dir")]
    pub unit_dir: PathBuf,
}

fn default_opt_dir() -> PathBuf {
    PathBuf::from("/opt")
}

fn default_etc_dir() -> PathBuf {
    PathBuf::from("/etc")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("/tmp")
}

fn default_unit_dir() -> PathBuf {
    PathBuf::from("/etc/systemd/system")
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            opt_dir: default_opt_dir(),
            etc_dir: default_etc_dir(),
            tmp_dir: default_tmp_dir(),
            unit_dir: default_unit_dir(),
        }
    }
}

/// Local HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_host")]
    pub host: String,

    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    9400
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Artifact/env store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactStoreSettings {
    #[serde(default = "default_artifact_url")]
    pub base_url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bearer token; never written back out
    #[serde(default, skip_serializing)]
    pub token: Option<String>,
}

fn default_artifact_url() -> String {
    "http://localhost:9401".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl Default for ArtifactStoreSettings {
    fn default() -> Self {
        Self {
            base_url: default_artifact_url(),
            request_timeout_secs: default_request_timeout(),
            token: None,
        }
    }
}

/// Job controller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Job timeouts below this are ignored
    #[serde(default = "default_min_timeout")]
    pub min_timeout_secs: u64,

    #[serde(default = "default_bus_capacity")]
    pub event_bus_capacity: usize,

    #[serde(default = "default_retry_base")]
    pub not_ready_retry_base_ms: u64,

    #[serde(default = "default_retry_max")]
    pub not_ready_retry_max_ms: u64,

    #[serde(default = "default_retry_attempts")]
    pub not_ready_retry_attempts: u32,
}

fn default_min_timeout() -> u64 {
    30
}

fn default_bus_capacity() -> usize {
    1024
}

fn default_retry_base() -> u64 {
    500
}

fn default_retry_max() -> u64 {
    10_000
}

fn default_retry_attempts() -> u32 {
    20
}

impl JobSettings {
    pub fn not_ready_cooldown(&self) -> CooldownOptions {
        CooldownOptions {
            base_delay: Duration::from_millis(self.not_ready_retry_base_ms),
            max_delay: Duration::from_millis(self.not_ready_retry_max_ms),
            multiplier: 2.0,
            max_attempts: Some(self.not_ready_retry_attempts),
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            min_timeout_secs: default_min_timeout(),
            event_bus_capacity: default_bus_capacity(),
            not_ready_retry_base_ms: default_retry_base(),
            not_ready_retry_max_ms: default_retry_max(),
            not_ready_retry_attempts: default_retry_attempts(),
        }
    }
}

/// Rollout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutSettings {
    /// Upper bound for one supervisor call
    #[serde(default = "default_supervisor_timeout")]
    pub supervisor_timeout_secs: u64,

    #[serde(default = "default_health_attempts")]
    pub health_check_attempts: u32,

    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,
}

fn default_supervisor_timeout() -> u64 {
    90
}

fn default_health_attempts() -> u32 {
    5
}

fn default_health_interval() -> u64 {
    1000
}

impl Default for RolloutSettings {
    fn default() -> Self {
        Self {
            supervisor_timeout_secs: default_supervisor_timeout(),
            health_check_attempts: default_health_attempts(),
            health_check_interval_ms: default_health_interval(),
        }
    }
}
