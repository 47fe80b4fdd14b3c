//! Application configuration options

use std::fmt;
use std::time::Duration;

use crate::host::HealthCheckOptions;
use crate::storage::settings::{HostSettings, PathSettings, Settings};
use crate::utils::CooldownOptions;
use crate::workers::host_jobs;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// This host's identity
    pub host: HostSettings,

    /// Filesystem roots for managed services
    pub paths: PathSettings,

    /// Artifact and env store
    pub artifact_store: ArtifactStoreOptions,

    /// Enable the HTTP API
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Host job worker options
    pub host_jobs: host_jobs::Options,

    /// Health checks after a restart
    pub health_check: HealthCheckOptions,

    /// Upper bound for one supervisor call
    pub supervisor_timeout: Duration,

    /// Capacity of the event bus and of the log's request queue
    pub event_bus_capacity: usize,
}

impl Default for AppOptions {
    fn default() -> Self {
        let host = HostSettings::default();
        Self {
            lifecycle: LifecycleOptions::default(),
            host_jobs: host_jobs::Options::new(&host.name, Duration::from_secs(30)),
            host,
            paths: PathSettings::default(),
            artifact_store: ArtifactStoreOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            health_check: HealthCheckOptions::default(),
            supervisor_timeout: Duration::from_secs(90),
            event_bus_capacity: 1024,
        }
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let jobs = &settings.jobs;
        Self {
            lifecycle: LifecycleOptions::default(),
            host: settings.host.clone(),
            paths: settings.paths.clone(),
            artifact_store: ArtifactStoreOptions {
                base_url: settings.artifact_store.base_url.clone(),
                request_timeout: Duration::from_secs(settings.artifact_store.request_timeout_secs),
                token: settings.artifact_store.token.clone(),
                not_ready: jobs.not_ready_cooldown(),
            },
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
                not_ready: jobs.not_ready_cooldown(),
                ..Default::default()
            },
            host_jobs: host_jobs::Options::new(
                &settings.host.name,
                Duration::from_secs(jobs.min_timeout_secs),
            ),
            health_check: HealthCheckOptions::from(&settings.rollout),
            supervisor_timeout: Duration::from_secs(settings.rollout.supervisor_timeout_secs),
            event_bus_capacity: jobs.event_bus_capacity.max(1),
        }
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Artifact and env store connection
#[derive(Clone, Default)]
pub struct ArtifactStoreOptions {
    pub base_url: String,
    pub request_timeout: Duration,
    pub token: Option<String>,

    /// Retry policy while the store answers not-ready
    pub not_ready: CooldownOptions,
}

impl fmt::Debug for ArtifactStoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactStoreOptions")
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("not_ready", &self.not_ready)
            .finish()
    }
}

/// HTTP API options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Minimum gap between two submissions for one service
    pub submit_cooldown: Duration,

    /// Retry policy for reads served by a lagging replica
    pub not_ready: CooldownOptions,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9400,
            submit_cooldown: Duration::from_secs(10),
            not_ready: CooldownOptions::default(),
        }
    }
}
