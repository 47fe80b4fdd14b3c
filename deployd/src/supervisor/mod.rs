//! Process supervisor adapter

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::DeploydError;

pub const ACTIVE: &str = "active";
pub const LOADED: &str = "loaded";

/// Controls OS-managed units.
///
/// Every call observes `cancel`: a call still pending when the token fires
/// returns [`DeploydError::Cancelled`] instead of hanging.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Stop `unit` and wait for the stop to complete
    async fn stop(&self, unit: &str, cancel: &CancellationToken) -> Result<(), DeploydError>;

    /// Start `unit` and wait for the start job to complete
    async fn start(&self, unit: &str, cancel: &CancellationToken) -> Result<(), DeploydError>;

    /// Re-read unit definitions from disk
    async fn reload(&self, cancel: &CancellationToken) -> Result<(), DeploydError>;

    /// `ActiveState` of the unit, e.g. `active`, `failed`, `activating`
    async fn active_state(
        &self,
        unit: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeploydError>;

    /// `LoadState` of the unit, e.g. `loaded`, `not-found`
    async fn load_state(&self, unit: &str, cancel: &CancellationToken)
        -> Result<String, DeploydError>;
}

/// [`ProcessSupervisor`] backed by the `systemctl` CLI
pub struct SystemctlSupervisor {
    program: PathBuf,
    timeout: Duration,
}

impl SystemctlSupervisor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: PathBuf::from("systemctl"),
            timeout,
        }
    }

    /// Use a different binary, e.g. a wrapper script
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    async fn run(&self, args: &[&str], cancel: &CancellationToken) -> Result<String, DeploydError> {
        debug!("{} {}", self.program.display(), args.join(" "));

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(DeploydError::Cancelled(format!("systemctl {}", args.join(" "))));
            }
            result = tokio::time::timeout(self.timeout, child) => match result {
                Ok(output) => output?,
                Err(_) => {
                    return Err(DeploydError::TimedOut(format!(
                        "systemctl {} did not finish within {:?}",
                        args.join(" "),
                        self.timeout
                    )));
                }
            },
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeploydError::SupervisorError(format!(
                "systemctl {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn show(
        &self,
        unit: &str,
        property: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeploydError> {
        self.run(&["show", "--property", property, "--value", unit], cancel)
            .await
    }
}

#[async_trait]
impl ProcessSupervisor for SystemctlSupervisor {
    async fn stop(&self, unit: &str, cancel: &CancellationToken) -> Result<(), DeploydError> {
        self.run(&["stop", unit], cancel).await.map(|_| ())
    }

    async fn start(&self, unit: &str, cancel: &CancellationToken) -> Result<(), DeploydError> {
        self.run(&["start", unit], cancel).await.map(|_| ())
    }

    async fn reload(&self, cancel: &CancellationToken) -> Result<(), DeploydError> {
        self.run(&["daemon-reload"], cancel).await.map(|_| ())
    }

    async fn active_state(
        &self,
        unit: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeploydError> {
        self.show(unit, "ActiveState", cancel).await
    }

    async fn load_state(
        &self,
        unit: &str,
        cancel: &CancellationToken,
    ) -> Result<String, DeploydError> {
        self.show(unit, "LoadState", cancel).await
    }
}
