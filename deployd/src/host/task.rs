//! Host tasks and the context they run in

use std::sync::Arc;

use async_trait::async_trait;
use deployd_api::{DeploymentJob, JobKey};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::DeploydError;
use crate::events::{Progress, ProgressSink};
use crate::host::installer::Installer;
use crate::host::rollout::RolloutExecutor;

/// One job as seen by one host
#[derive(Debug, Clone)]
pub struct JobContext {
    /// This host
    pub host: String,

    /// Snapshot the task was started from
    pub job: DeploymentJob,

    /// Fires on cancellation, timeout or shutdown
    pub cancel: CancellationToken,

    /// When the job's timeout expires, if it has one
    pub deadline: Option<Instant>,
}

impl JobContext {
    pub fn new(host: &str, job: DeploymentJob, cancel: CancellationToken) -> Self {
        Self {
            host: host.to_string(),
            job,
            cancel,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn key(&self) -> JobKey {
        self.job.key()
    }

    /// Error describing why the token fired
    pub fn interruption(&self) -> DeploydError {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                DeploydError::TimedOut(format!("job {} exceeded its timeout", self.key()))
            }
            _ => DeploydError::Cancelled(format!("job {} was cancelled", self.key())),
        }
    }

    /// Checkpoint: fail if the job was cancelled or timed out
    pub fn check(&self) -> Result<(), DeploydError> {
        if self.cancel.is_cancelled() {
            Err(self.interruption())
        } else {
            Ok(())
        }
    }

    /// Replace a cancellation error raised by a callee with this job's
    /// reason for cancelling
    pub fn explain(&self, err: DeploydError) -> DeploydError {
        if err.is_cancellation() && self.cancel.is_cancelled() {
            self.interruption()
        } else {
            err
        }
    }
}

/// Work a host does for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostTask {
    /// Lay the build and env down next to the running service
    Install,

    /// Cut the service over to the installed build
    Restart { step: usize },
}

impl HostTask {
    pub fn name(&self) -> &'static str {
        match self {
            HostTask::Install => "install",
            HostTask::Restart { .. } => "restart",
        }
    }
}

/// Runs host tasks.
///
/// The controller only talks to this trait so tests can observe how often
/// and with what it is invoked.
#[async_trait]
pub trait HostTaskRunner: Send + Sync {
    async fn run(&self, task: HostTask, ctx: JobContext) -> Result<(), DeploydError>;
}

/// Runs tasks on this machine
pub struct LocalTaskRunner {
    installer: Installer,
    executor: RolloutExecutor,
    sink: Arc<dyn ProgressSink>,
}

impl LocalTaskRunner {
    pub fn new(installer: Installer, executor: RolloutExecutor, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            installer,
            executor,
            sink,
        }
    }
}

#[async_trait]
impl HostTaskRunner for LocalTaskRunner {
    async fn run(&self, task: HostTask, ctx: JobContext) -> Result<(), DeploydError> {
        let progress = Progress::new(self.sink.clone(), ctx.key(), &ctx.host, task.name());

        let result = match task {
            HostTask::Install => self.installer.install(&ctx, &progress).await.map(|_| ()),
            HostTask::Restart { .. } => self.executor.restart(&ctx, &progress).await,
        };

        match &result {
            Ok(()) => progress.info("done", format!("{} finished", task.name())),
            Err(e) if e.is_cancellation() => progress.warn("done", e.to_string()),
            Err(e) => progress.error("done", e.to_string()),
        }
        result.map_err(|e| ctx.explain(e))
    }
}
