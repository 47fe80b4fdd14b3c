//! Per-host job controller
//!
//! Consumes job events one at a time and owns the pool of jobs this host is
//! working on. Installer and rollout work runs in spawned tasks so a slow
//! download never holds up event consumption; only the event loop touches
//! the pool.

use std::collections::{hash_map, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use deployd_api::{
    ConfigurationUpdateRequest, DeploymentJob, Event, HostConfigurationStatus,
    HostDeploymentStatus, HostRestartServiceUpdateRequest, JobKey, RestartConfirmation,
};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::JobCoordinator;
use crate::errors::DeploydError;
use crate::host::task::{HostTask, HostTaskRunner, JobContext};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// This host's identity as it appears in job host sets
    pub host: String,

    /// Job timeouts below this are ignored
    pub min_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            min_timeout: Duration::from_secs(30),
        }
    }
}

struct PoolEntry {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    restart_started: BTreeSet<usize>,
}

pub struct HostJobController {
    options: ControllerOptions,
    coordinator: Arc<dyn JobCoordinator>,
    runner: Arc<dyn HostTaskRunner>,
    pool: HashMap<JobKey, PoolEntry>,
    root: CancellationToken,
    tasks: JoinSet<()>,
}

impl HostJobController {
    pub fn new(
        options: ControllerOptions,
        coordinator: Arc<dyn JobCoordinator>,
        runner: Arc<dyn HostTaskRunner>,
    ) -> Self {
        Self {
            options,
            coordinator,
            runner,
            pool: HashMap::new(),
            root: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.options.host
    }

    pub fn is_tracking(&self, key: &JobKey) -> bool {
        self.pool.contains_key(key)
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    /// React to one event from the bus
    pub fn handle_event(&mut self, event: Event) {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(e) = joined {
                error!("Host task panicked: {}", e);
            }
        }

        match event {
            Event::JobCreated(created) => self.on_job_created(created.job),
            Event::JobCancelled(cancelled) => {
                let key = cancelled.job.key();
                if let Some(entry) = self.pool.remove(&key) {
                    info!("Cancelling job {} on {}", key, self.options.host);
                    entry.cancel.cancel();
                }
            }
            Event::RestartConfirmed(confirmed) => {
                if confirmed.target_host.as_deref() == Some(self.options.host.as_str()) {
                    self.on_restart_confirmed(confirmed.job, confirmed.current_step);
                }
            }
            Event::AllHostsConfigured(configured) => {
                if configured.confirm_immediately && configured.trigger_host == self.options.host {
                    self.confirm_next(&configured.job, "all hosts configured");
                }
            }
            Event::ServiceRestarted(restarted) => {
                if restarted.deploy_immediately && restarted.trigger_host == self.options.host {
                    self.confirm_next(&restarted.job, "previous host restarted");
                }
            }
            Event::AllServicesRestarted(done) | Event::DeploymentFailed(done) => {
                let key = done.job.key();
                if let Some(entry) = self.pool.remove(&key) {
                    debug!("Job {} finished as {}", key, done.job.status.as_str());
                    entry.cancel.cancel();
                }
            }
            Event::HostConfigured(configured) => {
                if configured.trigger_host == self.options.host {
                    self.on_host_configured(&configured.job);
                }
            }
            Event::HostRestartProgress(_) | Event::Progress(_) => {}
        }
    }

    /// Cancel every in-flight task and wait for them to wind down
    pub async fn shutdown(&mut self) {
        info!(
            "Host job controller shutting down with {} job(s) in the pool...",
            self.pool.len()
        );
        self.root.cancel();
        self.pool.clear();
        self.join_tasks().await;
    }

    /// Wait for every spawned task to finish
    pub async fn join_tasks(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!("Host task panicked: {}", e);
            }
        }
    }

    fn on_job_created(&mut self, job: DeploymentJob) {
        let key = job.key();
        if !job.is_participant(&self.options.host) {
            debug!("Job {} does not include {}", key, self.options.host);
            return;
        }
        if self.pool.contains_key(&key) {
            debug!("Job {} already in the pool", key);
            return;
        }

        let ctx = self.track(&job);
        info!("Configuring job {} on {}", key, self.options.host);

        let coordinator = self.coordinator.clone();
        let runner = self.runner.clone();
        self.tasks.spawn(async move {
            let report = |status, error_message| ConfigurationUpdateRequest {
                namespace: ctx.job.namespace.clone(),
                job_id: ctx.job.id.clone(),
                service: ctx.job.service_id().to_string(),
                host_name: ctx.host.clone(),
                status,
                error_message,
                updated_at: Some(Utc::now()),
            };

            if let Err(e) = coordinator
                .feed_host_configuration_update(report(HostConfigurationStatus::Configuring, None))
                .await
            {
                warn!("Failed to report configuring for job {}: {}", ctx.key(), e);
            }

            let (status, message) = match runner.run(HostTask::Install, ctx.clone()).await {
                Ok(()) => (HostConfigurationStatus::Success, None),
                Err(e @ DeploydError::TimedOut(_)) => {
                    (HostConfigurationStatus::TimedOut, Some(e.to_string()))
                }
                Err(e @ DeploydError::Cancelled(_)) => {
                    (HostConfigurationStatus::Cancelled, Some(e.to_string()))
                }
                Err(e) => (HostConfigurationStatus::Failed, Some(e.to_string())),
            };
            info!(
                "Configuration of job {} on {} finished: {}",
                ctx.key(),
                ctx.host,
                status.as_str()
            );

            // not retried, the recorded state stays authoritative
            if let Err(e) = coordinator
                .feed_host_configuration_update(report(status, message))
                .await
            {
                warn!("Failed to report configuration of job {}: {}", ctx.key(), e);
            }
        });
    }

    /// Drop a job whose configuration on this host ended without success.
    /// It can never reach CONFIGURED, so no restart will follow.
    fn on_host_configured(&mut self, job: &DeploymentJob) {
        let Some(info) = job.configuration.status.get(&self.options.host) else {
            return;
        };
        let given_up = matches!(
            info.status,
            HostConfigurationStatus::Failed
                | HostConfigurationStatus::TimedOut
                | HostConfigurationStatus::Cancelled
        );
        if !given_up {
            return;
        }
        let key = job.key();
        if let Some(entry) = self.pool.remove(&key) {
            debug!(
                "Job {} configuration on {} ended as {}, releasing it",
                key,
                self.options.host,
                info.status.as_str()
            );
            entry.cancel.cancel();
        }
    }

    fn on_restart_confirmed(&mut self, job: DeploymentJob, step: usize) {
        let key = job.key();
        if !self.pool.contains_key(&key) {
            debug!("Job {} not in the pool, tracking it for restart", key);
        }
        let ctx = self.track(&job);
        let Some(entry) = self.pool.get_mut(&key) else {
            return;
        };
        if !entry.restart_started.insert(step) {
            debug!("Restart step {} of job {} already started", step, key);
            return;
        }
        info!("Restarting job {} step {} on {}", key, step, self.options.host);

        let coordinator = self.coordinator.clone();
        let runner = self.runner.clone();
        self.tasks.spawn(async move {
            let report = |status, error_message| HostRestartServiceUpdateRequest {
                namespace: ctx.job.namespace.clone(),
                job_id: ctx.job.id.clone(),
                service: ctx.job.service_id().to_string(),
                host_name: ctx.host.clone(),
                status,
                error_message,
                order: Some(step),
                updated_at: Some(Utc::now()),
            };

            match coordinator
                .feed_host_restart_update(report(HostDeploymentStatus::Restarting, None))
                .await
            {
                Ok(_) => {}
                Err(e @ (DeploydError::ValidationError(_) | DeploydError::InvalidState(_))) => {
                    warn!("Restart of job {} step {} rejected: {}", ctx.key(), step, e);
                    return;
                }
                Err(e) => warn!("Failed to report restarting for job {}: {}", ctx.key(), e),
            }

            let (status, message) =
                match runner.run(HostTask::Restart { step }, ctx.clone()).await {
                    Ok(()) => (HostDeploymentStatus::Success, None),
                    Err(e @ DeploydError::TimedOut(_)) => {
                        (HostDeploymentStatus::TimedOut, Some(e.to_string()))
                    }
                    // interrupted, not failed: the step stays open for a re-confirmation
                    Err(e @ DeploydError::Cancelled(_)) => {
                        warn!(
                            "Restart of job {} step {} on {} interrupted: {}",
                            ctx.key(),
                            step,
                            ctx.host,
                            e
                        );
                        return;
                    }
                    Err(e) => (HostDeploymentStatus::Failed, Some(e.to_string())),
                };
            info!(
                "Restart of job {} on {} finished: {}",
                ctx.key(),
                ctx.host,
                status.as_str()
            );

            if let Err(e) = coordinator.feed_host_restart_update(report(status, message)).await {
                warn!("Failed to report restart of job {}: {}", ctx.key(), e);
            }
        });
    }

    fn confirm_next(&mut self, job: &DeploymentJob, message: &str) {
        let request = RestartConfirmation {
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            service: job.service_id().to_string(),
            agent: self.options.host.clone(),
            message: format!("trusted job, {}", message),
            created_at: Some(Utc::now()),
        };
        let coordinator = self.coordinator.clone();
        let key = job.key();
        self.tasks.spawn(async move {
            if let Err(e) = coordinator.confirm_restart(request).await {
                warn!("Automatic restart confirmation of job {} failed: {}", key, e);
            }
        });
    }

    /// Context for `job`, inserting a pool entry when there is none
    fn track(&mut self, job: &DeploymentJob) -> JobContext {
        let key = job.key();
        let entry = match self.pool.entry(key) {
            hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
            hash_map::Entry::Vacant(vacant) => {
                let cancel = self.root.child_token();
                let deadline = timeout_for(&self.options, job).map(|timeout| {
                    let deadline = Instant::now() + timeout;
                    let timer = cancel.clone();
                    let timer_key = job.key();
                    self.tasks.spawn(async move {
                        tokio::select! {
                            _ = timer.cancelled() => {}
                            _ = tokio::time::sleep_until(deadline) => {
                                info!("Job {} timed out after {:?}", timer_key, timeout);
                                timer.cancel();
                            }
                        }
                    });
                    deadline
                });
                vacant.insert(PoolEntry {
                    cancel,
                    deadline,
                    restart_started: BTreeSet::new(),
                })
            }
        };

        JobContext::new(&self.options.host, job.clone(), entry.cancel.clone())
            .with_deadline(entry.deadline)
    }
}

/// The job's timeout, unless it is missing or below the minimum
fn timeout_for(options: &ControllerOptions, job: &DeploymentJob) -> Option<Duration> {
    let secs = job.request.timeout_seconds?;
    let timeout = Duration::from_secs(secs);
    if timeout < options.min_timeout {
        debug!(
            "Ignoring timeout of {}s for job {}, below the {:?} minimum",
            secs,
            job.key(),
            options.min_timeout
        );
        return None;
    }
    Some(timeout)
}
