//! Deployment state machine
//!
//! The single owner of job lifecycle. It runs inside the replicated log, so
//! every command is applied exactly once and in the same order on every
//! replica: nothing here may depend on wall-clock time, randomness or
//! local I/O beyond the tables it is given.
//!
//! Handlers work on a copy of the stored job and write it back only once
//! every check has passed, so a rejected command leaves no trace. Events
//! are returned to the caller and must be published after the entry is
//! applied.

use std::collections::BTreeMap;
use std::collections::HashSet;

use deployd_api::{
    CancelJobRequest, Configuration, ConfigurationUpdateRequest, ConfigurationUpdateResponse,
    Deployment, DeploymentJob, Event, HostConfigurationStatus, HostConfigurationStatusInfo,
    HostDeploymentStatus, HostDeploymentStatusInfo, HostRestartConfirmationResponse,
    HostRestartServiceUpdateRequest, HostRestartServiceUpdateResponse, JobCancelled, JobStatus,
    RaftConfig, RestartConfirmation, ServiceInstanceHost, SubmitDeploymentJobRequest,
    SubmitJobResponse, SubmitJobStatus,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::coordinator::commands::{
    Entry, CANCEL_JOB, HOST_CONFIGURATION_UPDATE, HOST_RESTART_SERVICE_UPDATE,
    RESTART_CONFIRMATION, SUBMIT_JOB,
};
use crate::coordinator::fsm::{JobEvent, JobFsm};
use crate::errors::DeploydError;
use crate::store::Table;

/// Replica ports are drawn from `[RAFT_PORT_BASE, RAFT_PORT_BASE + RAFT_PORT_SPAN)`
pub const RAFT_PORT_BASE: u16 = 14000;
pub const RAFT_PORT_SPAN: u16 = 50000;
pub const DEFAULT_RTT_MILLISECOND: u64 = 100;

/// Result of applying one entry
#[derive(Debug, Clone)]
pub struct Applied {
    /// Numeric id of the job the entry touched, `0` when it has none
    pub value: u64,

    /// JSON encoding of the command's result
    pub data: Vec<u8>,

    /// To publish once the entry is applied
    pub events: Vec<Event>,
}

impl Applied {
    fn new<T: Serialize>(job: &DeploymentJob, result: &T, events: Vec<Event>) -> Result<Self, DeploydError> {
        Ok(Self {
            value: job.id.parse().unwrap_or(0),
            data: serde_json::to_vec(result)?,
            events,
        })
    }
}

/// Command handler output: the typed result and the events it produced
pub type Outcome<T> = (T, Vec<Event>);

pub struct DeploymentStateMachine {
    jobs: Box<dyn Table<DeploymentJob>>,
    instances: Box<dyn Table<ServiceInstanceHost>>,
}

impl DeploymentStateMachine {
    pub fn new(
        jobs: Box<dyn Table<DeploymentJob>>,
        instances: Box<dyn Table<ServiceInstanceHost>>,
    ) -> Self {
        Self { jobs, instances }
    }

    /// Apply one log entry
    pub fn apply(&mut self, entry: &Entry) -> Result<Applied, DeploydError> {
        debug!("Applying {}", entry.command);

        match entry.command.as_str() {
            SUBMIT_JOB => {
                let (resp, events) = self.submit_job(entry.parse()?)?;
                Applied::new(&resp.job, &resp, events)
            }
            CANCEL_JOB => {
                let (job, events) = self.cancel_job(entry.parse()?)?;
                Applied::new(&job, &job, events)
            }
            HOST_CONFIGURATION_UPDATE => {
                let (resp, events) = self.host_configuration_update(entry.parse()?)?;
                Applied::new(&resp.job, &resp, events)
            }
            RESTART_CONFIRMATION => {
                let (resp, events) = self.restart_confirmation(entry.parse()?)?;
                Applied::new(&resp.job, &resp, events)
            }
            HOST_RESTART_SERVICE_UPDATE => {
                let (resp, events) = self.host_restart_service_update(entry.parse()?)?;
                Applied::new(&resp.job, &resp, events)
            }
            other => Err(DeploydError::ValidationError(format!(
                "unknown command: {}",
                other
            ))),
        }
    }

    /// Create a job for `request`, creating the service's instances on
    /// first deployment.
    pub fn submit_job(
        &mut self,
        mut request: SubmitDeploymentJobRequest,
    ) -> Result<Outcome<SubmitJobResponse>, DeploydError> {
        if request.namespace.is_empty() {
            return Err(DeploydError::ValidationError("namespace is required".to_string()));
        }
        if request.service.id.is_empty() {
            return Err(DeploydError::ValidationError("service id is required".to_string()));
        }
        if request.service.namespace.is_empty() {
            request.service.namespace = request.namespace.clone();
        } else if request.service.namespace != request.namespace {
            return Err(DeploydError::ValidationError(format!(
                "service namespace {} does not match job namespace {}",
                request.service.namespace, request.namespace
            )));
        }

        let namespace = request.namespace.clone();
        let service = request.service.id.clone();

        // Oldest first, so the rollout order follows creation order
        let mut instances = self.instances.get(&namespace, &[service.clone()], None)?;
        instances.reverse();

        let created = if instances.is_empty() {
            let created = new_instances(&request)?;
            instances = created.clone();
            created
        } else {
            if !request.target_hosts.is_empty() {
                let existing: HashSet<&str> = instances.iter().map(|i| i.host.as_str()).collect();
                let requested: HashSet<&str> =
                    request.target_hosts.iter().map(|t| t.host.as_str()).collect();
                if existing != requested {
                    let mut hosts: Vec<&str> = existing.into_iter().collect();
                    hosts.sort_unstable();
                    return Err(DeploydError::ValidationError(format!(
                        "service {}/{} already runs on {:?}; target hosts must be omitted or name exactly those hosts",
                        namespace, service, hosts
                    )));
                }
            }
            Vec::new()
        };

        let host_order: Vec<String> = instances.iter().map(|i| i.host.clone()).collect();
        let configuration = Configuration {
            status: host_order
                .iter()
                .map(|h| (h.clone(), HostConfigurationStatusInfo::pending()))
                .collect(),
        };
        let deployment = Deployment {
            confirmed_by: None,
            current_order: None,
            status: host_order
                .iter()
                .map(|h| (h.clone(), HostDeploymentStatusInfo::pending()))
                .collect::<BTreeMap<_, _>>(),
            host_order,
        };

        let job = DeploymentJob {
            namespace: namespace.clone(),
            id: String::new(),
            status: JobStatus::Queued,
            published_at: request.published_at,
            request,
            deployment,
            configuration,
        };

        // The job table must be answering before the first write
        self.jobs.get(&namespace, &[service.clone()], None)?;

        if !created.is_empty() {
            for instance in created {
                self.instances.post(instance)?;
            }
            info!(
                "Created {} instance(s) for {}/{}",
                instances.len(),
                namespace,
                service
            );
        }
        let job = self.jobs.post(job)?;

        info!(job = %job.key(), hosts = ?job.deployment.host_order, "Job submitted");

        let resp = SubmitJobResponse {
            submit_job_status: SubmitJobStatus::Success,
            job,
        };
        let events = vec![Event::JobCreated(resp.clone())];
        Ok((resp, events))
    }

    /// Mark a job cancelled. Host work is stopped by the resulting event.
    pub fn cancel_job(
        &mut self,
        request: CancelJobRequest,
    ) -> Result<Outcome<DeploymentJob>, DeploydError> {
        let mut job = self.load_job(&request.namespace, &request.service, &request.job_id)?;

        match job.status {
            JobStatus::Cancelled => return Ok((job, Vec::new())),
            status if status.is_terminal() => {
                return Err(DeploydError::InvalidState(format!(
                    "job already finished with status {}",
                    status
                )));
            }
            _ => {}
        }

        job.status = JobFsm::new(job.status).process(JobEvent::Cancel)?;
        let job = self.jobs.post(job)?;

        info!(job = %job.key(), reason = ?request.reason, "Job cancelled");

        let events = vec![Event::JobCancelled(JobCancelled {
            job: job.clone(),
            reason: request.reason,
        })];
        Ok((job, events))
    }

    /// Record a host's configuration outcome
    pub fn host_configuration_update(
        &mut self,
        request: ConfigurationUpdateRequest,
    ) -> Result<Outcome<ConfigurationUpdateResponse>, DeploydError> {
        let mut job = self.load_job(&request.namespace, &request.service, &request.job_id)?;

        if !job.is_participant(&request.host_name) {
            return Err(DeploydError::ValidationError(format!(
                "invalid host '{}', job hosts are {:?}",
                request.host_name, job.deployment.host_order
            )));
        }
        if job.status.is_terminal() {
            return Err(DeploydError::InvalidState(format!(
                "job already finished with status {}",
                job.status
            )));
        }

        job.configuration.status.insert(
            request.host_name.clone(),
            HostConfigurationStatusInfo {
                status: request.status,
                error_message: request.error_message.clone(),
            },
        );

        let mut fsm = JobFsm::new(job.status);
        let configuring = matches!(job.status, JobStatus::Queued | JobStatus::Configuring);

        if configuring && request.status == HostConfigurationStatus::Configuring {
            fsm.process(JobEvent::ConfigurationStarted)?;
        }

        let all_configured = configuring && job.configuration.all_succeeded();
        if all_configured {
            fsm.process(JobEvent::AllConfigured)?;
        }

        if !configuring {
            debug!(
                job = %job.key(),
                host = %request.host_name,
                "Configuration report after the configuring phase, status left at {}",
                job.status
            );
        }
        if matches!(
            request.status,
            HostConfigurationStatus::Failed | HostConfigurationStatus::TimedOut
        ) {
            warn!(
                job = %job.key(),
                host = %request.host_name,
                error = ?request.error_message,
                "Host failed to configure"
            );
        }

        job.status = fsm.status();
        let job = self.jobs.post(job)?;

        let resp = ConfigurationUpdateResponse {
            confirm_immediately: job.request.trust,
            all_configured,
            trigger_host: request.host_name,
            job,
        };

        let mut events = vec![Event::HostConfigured(resp.clone())];
        if all_configured {
            info!(job = %resp.job.key(), "All hosts configured");
            events.push(Event::AllHostsConfigured(resp.clone()));
        }
        Ok((resp, events))
    }

    /// Open, or re-announce, the current restart step
    pub fn restart_confirmation(
        &mut self,
        request: RestartConfirmation,
    ) -> Result<Outcome<HostRestartConfirmationResponse>, DeploydError> {
        let mut job = self.load_job(&request.namespace, &request.service, &request.job_id)?;

        let previous = job.status;
        job.status = JobFsm::new(previous)
            .process(JobEvent::RestartConfirmed)
            .map_err(|_| {
                DeploydError::InvalidState(format!(
                    "cannot confirm restart, job status is {} (expected CONFIGURED or DEPLOYING)",
                    previous
                ))
            })?;

        if previous == JobStatus::Configured {
            job.deployment.current_order = Some(0);
            job.deployment.confirmed_by = Some(request.agent.clone());
        }

        let job = self.jobs.post(job)?;

        let step = job.deployment.current_order.unwrap_or(0);
        let target_host = job.deployment.host_order.get(step).cloned();

        info!(
            job = %job.key(),
            agent = %request.agent,
            step,
            target = ?target_host,
            "Restart confirmed"
        );

        let resp = HostRestartConfirmationResponse {
            current_step: step,
            target_host,
            message: request.message,
            job,
        };
        let events = vec![Event::RestartConfirmed(resp.clone())];
        Ok((resp, events))
    }

    /// Record the head-of-order host's restart outcome and move the cursor
    pub fn host_restart_service_update(
        &mut self,
        request: HostRestartServiceUpdateRequest,
    ) -> Result<Outcome<HostRestartServiceUpdateResponse>, DeploydError> {
        let mut job = self.load_job(&request.namespace, &request.service, &request.job_id)?;

        if job.status != JobStatus::Deploying {
            return Err(DeploydError::InvalidState(format!(
                "job is not deploying, status is {}",
                job.status
            )));
        }

        let step = job.deployment.current_order.ok_or_else(|| {
            DeploydError::Internal(format!("job {} is deploying without a cursor", job.key()))
        })?;
        let head = job.deployment.head_host().map(str::to_string).ok_or_else(|| {
            DeploydError::InvalidState(format!("job {} has no host left to restart", job.key()))
        })?;

        if head != request.host_name {
            return Err(DeploydError::ValidationError(format!(
                "host {} is not yet on deployment, waiting for {}",
                request.host_name, head
            )));
        }
        if let Some(order) = request.order {
            if order != step {
                return Err(DeploydError::ValidationError(format!(
                    "stale report for step {}, current step is {}",
                    order, step
                )));
            }
        }

        job.deployment.status.insert(
            request.host_name.clone(),
            HostDeploymentStatusInfo {
                status: request.status,
                error_message: request.error_message.clone(),
            },
        );

        let mut fsm = JobFsm::new(job.status);

        match request.status {
            HostDeploymentStatus::Failed | HostDeploymentStatus::TimedOut => {
                let event = if request.status == HostDeploymentStatus::Failed {
                    JobEvent::RolloutFailed
                } else {
                    JobEvent::RolloutTimedOut
                };
                job.status = fsm.process(event)?;
                let job = self.jobs.post(job)?;

                warn!(
                    job = %job.key(),
                    host = %request.host_name,
                    error = ?request.error_message,
                    "Deployment failed at step {}",
                    step
                );

                let resp = HostRestartServiceUpdateResponse {
                    current_step: step,
                    target_host: Some(head),
                    trigger_host: request.host_name,
                    deploy_immediately: false,
                    failed: true,
                    fail_reason: request
                        .error_message
                        .or_else(|| Some(format!("host reported {}", request.status))),
                    job,
                };
                let events = vec![Event::DeploymentFailed(resp.clone())];
                Ok((resp, events))
            }
            HostDeploymentStatus::Success => {
                let next = step + 1;
                job.deployment.current_order = Some(next);

                let done = next >= job.deployment.host_order.len();
                job.status = fsm.process(if done {
                    JobEvent::RolloutCompleted
                } else {
                    JobEvent::HostRestarted
                })?;
                let job = self.jobs.post(job)?;

                let resp = HostRestartServiceUpdateResponse {
                    current_step: next,
                    target_host: job.deployment.host_order.get(next).cloned(),
                    trigger_host: request.host_name,
                    deploy_immediately: !done && job.request.trust,
                    failed: false,
                    fail_reason: None,
                    job,
                };

                let mut events = vec![Event::ServiceRestarted(resp.clone())];
                if done {
                    info!(job = %resp.job.key(), "All services restarted");
                    events.push(Event::AllServicesRestarted(resp.clone()));
                } else {
                    info!(
                        job = %resp.job.key(),
                        host = %resp.trigger_host,
                        next = ?resp.target_host,
                        "Service restarted"
                    );
                }
                Ok((resp, events))
            }
            _ => {
                let job = self.jobs.post(job)?;
                let resp = HostRestartServiceUpdateResponse {
                    current_step: step,
                    target_host: Some(head),
                    trigger_host: request.host_name,
                    deploy_immediately: false,
                    failed: false,
                    fail_reason: None,
                    job,
                };
                let events = vec![Event::HostRestartProgress(resp.clone())];
                Ok((resp, events))
            }
        }
    }

    pub fn get_job(&self, namespace: &str, service: &str, id: &str) -> Result<DeploymentJob, DeploydError> {
        self.load_job(namespace, service, id)
    }

    /// Jobs of a service, newest first
    pub fn list_jobs(&self, namespace: &str, service: &str) -> Result<Vec<DeploymentJob>, DeploydError> {
        self.jobs.get(namespace, &[service.to_string()], None)
    }

    /// Where a service runs, in creation order
    pub fn list_instances(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<ServiceInstanceHost>, DeploydError> {
        let mut instances = self.instances.get(namespace, &[service.to_string()], None)?;
        instances.reverse();
        Ok(instances)
    }

    fn load_job(&self, namespace: &str, service: &str, id: &str) -> Result<DeploymentJob, DeploydError> {
        if id.is_empty() {
            return Err(DeploydError::ValidationError("job id is required".to_string()));
        }
        self.jobs
            .get(namespace, &[service.to_string()], Some(id))?
            .into_iter()
            .next()
            .ok_or_else(|| DeploydError::NotFound(format!("job {}/{}/{}", namespace, service, id)))
    }
}

/// Instance records for a service's first deployment
fn new_instances(
    request: &SubmitDeploymentJobRequest,
) -> Result<Vec<ServiceInstanceHost>, DeploydError> {
    if request.target_hosts.is_empty() {
        return Err(DeploydError::ValidationError(
            "for a new deployment, target hosts are required".to_string(),
        ));
    }

    let pair = format!("{}_{}", request.namespace, request.service.id);
    let port = derive_raft_port(&request.namespace, &request.service.id);

    let mut hosts = HashSet::new();
    let mut replica_ids = HashSet::new();
    let mut instances = Vec::with_capacity(request.target_hosts.len());

    for target in &request.target_hosts {
        if target.host.is_empty() {
            return Err(DeploydError::ValidationError("target host name is empty".to_string()));
        }
        if !hosts.insert(target.host.as_str()) {
            return Err(DeploydError::ValidationError(format!(
                "duplicate target host: {}",
                target.host
            )));
        }
        if !replica_ids.insert(target.raft_config.replica_id) {
            return Err(DeploydError::ValidationError(format!(
                "duplicate replica ID found: {}",
                target.raft_config.replica_id
            )));
        }

        instances.push(ServiceInstanceHost {
            namespace: request.namespace.clone(),
            service: request.service.id.clone(),
            host: target.host.clone(),
            raft_config: Some(RaftConfig {
                raft_port: port,
                replica_id: target.raft_config.replica_id,
                wal_dir: join_dir(&target.raft_config.wal_dir, &pair),
                node_host_dir: join_dir(&target.raft_config.node_host_dir, &pair),
                rtt_millisecond: DEFAULT_RTT_MILLISECOND,
            }),
            published_at: request.published_at,
        });
    }

    Ok(instances)
}

/// Replica port of a service, identical on every replica applying the entry
pub fn derive_raft_port(namespace: &str, service: &str) -> u16 {
    let digest = Sha256::digest(format!("{}_{}", namespace, service).as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let offset = u64::from_be_bytes(head) % u64::from(RAFT_PORT_SPAN);
    RAFT_PORT_BASE + offset as u16
}

fn join_dir(base: &str, name: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}
