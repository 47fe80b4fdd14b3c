//! Single-node replicated log and its typed client

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use deployd_api::{
    CancelJobRequest, ConfigurationUpdateRequest, ConfigurationUpdateResponse, DeploymentJob,
    HostRestartConfirmationResponse, HostRestartServiceUpdateRequest,
    HostRestartServiceUpdateResponse, RestartConfirmation, SubmitDeploymentJobRequest,
    SubmitJobResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::coordinator::app::{Applied, DeploymentStateMachine};
use crate::coordinator::commands::{
    Entry, CANCEL_JOB, HOST_CONFIGURATION_UPDATE, HOST_RESTART_SERVICE_UPDATE,
    RESTART_CONFIRMATION, SUBMIT_JOB,
};
use crate::errors::DeploydError;
use crate::events::EventBus;

/// Typed access to the deployment state machine.
///
/// Writes go through the log; reads may be served by a lagging replica and
/// fail with [`DeploydError::NotReady`].
#[async_trait]
pub trait JobCoordinator: Send + Sync {
    async fn submit_job(
        &self,
        request: SubmitDeploymentJobRequest,
    ) -> Result<SubmitJobResponse, DeploydError>;

    async fn cancel_job(&self, request: CancelJobRequest) -> Result<DeploymentJob, DeploydError>;

    async fn feed_host_configuration_update(
        &self,
        request: ConfigurationUpdateRequest,
    ) -> Result<ConfigurationUpdateResponse, DeploydError>;

    async fn confirm_restart(
        &self,
        request: RestartConfirmation,
    ) -> Result<HostRestartConfirmationResponse, DeploydError>;

    async fn feed_host_restart_update(
        &self,
        request: HostRestartServiceUpdateRequest,
    ) -> Result<HostRestartServiceUpdateResponse, DeploydError>;

    async fn get_job(
        &self,
        namespace: &str,
        service: &str,
        id: &str,
    ) -> Result<DeploymentJob, DeploydError>;

    /// Jobs of a service, newest first
    async fn list_jobs(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<DeploymentJob>, DeploydError>;
}

type Reply<T> = oneshot::Sender<Result<T, DeploydError>>;

enum Request {
    Propose {
        entry: Entry,
        reply: Reply<Applied>,
    },
    GetJob {
        namespace: String,
        service: String,
        id: String,
        reply: Reply<DeploymentJob>,
    },
    ListJobs {
        namespace: String,
        service: String,
        reply: Reply<Vec<DeploymentJob>>,
    },
}

/// In-process stand-in for the consensus log.
///
/// One task owns the state machine and applies proposals one at a time in
/// arrival order, then publishes the resulting events.
pub struct LocalLog {
    machine: DeploymentStateMachine,
    bus: EventBus,
    requests: mpsc::Receiver<Request>,
    applied_index: u64,
}

impl LocalLog {
    pub fn new(
        machine: DeploymentStateMachine,
        bus: EventBus,
        queue_capacity: usize,
    ) -> (Self, LocalCoordinator) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let log = Self {
            machine,
            bus,
            requests: rx,
            applied_index: 0,
        };
        (log, LocalCoordinator { requests: tx })
    }

    /// Serve requests until shutdown or until every client is gone
    pub async fn run(mut self, mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>) {
        info!("Local log starting...");

        loop {
            let request = tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Local log shutting down at index {}...", self.applied_index);
                    return;
                }
                request = self.requests.recv() => match request {
                    Some(request) => request,
                    None => {
                        info!("Local log has no clients left, stopping");
                        return;
                    }
                },
            };

            self.handle(request);
        }
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::Propose { entry, reply } => {
                let result = self.machine.apply(&entry);
                match &result {
                    Ok(applied) => {
                        self.applied_index += 1;
                        debug!(
                            "Applied {} at index {} ({} event(s))",
                            entry.command,
                            self.applied_index,
                            applied.events.len()
                        );
                        for event in applied.events.iter().cloned() {
                            self.bus.publish(event);
                        }
                    }
                    Err(e) => warn!("Rejected {}: {}", entry.command, e),
                }
                let _ = reply.send(result);
            }
            Request::GetJob {
                namespace,
                service,
                id,
                reply,
            } => {
                let _ = reply.send(self.machine.get_job(&namespace, &service, &id));
            }
            Request::ListJobs {
                namespace,
                service,
                reply,
            } => {
                let _ = reply.send(self.machine.list_jobs(&namespace, &service));
            }
        }
    }
}

/// [`JobCoordinator`] backed by a [`LocalLog`]
#[derive(Clone)]
pub struct LocalCoordinator {
    requests: mpsc::Sender<Request>,
}

impl LocalCoordinator {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Request) -> Result<T, DeploydError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| DeploydError::NotReady("log is not running".to_string()))?;
        rx.await
            .map_err(|_| DeploydError::Internal("log dropped the request".to_string()))?
    }

    async fn propose<P: Serialize, R: DeserializeOwned>(
        &self,
        command: &str,
        payload: &P,
    ) -> Result<R, DeploydError> {
        let entry = Entry::new(command, payload)?;
        let applied = self.call(|reply| Request::Propose { entry, reply }).await?;
        Ok(serde_json::from_slice(&applied.data)?)
    }
}

#[async_trait]
impl JobCoordinator for LocalCoordinator {
    async fn submit_job(
        &self,
        request: SubmitDeploymentJobRequest,
    ) -> Result<SubmitJobResponse, DeploydError> {
        self.propose(SUBMIT_JOB, &request).await
    }

    async fn cancel_job(&self, request: CancelJobRequest) -> Result<DeploymentJob, DeploydError> {
        self.propose(CANCEL_JOB, &request).await
    }

    async fn feed_host_configuration_update(
        &self,
        request: ConfigurationUpdateRequest,
    ) -> Result<ConfigurationUpdateResponse, DeploydError> {
        self.propose(HOST_CONFIGURATION_UPDATE, &request).await
    }

    async fn confirm_restart(
        &self,
        request: RestartConfirmation,
    ) -> Result<HostRestartConfirmationResponse, DeploydError> {
        self.propose(RESTART_CONFIRMATION, &request).await
    }

    async fn feed_host_restart_update(
        &self,
        request: HostRestartServiceUpdateRequest,
    ) -> Result<HostRestartServiceUpdateResponse, DeploydError> {
        self.propose(HOST_RESTART_SERVICE_UPDATE, &request).await
    }

    async fn get_job(
        &self,
        namespace: &str,
        service: &str,
        id: &str,
    ) -> Result<DeploymentJob, DeploydError> {
        self.call(|reply| Request::GetJob {
            namespace: namespace.to_string(),
            service: service.to_string(),
            id: id.to_string(),
            reply,
        })
        .await
    }

    async fn list_jobs(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Vec<DeploymentJob>, DeploydError> {
        self.call(|reply| Request::ListJobs {
            namespace: namespace.to_string(),
            service: service.to_string(),
            reply,
        })
        .await
    }
}
