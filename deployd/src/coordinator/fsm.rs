//! Job status transitions

use deployd_api::JobStatus;

use crate::errors::DeploydError;

/// Something that happened to a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// A host reported it started installing
    ConfigurationStarted,

    /// The last host reported a successful install
    AllConfigured,

    /// Someone confirmed the next restart
    RestartConfirmed,

    /// The head-of-order host restarted and hosts remain
    HostRestarted,

    /// The last host restarted
    RolloutCompleted,

    RolloutFailed,

    RolloutTimedOut,

    Cancel,
}

/// Job status machine
#[derive(Debug, Clone)]
pub struct JobFsm {
    status: JobStatus,
}

impl JobFsm {
    pub fn new(status: JobStatus) -> Self {
        Self { status }
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: JobEvent) -> Result<JobStatus, DeploydError> {
        use JobEvent as E;
        use JobStatus as S;

        let next = match (self.status, event) {
            (S::Queued | S::Configuring, E::ConfigurationStarted) => S::Configuring,
            (S::Queued | S::Configuring, E::AllConfigured) => S::Configured,

            (S::Configured | S::Deploying, E::RestartConfirmed) => S::Deploying,
            (S::Deploying, E::HostRestarted) => S::Deploying,
            (S::Deploying, E::RolloutCompleted) => S::Deployed,
            (S::Deploying, E::RolloutFailed) => S::Failed,
            (S::Deploying, E::RolloutTimedOut) => S::TimedOut,

            (state, E::Cancel) if !state.is_terminal() => S::Cancelled,

            (state, event) => {
                return Err(DeploydError::InvalidState(format!(
                    "job in status {} cannot take {:?}",
                    state, event
                )));
            }
        };

        self.status = next;
        Ok(next)
    }
}
