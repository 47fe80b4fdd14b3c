//! Job status machine tests

use deployd::coordinator::fsm::{JobEvent, JobFsm};
use deployd_api::JobStatus;

#[test]
fn test_fsm_initial_state() {
    let fsm = JobFsm::new(JobStatus::Queued);
    assert_eq!(fsm.status(), JobStatus::Queued);
}

#[test]
fn test_fsm_configuring_flow() {
    let mut fsm = JobFsm::new(JobStatus::Queued);

    // Queued -> Configuring, repeatable while hosts report in
    fsm.process(JobEvent::ConfigurationStarted).unwrap();
    fsm.process(JobEvent::ConfigurationStarted).unwrap();
    assert_eq!(fsm.status(), JobStatus::Configuring);

    // Configuring -> Configured
    fsm.process(JobEvent::AllConfigured).unwrap();
    assert_eq!(fsm.status(), JobStatus::Configured);
}

#[test]
fn test_fsm_single_host_skips_configuring() {
    let mut fsm = JobFsm::new(JobStatus::Queued);
    fsm.process(JobEvent::AllConfigured).unwrap();
    assert_eq!(fsm.status(), JobStatus::Configured);
}

#[test]
fn test_fsm_rollout_failure() {
    let mut fsm = JobFsm::new(JobStatus::Configured);
    fsm.process(JobEvent::RestartConfirmed).unwrap();
    fsm.process(JobEvent::RolloutFailed).unwrap();
    assert_eq!(fsm.status(), JobStatus::Failed);

    let mut fsm = JobFsm::new(JobStatus::Deploying);
    fsm.process(JobEvent::RolloutTimedOut).unwrap();
    assert_eq!(fsm.status(), JobStatus::TimedOut);
}

#[test]
fn test_fsm_cancel_from_any_live_status() {
    for status in [
        JobStatus::Queued,
        JobStatus::Configuring,
        JobStatus::Configured,
        JobStatus::Deploying,
    ] {
        let mut fsm = JobFsm::new(status);
        assert_eq!(fsm.process(JobEvent::Cancel).unwrap(), JobStatus::Cancelled);
    }
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = JobFsm::new(JobStatus::Queued);

    // Can't confirm a restart before every host is configured
    let result = fsm.process(JobEvent::RestartConfirmed);
    assert!(result.is_err());
    assert_eq!(fsm.status(), JobStatus::Queued);

    let mut fsm = JobFsm::new(JobStatus::Configured);
    assert!(fsm.process(JobEvent::HostRestarted).is_err());
    assert!(fsm.process(JobEvent::ConfigurationStarted).is_err());
    assert_eq!(fsm.status(), JobStatus::Configured);
}
