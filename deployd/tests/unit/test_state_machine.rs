//! Deployment state machine tests

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use deployd::coordinator::commands::{Entry, CANCEL_JOB, SUBMIT_JOB};
use deployd::coordinator::DeploymentStateMachine;
use deployd::errors::DeploydError;
use deployd::store::memory::MemoryTable;
use deployd_api::{
    CancelJobRequest, ConfigurationUpdateRequest, DeploymentJob, Event, HostConfigurationStatus,
    HostDeploymentStatus, HostRestartServiceUpdateRequest, JobStatus, RestartConfirmation,
    ServiceInstanceHost, TargetHost,
};

use crate::common::{machine, request};

const HOSTS: [&str; 2] = ["host-a", "host-b"];

fn submit(machine: &mut DeploymentStateMachine, trust: bool) -> DeploymentJob {
    let (resp, events) = machine
        .submit_job(request("prod", "api", &HOSTS, trust))
        .unwrap();
    assert!(matches!(events.as_slice(), [Event::JobCreated(_)]));
    resp.job
}

fn configured(
    machine: &mut DeploymentStateMachine,
    job: &DeploymentJob,
    host: &str,
    status: HostConfigurationStatus,
) -> Result<(DeploymentJob, Vec<Event>), DeploydError> {
    machine
        .host_configuration_update(ConfigurationUpdateRequest {
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            service: job.service_id().to_string(),
            host_name: host.to_string(),
            status,
            error_message: None,
            updated_at: None,
        })
        .map(|(resp, events)| (resp.job, events))
}

fn confirm(
    machine: &mut DeploymentStateMachine,
    job: &DeploymentJob,
) -> Result<(DeploymentJob, Vec<Event>), DeploydError> {
    machine
        .restart_confirmation(RestartConfirmation {
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            service: job.service_id().to_string(),
            agent: "operator".to_string(),
            message: "go".to_string(),
            created_at: None,
        })
        .map(|(resp, events)| (resp.job, events))
}

fn restarted(
    machine: &mut DeploymentStateMachine,
    job: &DeploymentJob,
    host: &str,
    status: HostDeploymentStatus,
    order: Option<usize>,
) -> Result<(DeploymentJob, Vec<Event>), DeploydError> {
    machine
        .host_restart_service_update(HostRestartServiceUpdateRequest {
            namespace: job.namespace.clone(),
            job_id: job.id.clone(),
            service: job.service_id().to_string(),
            host_name: host.to_string(),
            status,
            error_message: None,
            order,
            updated_at: None,
        })
        .map(|(resp, events)| (resp.job, events))
}

fn configure_all(machine: &mut DeploymentStateMachine, job: &DeploymentJob) -> DeploymentJob {
    let mut last = job.clone();
    for host in HOSTS {
        last = configured(machine, job, host, HostConfigurationStatus::Success)
            .unwrap()
            .0;
    }
    last
}

#[test]
fn test_submit_creates_instances_in_request_order() {
    let mut machine = machine();
    let job = submit(&mut machine, false);

    assert_eq!(job.id, "1");
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.request.service.namespace, "prod");
    assert_eq!(job.deployment.host_order, vec!["host-a", "host-b"]);
    assert_eq!(job.deployment.current_order, None);
    assert!(job.is_participant("host-a"));
    assert!(!job.is_participant("host-c"));

    let instances = machine.list_instances("prod", "api").unwrap();
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].host, "host-a");
    let raft = instances[0].raft_config.as_ref().unwrap();
    assert_eq!(raft.replica_id, 1);
    assert_eq!(raft.wal_dir, "/var/lib/wal/prod_api");
    assert_eq!(
        raft.raft_port,
        instances[1].raft_config.as_ref().unwrap().raft_port
    );
}

#[test]
fn test_second_submission_reuses_instances() {
    let mut machine = machine();
    submit(&mut machine, false);

    let mut again = request("prod", "api", &[], false);
    again.build_version = 8;
    let (resp, _) = machine.submit_job(again).unwrap();
    assert_eq!(resp.job.id, "2");
    assert_eq!(resp.job.deployment.host_order, vec!["host-a", "host-b"]);

    let jobs = machine.list_jobs("prod", "api").unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, "2");
}

#[test]
fn test_submit_rejects_different_target_hosts() {
    let mut machine = machine();
    submit(&mut machine, false);

    let other = request("prod", "api", &["host-a", "host-c"], false);
    let err = machine.submit_job(other).unwrap_err();
    assert!(matches!(err, DeploydError::ValidationError(_)));
    assert_eq!(machine.list_jobs("prod", "api").unwrap().len(), 1);
}

#[test]
fn test_first_submission_requires_target_hosts() {
    let mut machine = machine();
    let err = machine
        .submit_job(request("prod", "api", &[], false))
        .unwrap_err();
    assert!(matches!(err, DeploydError::ValidationError(_)));
}

#[test]
fn test_submit_rejects_duplicate_replica_ids() {
    let mut machine = machine();
    let mut req = request("prod", "api", &HOSTS, false);
    req.target_hosts[1].raft_config.replica_id = req.target_hosts[0].raft_config.replica_id;

    let err = machine.submit_job(req).unwrap_err();
    assert!(err.to_string().contains("duplicate replica ID"));
    assert!(machine.list_instances("prod", "api").unwrap().is_empty());
}

#[test]
fn test_submit_rejects_duplicate_hosts() {
    let mut machine = machine();
    let mut req = request("prod", "api", &HOSTS, false);
    req.target_hosts.push(TargetHost {
        host: "host-a".to_string(),
        ..Default::default()
    });
    req.target_hosts[2].raft_config.replica_id = 9;

    assert!(matches!(
        machine.submit_job(req).unwrap_err(),
        DeploydError::ValidationError(_)
    ));
}

#[test]
fn test_rollout_waits_for_confirmation_between_hosts() {
    let mut machine = machine();
    let job = submit(&mut machine, false);

    let (after_a, events) =
        configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap();
    assert_eq!(after_a.status, JobStatus::Queued);
    assert!(matches!(events.as_slice(), [Event::HostConfigured(_)]));

    let (after_b, events) =
        configured(&mut machine, &job, "host-b", HostConfigurationStatus::Success).unwrap();
    assert_eq!(after_b.status, JobStatus::Configured);
    match events.as_slice() {
        [Event::HostConfigured(_), Event::AllHostsConfigured(resp)] => {
            assert!(resp.all_configured);
            assert!(!resp.confirm_immediately);
            assert_eq!(resp.trigger_host, "host-b");
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let (job, events) = confirm(&mut machine, &job).unwrap();
    assert_eq!(job.status, JobStatus::Deploying);
    assert_eq!(job.deployment.current_order, Some(0));
    assert_eq!(job.deployment.confirmed_by.as_deref(), Some("operator"));
    match events.as_slice() {
        [Event::RestartConfirmed(resp)] => {
            assert_eq!(resp.current_step, 0);
            assert_eq!(resp.target_host.as_deref(), Some("host-a"));
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let (job, events) =
        restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Success, Some(0)).unwrap();
    assert_eq!(job.status, JobStatus::Deploying);
    assert_eq!(job.deployment.current_order, Some(1));
    match events.as_slice() {
        [Event::ServiceRestarted(resp)] => {
            assert_eq!(resp.target_host.as_deref(), Some("host-b"));
            assert!(!resp.deploy_immediately);
        }
        other => panic!("unexpected events: {:?}", other),
    }

    // a second confirmation re-announces the current step
    let (job, events) = confirm(&mut machine, &job).unwrap();
    assert_eq!(job.deployment.current_order, Some(1));
    assert_eq!(job.deployment.confirmed_by.as_deref(), Some("operator"));
    match events.as_slice() {
        [Event::RestartConfirmed(resp)] => {
            assert_eq!(resp.target_host.as_deref(), Some("host-b"));
        }
        other => panic!("unexpected events: {:?}", other),
    }

    let (job, events) =
        restarted(&mut machine, &job, "host-b", HostDeploymentStatus::Success, None).unwrap();
    assert_eq!(job.status, JobStatus::Deployed);
    assert_eq!(job.deployment.current_order, Some(2));
    assert!(matches!(
        events.as_slice(),
        [Event::ServiceRestarted(_), Event::AllServicesRestarted(_)]
    ));

    // terminal: nothing moves the job any more
    assert!(matches!(
        confirm(&mut machine, &job).unwrap_err(),
        DeploydError::InvalidState(_)
    ));
}

#[test]
fn test_trusted_job_flags_auto_advance() {
    let mut machine = machine();
    let job = submit(&mut machine, true);

    configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap();
    let (_, events) =
        configured(&mut machine, &job, "host-b", HostConfigurationStatus::Success).unwrap();
    match &events[1] {
        Event::AllHostsConfigured(resp) => assert!(resp.confirm_immediately),
        other => panic!("unexpected event: {:?}", other),
    }

    confirm(&mut machine, &job).unwrap();
    let (_, events) =
        restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Success, Some(0)).unwrap();
    match events.as_slice() {
        [Event::ServiceRestarted(resp)] => {
            assert!(resp.deploy_immediately);
            assert_eq!(resp.trigger_host, "host-a");
        }
        other => panic!("unexpected events: {:?}", other),
    }

    // never set once the last host is done
    let (_, events) =
        restarted(&mut machine, &job, "host-b", HostDeploymentStatus::Success, Some(1)).unwrap();
    match &events[0] {
        Event::ServiceRestarted(resp) => assert!(!resp.deploy_immediately),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn test_head_host_failure_fails_job() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configure_all(&mut machine, &job);
    confirm(&mut machine, &job).unwrap();

    let (job, events) =
        restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Failed, Some(0)).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.deployment.current_order, Some(0));
    assert_eq!(
        job.deployment.status["host-b"].status,
        HostDeploymentStatus::Pending
    );
    match events.as_slice() {
        [Event::DeploymentFailed(resp)] => {
            assert!(resp.failed);
            assert!(resp.fail_reason.is_some());
        }
        other => panic!("unexpected events: {:?}", other),
    }

    assert!(matches!(
        restarted(&mut machine, &job, "host-b", HostDeploymentStatus::Success, None).unwrap_err(),
        DeploydError::InvalidState(_)
    ));
}

#[test]
fn test_head_host_timeout_times_job_out() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configure_all(&mut machine, &job);
    confirm(&mut machine, &job).unwrap();

    let (job, _) =
        restarted(&mut machine, &job, "host-a", HostDeploymentStatus::TimedOut, Some(0)).unwrap();
    assert_eq!(job.status, JobStatus::TimedOut);
}

#[test]
fn test_out_of_turn_report_is_rejected() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configure_all(&mut machine, &job);
    confirm(&mut machine, &job).unwrap();

    let err = restarted(&mut machine, &job, "host-b", HostDeploymentStatus::Success, None)
        .unwrap_err();
    assert!(matches!(err, DeploydError::ValidationError(_)));

    let job = machine.get_job("prod", "api", &job.id).unwrap();
    assert_eq!(job.deployment.current_order, Some(0));
    assert_eq!(
        job.deployment.status["host-b"].status,
        HostDeploymentStatus::Pending
    );
}

#[test]
fn test_stale_order_is_rejected() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configure_all(&mut machine, &job);
    confirm(&mut machine, &job).unwrap();
    restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Success, Some(0)).unwrap();
    confirm(&mut machine, &job).unwrap();

    let err = restarted(&mut machine, &job, "host-b", HostDeploymentStatus::Success, Some(0))
        .unwrap_err();
    assert!(err.to_string().contains("stale"));
}

#[test]
fn test_restart_report_before_deploying_is_rejected() {
    let mut machine = machine();
    let job = submit(&mut machine, false);

    let err = restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Success, None)
        .unwrap_err();
    assert!(matches!(err, DeploydError::InvalidState(_)));
}

#[test]
fn test_confirmation_requires_configured_job() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap();

    assert!(matches!(
        confirm(&mut machine, &job).unwrap_err(),
        DeploydError::InvalidState(_)
    ));
}

#[test]
fn test_progress_report_keeps_cursor() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configure_all(&mut machine, &job);
    confirm(&mut machine, &job).unwrap();

    let (job, events) =
        restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Restarting, Some(0))
            .unwrap();
    assert_eq!(job.status, JobStatus::Deploying);
    assert_eq!(job.deployment.current_order, Some(0));
    assert_eq!(
        job.deployment.status["host-a"].status,
        HostDeploymentStatus::Restarting
    );
    assert!(matches!(events.as_slice(), [Event::HostRestartProgress(_)]));
}

#[test]
fn test_configuration_failure_blocks_configured() {
    let mut machine = machine();
    let job = submit(&mut machine, false);

    let (job_after, _) =
        configured(&mut machine, &job, "host-a", HostConfigurationStatus::Configuring).unwrap();
    assert_eq!(job_after.status, JobStatus::Configuring);

    configured(&mut machine, &job, "host-a", HostConfigurationStatus::Failed).unwrap();
    let (job_after, events) =
        configured(&mut machine, &job, "host-b", HostConfigurationStatus::Success).unwrap();
    assert_eq!(job_after.status, JobStatus::Configuring);
    assert_eq!(events.len(), 1);

    // a later success from the failed host completes the phase
    let (job_after, events) =
        configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap();
    assert_eq!(job_after.status, JobStatus::Configured);
    assert_eq!(events.len(), 2);
}

#[test]
fn test_late_configuration_success_announces_nothing_new() {
    let mut machine = machine();
    let job = submit(&mut machine, true);
    configure_all(&mut machine, &job);

    // duplicate report once CONFIGURED
    let (job_after, events) =
        configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap();
    assert_eq!(job_after.status, JobStatus::Configured);
    assert!(matches!(events.as_slice(), [Event::HostConfigured(_)]));

    // and while DEPLOYING
    confirm(&mut machine, &job).unwrap();
    let (job_after, events) =
        configured(&mut machine, &job, "host-b", HostConfigurationStatus::Success).unwrap();
    assert_eq!(job_after.status, JobStatus::Deploying);
    assert_eq!(job_after.deployment.current_order, Some(0));
    assert!(matches!(events.as_slice(), [Event::HostConfigured(_)]));

    // once DEPLOYED the job takes no more reports
    restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Success, Some(0)).unwrap();
    confirm(&mut machine, &job).unwrap();
    let (done, _) =
        restarted(&mut machine, &job, "host-b", HostDeploymentStatus::Success, Some(1)).unwrap();
    assert_eq!(done.status, JobStatus::Deployed);

    let err = configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap_err();
    assert!(matches!(err, DeploydError::InvalidState(_)));
}

#[test]
fn test_rejected_submission_leaves_no_instances() {
    let jobs_ready = Arc::new(AtomicBool::new(false));
    let mut machine = DeploymentStateMachine::new(
        Box::new(MemoryTable::<DeploymentJob>::incremental().with_readiness(jobs_ready.clone())),
        Box::new(MemoryTable::<ServiceInstanceHost>::new()),
    );

    let err = machine
        .submit_job(request("prod", "api", &HOSTS, false))
        .unwrap_err();
    assert!(matches!(err, DeploydError::NotReady(_)));

    // no instances were kept, so a different host set is still a first deployment
    jobs_ready.store(true, Ordering::SeqCst);
    let (resp, _) = machine
        .submit_job(request("prod", "api", &["host-c"], false))
        .unwrap();
    assert_eq!(resp.job.deployment.host_order, vec!["host-c"]);
}

#[test]
fn test_configuration_update_from_unknown_host() {
    let mut machine = machine();
    let job = submit(&mut machine, false);

    let err = configured(&mut machine, &job, "host-z", HostConfigurationStatus::Success)
        .unwrap_err();
    assert!(matches!(err, DeploydError::ValidationError(_)));
}

#[test]
fn test_cancel() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    let cancel = CancelJobRequest {
        namespace: "prod".to_string(),
        service: "api".to_string(),
        job_id: job.id.clone(),
        reason: Some("wrong build".to_string()),
    };

    let (cancelled, events) = machine.cancel_job(cancel.clone()).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    match events.as_slice() {
        [Event::JobCancelled(e)] => assert_eq!(e.reason.as_deref(), Some("wrong build")),
        other => panic!("unexpected events: {:?}", other),
    }

    // idempotent, no second event
    let (again, events) = machine.cancel_job(cancel).unwrap();
    assert_eq!(again.status, JobStatus::Cancelled);
    assert!(events.is_empty());

    assert!(matches!(
        configured(&mut machine, &job, "host-a", HostConfigurationStatus::Success).unwrap_err(),
        DeploydError::InvalidState(_)
    ));
}

#[test]
fn test_cancel_finished_job_is_rejected() {
    let mut machine = machine();
    let job = submit(&mut machine, false);
    configure_all(&mut machine, &job);
    confirm(&mut machine, &job).unwrap();
    restarted(&mut machine, &job, "host-a", HostDeploymentStatus::Failed, None).unwrap();

    let err = machine
        .cancel_job(CancelJobRequest {
            namespace: "prod".to_string(),
            service: "api".to_string(),
            job_id: job.id.clone(),
            reason: None,
        })
        .unwrap_err();
    assert!(matches!(err, DeploydError::InvalidState(_)));
}

#[test]
fn test_unknown_job() {
    let machine = machine();
    assert!(matches!(
        machine.get_job("prod", "api", "42").unwrap_err(),
        DeploydError::NotFound(_)
    ));
    assert!(matches!(
        machine.get_job("prod", "api", "").unwrap_err(),
        DeploydError::ValidationError(_)
    ));
}

#[test]
fn test_apply_entries() {
    let mut machine = machine();

    let entry = Entry::new(SUBMIT_JOB, &request("prod", "api", &HOSTS, false)).unwrap();
    let applied = machine.apply(&entry).unwrap();
    assert_eq!(applied.value, 1);
    assert_eq!(applied.events.len(), 1);

    let entry = Entry::new(
        CANCEL_JOB,
        &CancelJobRequest {
            namespace: "prod".to_string(),
            service: "api".to_string(),
            job_id: "1".to_string(),
            reason: None,
        },
    )
    .unwrap();
    let applied = machine.apply(&entry).unwrap();
    let job: DeploymentJob = serde_json::from_slice(&applied.data).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    let unknown = Entry::new("deployd.user.reboot", &()).unwrap();
    assert!(matches!(
        machine.apply(&unknown).unwrap_err(),
        DeploydError::ValidationError(_)
    ));

    let malformed = Entry {
        command: SUBMIT_JOB.to_string(),
        value: b"{not json".to_vec(),
    };
    assert!(matches!(
        machine.apply(&malformed).unwrap_err(),
        DeploydError::ValidationError(_)
    ));
}
