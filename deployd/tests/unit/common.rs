//! Shared fixtures

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use deployd::coordinator::DeploymentStateMachine;
use deployd::errors::DeploydError;
use deployd::events::{Progress, ProgressSink};
use deployd::host::{HostTask, HostTaskRunner, JobContext};
use deployd::storage::settings::{HostSettings, PathSettings};
use deployd::store::memory::MemoryTable;
use deployd::supervisor::{ProcessSupervisor, ACTIVE, LOADED};
use deployd_api::{
    DeploymentJob, HostRaftConfig, ProgressRecord, ServiceDefinition, ServiceInstanceHost,
    SubmitDeploymentJobRequest, TargetHost,
};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio_util::sync::CancellationToken;

pub const EXECUTABLE: &str = "bin/app";

pub fn request(
    namespace: &str,
    service: &str,
    hosts: &[&str],
    trust: bool,
) -> SubmitDeploymentJobRequest {
    SubmitDeploymentJobRequest {
        namespace: namespace.to_string(),
        service: ServiceDefinition {
            namespace: String::new(),
            id: service.to_string(),
            name: format!("{} service", service),
            description: String::new(),
            executable_path: EXECUTABLE.to_string(),
        },
        build_version: 7,
        env_version: 0,
        secret_version: 0,
        timeout_seconds: None,
        trust,
        target_hosts: hosts
            .iter()
            .enumerate()
            .map(|(i, host)| TargetHost {
                host: host.to_string(),
                raft_config: HostRaftConfig {
                    replica_id: i as u64 + 1,
                    wal_dir: "/var/lib/wal".to_string(),
                    node_host_dir: "/var/lib/nodehost".to_string(),
                },
            })
            .collect(),
        modify_key_digest: None,
        published_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    }
}

pub fn machine() -> DeploymentStateMachine {
    DeploymentStateMachine::new(
        Box::new(MemoryTable::<DeploymentJob>::incremental()),
        Box::new(MemoryTable::<ServiceInstanceHost>::new()),
    )
}

/// Job as the coordinator would hand it to a host
pub fn submitted_job(hosts: &[&str], trust: bool) -> DeploymentJob {
    let mut machine = machine();
    let (resp, _) = machine
        .submit_job(request("prod", "api", hosts, trust))
        .unwrap();
    resp.job
}

pub fn paths(root: &Path) -> PathSettings {
    PathSettings {
        opt_dir: root.join("opt"),
        etc_dir: root.join("etc"),
        tmp_dir: root.join("tmp"),
        unit_dir: root.join("units"),
    }
}

pub fn linux_host(name: &str) -> HostSettings {
    HostSettings {
        name: name.to_string(),
        os: "linux".to_string(),
        arch: "amd64".to_string(),
    }
}

/// gzipped tarball with every file under `top/`
pub fn build_archive(top: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o755);
    dir.set_size(0);
    builder
        .append_data(&mut dir, format!("{}/", top), std::io::empty())
        .unwrap();

    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, format!("{}/{}", top, name), *data)
            .unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap()
}

/// Release tarball the way `git archive` writes it: a PAX global header
/// carrying the commit id, then the tree under `top/`
pub fn git_archive(top: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let pax: &[u8] = b"22 comment=0123456789\n";
    let mut global = tar::Header::new_ustar();
    global.set_entry_type(tar::EntryType::XGlobalHeader);
    global.set_size(pax.len() as u64);
    global.set_mode(0o666);
    builder
        .append_data(&mut global, "pax_global_header", pax)
        .unwrap();

    let mut dir = tar::Header::new_ustar();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_mode(0o775);
    dir.set_size(0);
    builder
        .append_data(&mut dir, format!("{}/", top), std::io::empty())
        .unwrap();

    for (name, data) in files {
        let mut header = tar::Header::new_ustar();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(0o775);
        builder
            .append_data(&mut header, format!("{}/{}", top, name), *data)
            .unwrap();
    }

    builder.into_inner().unwrap().finish().unwrap()
}

/// Tarball holding one entry whose name is written verbatim, bypassing the
/// path checks of `tar::Builder`
pub fn raw_archive(name: &str, entry_type: tar::EntryType, link: Option<&str>) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let data: &[u8] = if entry_type == tar::EntryType::Regular {
        b"payload"
    } else {
        b""
    };
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(entry_type);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    {
        let raw = &mut header.as_old_mut().name;
        raw[..name.len()].copy_from_slice(name.as_bytes());
    }
    if let Some(link) = link {
        header.set_link_name(link).unwrap();
    }
    header.set_cksum();
    builder.append(&header, data).unwrap();

    builder.into_inner().unwrap().finish().unwrap()
}

/// Supervisor that records calls instead of running systemctl
pub struct FakeSupervisor {
    pub calls: Mutex<Vec<String>>,
    pub active_state: Mutex<String>,
    pub load_state: Mutex<String>,

    /// Number of upcoming `start` calls that fail
    pub failing_starts: AtomicUsize,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            active_state: Mutex::new(ACTIVE.to_string()),
            load_state: Mutex::new(LOADED.to_string()),
            failing_starts: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_active_state(&self, state: &str) {
        *self.active_state.lock().unwrap() = state.to_string();
    }

    pub fn set_load_state(&self, state: &str) {
        *self.load_state.lock().unwrap() = state.to_string();
    }

    pub fn fail_next_starts(&self, count: usize) {
        self.failing_starts.store(count, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn stop(&self, unit: &str, cancel: &CancellationToken) -> Result<(), DeploydError> {
        if cancel.is_cancelled() {
            return Err(DeploydError::Cancelled("stop".to_string()));
        }
        self.record(format!("stop {}", unit));
        Ok(())
    }

    async fn start(&self, unit: &str, _cancel: &CancellationToken) -> Result<(), DeploydError> {
        self.record(format!("start {}", unit));
        let failing = self.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_starts.store(failing - 1, Ordering::SeqCst);
            return Err(DeploydError::SupervisorError(format!(
                "{} failed to start",
                unit
            )));
        }
        Ok(())
    }

    async fn reload(&self, _cancel: &CancellationToken) -> Result<(), DeploydError> {
        self.record("daemon-reload".to_string());
        Ok(())
    }

    async fn active_state(
        &self,
        _unit: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, DeploydError> {
        Ok(self.active_state.lock().unwrap().clone())
    }

    async fn load_state(
        &self,
        _unit: &str,
        _cancel: &CancellationToken,
    ) -> Result<String, DeploydError> {
        Ok(self.load_state.lock().unwrap().clone())
    }
}

/// Collects progress records
#[derive(Default)]
pub struct RecordingSink {
    pub records: Mutex<Vec<ProgressRecord>>,
}

impl RecordingSink {
    pub fn steps(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.step.clone())
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn record(&self, record: &ProgressRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

pub fn progress(ctx: &JobContext, task: &'static str) -> (Progress, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let progress = Progress::new(sink.clone(), ctx.key(), &ctx.host, task);
    (progress, sink)
}

/// Task runner that counts invocations and succeeds unless told otherwise
#[derive(Default)]
pub struct CountingRunner {
    pub installs: AtomicUsize,
    pub restarts: Mutex<Vec<(String, usize)>>,

    /// Restarts on this host fail
    pub failing_host: Mutex<Option<String>>,

    /// Installs wait until cancelled
    pub hang_installs: AtomicBool,

    /// Installs fail
    pub fail_installs: AtomicBool,

    /// Restarts wait until cancelled
    pub hang_restarts: AtomicBool,
}

impl CountingRunner {
    pub fn installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> Vec<(String, usize)> {
        self.restarts.lock().unwrap().clone()
    }
}

#[async_trait]
impl HostTaskRunner for CountingRunner {
    async fn run(&self, task: HostTask, ctx: JobContext) -> Result<(), DeploydError> {
        match task {
            HostTask::Install => {
                self.installs.fetch_add(1, Ordering::SeqCst);
                if self.hang_installs.load(Ordering::SeqCst) {
                    ctx.cancel.cancelled().await;
                    return Err(ctx.interruption());
                }
                if self.fail_installs.load(Ordering::SeqCst) {
                    return Err(DeploydError::InstallError("disk full".to_string()));
                }
                Ok(())
            }
            HostTask::Restart { step } => {
                self.restarts.lock().unwrap().push((ctx.host.clone(), step));
                if self.hang_restarts.load(Ordering::SeqCst) {
                    ctx.cancel.cancelled().await;
                    return Err(ctx.interruption());
                }
                let failing = self.failing_host.lock().unwrap().clone();
                if failing.as_deref() == Some(ctx.host.as_str()) {
                    return Err(DeploydError::RolloutError(format!(
                        "{} did not come up",
                        ctx.host
                    )));
                }
                Ok(())
            }
        }
    }
}
