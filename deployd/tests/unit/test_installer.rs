//! Installer tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deployd::errors::DeploydError;
use deployd::host::{InstallOutcome, Installer, JobContext};
use deployd::storage::layout::ServiceLayout;
use deployd::store::memory::{MemoryArtifactStore, MemoryEnvStore};
use deployd::store::{ArtifactStore, AttachmentMeta, ChunkStream, EnvStore};
use deployd::utils::CooldownOptions;
use deployd_api::DeploymentJob;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;

use crate::common::{build_archive, linux_host, paths, progress, submitted_job, FakeSupervisor};

struct Fixture {
    root: tempfile::TempDir,
    job: DeploymentJob,
    env: Arc<MemoryEnvStore>,
    artifacts: Arc<MemoryArtifactStore>,
    supervisor: Arc<FakeSupervisor>,
}

impl Fixture {
    fn new(artifacts: MemoryArtifactStore) -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            job: submitted_job(&["host-a"], false),
            env: Arc::new(MemoryEnvStore::new()),
            artifacts: Arc::new(artifacts),
            supervisor: Arc::new(FakeSupervisor::new()),
        }
    }

    fn publish_build(&self, data: Vec<u8>) {
        let ref_path = vec!["api".to_string(), self.job.request.build_version.to_string()];
        self.artifacts.put("prod", &ref_path, "linux/amd64", data);
    }

    fn installer(&self) -> Installer {
        Installer::new(
            paths(self.root.path()),
            linux_host("host-a"),
            self.env.clone(),
            self.artifacts.clone(),
            self.supervisor.clone(),
        )
    }

    fn layout(&self) -> ServiceLayout {
        ServiceLayout::new(&paths(self.root.path()), "prod", "api")
    }

    fn ctx(&self) -> JobContext {
        JobContext::new("host-a", self.job.clone(), CancellationToken::new())
    }

    /// Download or staging paths left behind by any job
    fn leftovers(&self) -> Vec<String> {
        let layout = self.layout();
        let mut found = Vec::new();
        for dir in [
            layout.artifact_dir(7).path().to_path_buf(),
            layout.base_dir().path().join("build-release"),
        ] {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries {
                let name = entry.unwrap().file_name().to_string_lossy().to_string();
                if name.ends_with(".tar.gz") || name.ends_with(".tmp") {
                    found.push(name);
                }
            }
        }
        found
    }
}

/// Store that answers not-ready a few times before delegating
struct Lagging<T> {
    inner: Arc<T>,
    remaining: AtomicUsize,
    calls: AtomicUsize,
}

impl<T> Lagging<T> {
    fn new(inner: Arc<T>, not_ready: usize) -> Self {
        Self {
            inner,
            remaining: AtomicUsize::new(not_ready),
            calls: AtomicUsize::new(0),
        }
    }

    fn lagging(&self) -> Result<(), DeploydError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.remaining.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining.store(left - 1, Ordering::SeqCst);
            return Err(DeploydError::NotReady("replica catching up".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EnvStore for Lagging<MemoryEnvStore> {
    async fn get_env(
        &self,
        namespace: &str,
        service: &str,
        version: u64,
    ) -> Result<BTreeMap<String, String>, DeploydError> {
        self.lagging()?;
        self.inner.get_env(namespace, service, version).await
    }
}

#[async_trait]
impl ArtifactStore for Lagging<MemoryArtifactStore> {
    async fn get_attachment(
        &self,
        namespace: &str,
        ref_path: &[String],
        key: &str,
    ) -> Result<(Box<dyn ChunkStream>, AttachmentMeta), DeploydError> {
        self.lagging()?;
        self.inner.get_attachment(namespace, ref_path, key).await
    }
}

fn quick_retry() -> CooldownOptions {
    CooldownOptions {
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
        max_attempts: Some(5),
    }
}

fn release_archive() -> Vec<u8> {
    build_archive("api", &[("bin/app", b"#!/bin/sh\nexec sleep 1000\n")])
}

#[tokio::test]
async fn test_install_lays_out_build_unit_and_env() {
    let mut fx = Fixture::new(MemoryArtifactStore::new());
    fx.job.request.env_version = 3;
    fx.env.put(
        "prod",
        "api",
        3,
        BTreeMap::from([("port".to_string(), "8080".to_string())]),
    );
    fx.publish_build(release_archive());

    let ctx = fx.ctx();
    let (progress, sink) = progress(&ctx, "install");
    let outcome = fx.installer().install(&ctx, &progress).await.unwrap();
    assert_eq!(outcome, InstallOutcome::Installed);

    let layout = fx.layout();
    let release = layout.build_release_dir(7);
    assert!(release.path().join("bin/app").is_file());
    assert!(fx.leftovers().is_empty());

    let env = std::fs::read_to_string(layout.env_file(3).path()).unwrap();
    assert_eq!(env, "PORT=\"8080\"\n");

    let unit = std::fs::read_to_string(layout.unit_file().path()).unwrap();
    assert!(unit.contains("Description=api service"));
    assert!(unit.contains(&layout.exec_path("bin/app").display().to_string()));

    // the running service is left alone
    assert_eq!(fx.supervisor.calls(), vec!["daemon-reload"]);
    assert!(layout.current_link().target().await.unwrap().is_none());

    let steps = sink.steps();
    assert!(steps.contains(&"download".to_string()));
    assert!(steps.contains(&"extract".to_string()));
}

#[tokio::test]
async fn test_install_skips_download_when_build_present() {
    let fx = Fixture::new(MemoryArtifactStore::new());
    let release = fx.layout().build_release_dir(7);
    std::fs::create_dir_all(release.path().join("bin")).unwrap();
    std::fs::write(release.path().join("bin/app"), b"old").unwrap();

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    let outcome = fx.installer().install(&ctx, &progress).await.unwrap();

    assert_eq!(outcome, InstallOutcome::AlreadyInstalled);
    assert_eq!(fx.artifacts.opened(), 0);
    assert_eq!(
        std::fs::read(release.path().join("bin/app")).unwrap(),
        b"old"
    );
    assert!(fx.layout().unit_file().exists().await);
}

#[tokio::test]
async fn test_install_is_repeatable() {
    let fx = Fixture::new(MemoryArtifactStore::new());
    fx.publish_build(release_archive());
    let installer = fx.installer();

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    assert_eq!(
        installer.install(&ctx, &progress).await.unwrap(),
        InstallOutcome::Installed
    );
    assert_eq!(
        installer.install(&ctx, &progress).await.unwrap(),
        InstallOutcome::AlreadyInstalled
    );
    assert_eq!(fx.artifacts.opened(), 1);
}

#[tokio::test]
async fn test_install_rejects_checksum_mismatch() {
    let fx = Fixture::new(MemoryArtifactStore::new());
    let data = release_archive();
    let ref_path = vec!["api".to_string(), "7".to_string()];
    fx.artifacts.put_with_meta(
        "prod",
        &ref_path,
        "linux/amd64",
        data.clone(),
        AttachmentMeta {
            content_size: data.len() as u64,
            sha256: Some("00".repeat(32)),
        },
    );

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    let err = fx.installer().install(&ctx, &progress).await.unwrap_err();

    match err {
        DeploydError::InstallError(msg) => assert!(msg.contains("checksum")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!fx.layout().build_release_dir(7).exists().await);
    assert!(fx.leftovers().is_empty());
}

#[tokio::test]
async fn test_install_missing_artifact() {
    let fx = Fixture::new(MemoryArtifactStore::new());

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    let err = fx.installer().install(&ctx, &progress).await.unwrap_err();
    assert!(matches!(err, DeploydError::NotFound(_)));
}

#[tokio::test]
async fn test_install_missing_env_version() {
    let mut fx = Fixture::new(MemoryArtifactStore::new());
    fx.job.request.env_version = 4;
    fx.publish_build(release_archive());

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    let err = fx.installer().install(&ctx, &progress).await.unwrap_err();
    assert!(matches!(err, DeploydError::NotFound(_)));
    assert_eq!(fx.artifacts.opened(), 0);
}

#[tokio::test]
async fn test_install_fails_when_unit_not_loaded() {
    let fx = Fixture::new(MemoryArtifactStore::new());
    fx.publish_build(release_archive());
    fx.supervisor.set_load_state("not-found");

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    let err = fx.installer().install(&ctx, &progress).await.unwrap_err();
    assert!(matches!(err, DeploydError::InstallError(_)));
}

#[tokio::test]
async fn test_install_cancelled_mid_download() {
    let fx = Fixture::new(MemoryArtifactStore::new().with_throttle(16, Duration::from_millis(20)));
    fx.publish_build(release_archive());

    let ctx = fx.ctx();
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let (progress, _) = progress(&ctx, "install");
    let err = fx.installer().install(&ctx, &progress).await.unwrap_err();

    assert!(matches!(err, DeploydError::Cancelled(_)));
    assert!(fx.leftovers().is_empty());
    assert!(!fx.layout().build_release_dir(7).exists().await);
    assert!(!fx.supervisor.calls().contains(&"daemon-reload".to_string()));
}

#[tokio::test]
async fn test_install_past_deadline_reports_timeout() {
    let fx = Fixture::new(MemoryArtifactStore::new());
    fx.publish_build(release_archive());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let ctx = JobContext::new("host-a", fx.job.clone(), cancel)
        .with_deadline(Some(tokio::time::Instant::now()));

    let (progress, _) = progress(&ctx, "install");
    let err = fx.installer().install(&ctx, &progress).await.unwrap_err();
    assert!(matches!(err, DeploydError::TimedOut(_)));
}

#[tokio::test]
async fn test_concurrent_jobs_for_same_build() {
    let fx = Fixture::new(MemoryArtifactStore::new().with_throttle(32, Duration::from_millis(2)));
    fx.publish_build(release_archive());
    let installer = fx.installer();

    let first = fx.ctx();
    let mut other_job = fx.job.clone();
    other_job.id = "2".to_string();
    let second = JobContext::new("host-a", other_job, CancellationToken::new());

    let (progress_a, _) = progress(&first, "install");
    let (progress_b, _) = progress(&second, "install");
    let (a, b) = tokio::join!(
        installer.install(&first, &progress_a),
        installer.install(&second, &progress_b),
    );

    assert_ok!(a);
    assert_ok!(b);
    let release = fx.layout().build_release_dir(7);
    assert!(release.path().join("bin/app").is_file());
    assert!(fx.leftovers().is_empty());
}

#[tokio::test]
async fn test_install_retries_not_ready_stores() {
    let mut fx = Fixture::new(MemoryArtifactStore::new());
    fx.job.request.env_version = 2;
    fx.env.put(
        "prod",
        "api",
        2,
        BTreeMap::from([("port".to_string(), "80".to_string())]),
    );
    fx.publish_build(release_archive());

    let env = Arc::new(Lagging::new(fx.env.clone(), 1));
    let artifacts = Arc::new(Lagging::new(fx.artifacts.clone(), 1));
    let installer = Installer::new(
        paths(fx.root.path()),
        linux_host("host-a"),
        env.clone(),
        artifacts.clone(),
        fx.supervisor.clone(),
    )
    .with_not_ready(quick_retry());

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    assert_ok!(installer.install(&ctx, &progress).await);

    assert_eq!(env.calls.load(Ordering::SeqCst), 2);
    assert_eq!(artifacts.calls.load(Ordering::SeqCst), 2);
    assert!(fx.layout().build_release_dir(7).path().join("bin/app").is_file());
}

#[tokio::test]
async fn test_install_gives_up_on_persistent_not_ready() {
    let fx = Fixture::new(MemoryArtifactStore::new());
    fx.publish_build(release_archive());

    let artifacts = Arc::new(Lagging::new(fx.artifacts.clone(), usize::MAX));
    let installer = Installer::new(
        paths(fx.root.path()),
        linux_host("host-a"),
        fx.env.clone(),
        artifacts.clone(),
        fx.supervisor.clone(),
    )
    .with_not_ready(quick_retry());

    let ctx = fx.ctx();
    let (progress, _) = progress(&ctx, "install");
    let err = assert_err!(installer.install(&ctx, &progress).await);

    assert!(matches!(err, DeploydError::NotReady(_)));
    assert_eq!(artifacts.calls.load(Ordering::SeqCst), 5);
}
