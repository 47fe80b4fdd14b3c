//! Installs a build and its environment next to the running service

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::errors::DeploydError;
use crate::events::Progress;
use crate::filesys::dir::Dir;
use crate::host::archive::extract_release;
use crate::host::task::JobContext;
use crate::host::unit::{render_env, render_unit};
use crate::storage::layout::ServiceLayout;
use crate::storage::settings::{HostSettings, PathSettings};
use crate::store::{ArtifactStore, EnvStore};
use crate::supervisor::{ProcessSupervisor, LOADED};
use crate::utils::{hex, retry_not_ready, CooldownOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallOutcome {
    /// Downloaded and extracted the build
    Installed,

    /// The build was already on disk
    AlreadyInstalled,
}

pub struct Installer {
    paths: PathSettings,
    host: HostSettings,
    env_store: Arc<dyn EnvStore>,
    artifacts: Arc<dyn ArtifactStore>,
    supervisor: Arc<dyn ProcessSupervisor>,
    not_ready: CooldownOptions,
}

impl Installer {
    pub fn new(
        paths: PathSettings,
        host: HostSettings,
        env_store: Arc<dyn EnvStore>,
        artifacts: Arc<dyn ArtifactStore>,
        supervisor: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            paths,
            host,
            env_store,
            artifacts,
            supervisor,
            not_ready: CooldownOptions::default(),
        }
    }

    /// Backoff used while the env or artifact store answers not-ready
    pub fn with_not_ready(mut self, not_ready: CooldownOptions) -> Self {
        self.not_ready = not_ready;
        self
    }

    /// Prepare the job's build and env without touching the running service.
    ///
    /// Unit and env files are rewritten on every call. Download and extraction
    /// are skipped when the build directory is already populated.
    pub async fn install(
        &self,
        ctx: &JobContext,
        progress: &Progress,
    ) -> Result<InstallOutcome, DeploydError> {
        let request = &ctx.job.request;
        let service = ctx.job.service_id().to_string();
        let layout = ServiceLayout::new(&self.paths, &ctx.job.namespace, &service);
        let build = request.build_version;
        let env = request.env_version;

        info!(
            "Installing {} build {} env {} for job {}",
            layout.service_name,
            build,
            env,
            ctx.key()
        );

        ctx.check()?;
        progress.info("prepare", "creating directories");
        let mut dirs = vec![
            layout.base_dir(),
            layout.etc_dir(),
            layout.unit_dir(),
            layout.artifact_dir(build),
        ];
        if env > 0 {
            dirs.push(layout.env_release_dir(env));
        }
        for dir in &dirs {
            dir.create().await.map_err(|e| {
                DeploydError::InstallError(format!(
                    "failed to create {}: {}",
                    dir.path().display(),
                    e
                ))
            })?;
        }

        ctx.check()?;
        progress.info("unit", format!("writing {}", layout.unit_name()));
        let unit = render_unit(&layout, &ctx.job.namespace, &request.service);
        layout
            .unit_file()
            .write_atomic(unit.as_bytes())
            .await
            .map_err(|e| DeploydError::InstallError(format!("failed to write unit: {}", e)))?;

        if env > 0 {
            ctx.check()?;
            progress.info("env", format!("fetching env version {}", env));
            let values = tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ctx.interruption()),
                values = retry_not_ready(&self.not_ready, "env store", || {
                    self.env_store.get_env(&ctx.job.namespace, &service, env)
                }) => values?,
            };
            layout
                .env_file(env)
                .write_atomic(render_env(&values).as_bytes())
                .await
                .map_err(|e| {
                    DeploydError::InstallError(format!("failed to write env file: {}", e))
                })?;
        } else {
            debug!("No env version for job {}, skipping env file", ctx.key());
        }

        let release = layout.build_release_dir(build);
        let outcome = if release.is_populated().await? {
            progress.info(
                "download",
                format!("build {} already installed, skipping download", build),
            );
            InstallOutcome::AlreadyInstalled
        } else {
            self.fetch_build(ctx, progress, &layout, &release).await?;
            InstallOutcome::Installed
        };

        ctx.check()?;
        progress.info("reload", "reloading unit definitions");
        self.supervisor
            .reload(&ctx.cancel)
            .await
            .map_err(|e| ctx.explain(e))?;
        let state = self
            .supervisor
            .load_state(&layout.unit_name(), &ctx.cancel)
            .await
            .map_err(|e| ctx.explain(e))?;
        if state != LOADED {
            return Err(DeploydError::InstallError(format!(
                "unit {} is {} after reload",
                layout.unit_name(),
                state
            )));
        }

        info!("Installed {} for job {}", layout.service_name, ctx.key());
        Ok(outcome)
    }

    async fn fetch_build(
        &self,
        ctx: &JobContext,
        progress: &Progress,
        layout: &ServiceLayout,
        release: &Dir,
    ) -> Result<(), DeploydError> {
        let build = ctx.job.request.build_version;
        let archive = layout.archive_file(build, &ctx.job.id);

        ctx.check()?;
        progress.info("download", format!("downloading build {}", build));
        let ref_path = vec![ctx.job.service_id().to_string(), build.to_string()];
        let attachment_key = self.host.attachment_key();
        let (mut stream, meta) = tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(ctx.interruption()),
            opened = retry_not_ready(&self.not_ready, "artifact store", || {
                self.artifacts.get_attachment(&ctx.job.namespace, &ref_path, &attachment_key)
            }) => opened?,
        };

        let mut file = tokio::fs::File::create(archive.path()).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                chunk = stream.next_chunk() => Some(chunk?),
            };
            let chunk = match chunk {
                None => {
                    drop(file);
                    let _ = archive.delete().await;
                    return Err(ctx.interruption());
                }
                Some(None) => break,
                Some(Some(chunk)) => chunk,
            };
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if written != meta.content_size {
            let _ = archive.delete().await;
            return Err(DeploydError::InstallError(format!(
                "downloaded {} bytes, expected {}",
                written, meta.content_size
            )));
        }
        if let Some(expected) = &meta.sha256 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = archive.delete().await;
                return Err(DeploydError::InstallError(format!(
                    "checksum mismatch: got {}, expected {}",
                    actual, expected
                )));
            }
        }
        debug!("Downloaded {} bytes to {}", written, archive.path().display());

        ctx.check()?;
        progress.info("extract", format!("extracting build {}", build));
        let staging = layout.build_staging_dir(build, &ctx.job.id);
        staging.delete().await?;
        let extracted = extract_release(archive.path(), staging.path(), &ctx.cancel).await;
        match extracted {
            Ok(count) => debug!("Extracted {} file(s) for build {}", count, build),
            Err(e) => {
                let _ = staging.delete().await;
                return Err(match e {
                    DeploydError::ArchiveError(_) => e,
                    other if other.is_cancellation() => ctx.interruption(),
                    other => DeploydError::InstallError(format!("extraction failed: {}", other)),
                });
            }
        }
        // a concurrent job may have put the same build in place meanwhile
        if release.is_populated().await? {
            debug!("Build {} was installed by another job, dropping staging", build);
            staging.delete().await?;
        } else if let Err(e) = staging.replace(release).await {
            if !release.is_populated().await? {
                let _ = staging.delete().await;
                return Err(e);
            }
            debug!("Build {} was installed by another job, dropping staging", build);
            staging.delete().await?;
        }

        if let Err(e) = archive.delete().await {
            warn!("Failed to remove {}: {}", archive.path().display(), e);
        }
        Ok(())
    }
}
