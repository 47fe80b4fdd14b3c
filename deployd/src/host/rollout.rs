//! Cuts a service over to an installed build

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::errors::DeploydError;
use crate::events::Progress;
use crate::filesys::file::File;
use crate::host::task::JobContext;
use crate::storage::layout::ServiceLayout;
use crate::storage::settings::{PathSettings, RolloutSettings};
use crate::supervisor::{ProcessSupervisor, ACTIVE};

/// How the executor judges a started service
#[derive(Debug, Clone)]
pub struct HealthCheckOptions {
    /// Consecutive checks that must all see the unit active
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for HealthCheckOptions {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval: Duration::from_secs(1),
        }
    }
}

impl From<&RolloutSettings> for HealthCheckOptions {
    fn from(settings: &RolloutSettings) -> Self {
        Self {
            attempts: settings.health_check_attempts.max(1),
            interval: Duration::from_millis(settings.health_check_interval_ms),
        }
    }
}

/// Link targets before the swap
#[derive(Debug, Default)]
struct Previous {
    build: Option<PathBuf>,
    env: Option<PathBuf>,
    env_swapped: bool,
}

pub struct RolloutExecutor {
    paths: PathSettings,
    supervisor: Arc<dyn ProcessSupervisor>,
    health: HealthCheckOptions,
}

impl RolloutExecutor {
    pub fn new(
        paths: PathSettings,
        supervisor: Arc<dyn ProcessSupervisor>,
        health: HealthCheckOptions,
    ) -> Self {
        Self {
            paths,
            supervisor,
            health,
        }
    }

    /// Stop the service, point its links at the job's build and env, start
    /// it again and wait for it to stay active. Any failure after the stop
    /// restores the previous links and restarts the previous build.
    pub async fn restart(&self, ctx: &JobContext, progress: &Progress) -> Result<(), DeploydError> {
        let request = &ctx.job.request;
        let layout = ServiceLayout::new(&self.paths, &ctx.job.namespace, ctx.job.service_id());
        let unit = layout.unit_name();
        let release = layout.build_release_dir(request.build_version);
        let env = request.env_version;

        ctx.check()?;
        progress.info("verify", format!("checking build {}", request.build_version));
        if !release.exists().await {
            return Err(DeploydError::RolloutError(format!(
                "build {} is not installed at {}",
                request.build_version,
                release.path().display()
            )));
        }
        let binary = File::new(release.path().join(&request.service.executable_path));
        if !binary.exists().await {
            return Err(DeploydError::RolloutError(format!(
                "executable {} not found",
                binary.path().display()
            )));
        }
        if !binary.is_executable().await? {
            progress.warn("verify", "executable bit missing, adding it");
            binary.add_execute_permission().await?;
        }
        if env > 0 && !layout.env_file(env).exists().await {
            return Err(DeploydError::RolloutError(format!(
                "env version {} is not installed",
                env
            )));
        }

        ctx.check()?;
        progress.info("stop", format!("stopping {}", unit));
        self.supervisor
            .stop(&unit, &ctx.cancel)
            .await
            .map_err(|e| ctx.explain(e))?;

        let current = layout.current_link();
        let env_link = layout.env_link();
        let mut previous = Previous {
            build: current.target().await?,
            env: if env > 0 { env_link.target().await? } else { None },
            env_swapped: false,
        };

        progress.info("switch", format!("linking build {}", request.build_version));
        current.switch_to(release.path()).await?;

        if env > 0 {
            if let Err(e) = env_link.switch_to(layout.env_release_dir(env).path()).await {
                let reason = format!("failed to switch env link: {}", e);
                return Err(self.rollback(ctx, &layout, &previous, progress, reason).await);
            }
            previous.env_swapped = true;
        }

        progress.info("start", format!("starting {}", unit));
        if let Err(e) = self.supervisor.start(&unit, &ctx.cancel).await {
            let reason = format!("failed to start {}: {}", unit, ctx.explain(e));
            return Err(self.rollback(ctx, &layout, &previous, progress, reason).await);
        }

        progress.info("health", format!("waiting for {} to stay {}", unit, ACTIVE));
        if let Err(reason) = self.wait_healthy(ctx, &unit).await {
            return Err(self.rollback(ctx, &layout, &previous, progress, reason).await);
        }

        info!("Rolled {} over to build {}", unit, request.build_version);
        Ok(())
    }

    async fn wait_healthy(&self, ctx: &JobContext, unit: &str) -> Result<(), String> {
        for attempt in 1..=self.health.attempts {
            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ctx.interruption().to_string()),
                _ = tokio::time::sleep(self.health.interval) => {}
            }
            let state = self
                .supervisor
                .active_state(unit, &ctx.cancel)
                .await
                .map_err(|e| ctx.explain(e).to_string())?;
            if state != ACTIVE {
                return Err(format!(
                    "{} is {} on health check {}/{}",
                    unit, state, attempt, self.health.attempts
                ));
            }
        }
        Ok(())
    }

    /// Restore the links and restart the previous build. Returns the error to
    /// report: the job's interruption if its token fired, otherwise a rollout
    /// error carrying any rollback failure along with the original reason.
    async fn rollback(
        &self,
        ctx: &JobContext,
        layout: &ServiceLayout,
        previous: &Previous,
        progress: &Progress,
        reason: String,
    ) -> DeploydError {
        progress.warn("rollback", format!("rolling back: {}", reason));
        let mut problems = Vec::new();

        if let Err(e) = layout.current_link().restore(previous.build.as_deref()).await {
            problems.push(format!("build link: {}", e));
        }
        if previous.env_swapped {
            if let Err(e) = layout.env_link().restore(previous.env.as_deref()).await {
                problems.push(format!("env link: {}", e));
            }
        }

        // the job token may already have fired, the supervisor's own timeout
        // still bounds this call
        if previous.build.is_some() {
            let unit = layout.unit_name();
            if let Err(e) = self.supervisor.start(&unit, &CancellationToken::new()).await {
                problems.push(format!("restart of previous build: {}", e));
            }
        }

        let err = if problems.is_empty() {
            warn!("Rolled back {} after: {}", layout.service_name, reason);
            DeploydError::RolloutError(format!("{}; rolled back", reason))
        } else {
            let problems = problems.join(", ");
            error!("Rollback of {} incomplete: {}", layout.service_name, problems);
            progress.error("rollback", format!("rollback incomplete: {}", problems));
            DeploydError::RolloutError(format!("{}; rollback incomplete: {}", reason, problems))
        };

        if ctx.cancel.is_cancelled() {
            ctx.interruption()
        } else {
            err
        }
    }
}
