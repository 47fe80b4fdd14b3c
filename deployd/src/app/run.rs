//! Main application run loop

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use secrecy::SecretString;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::DeploydError;
use crate::events::{BusSink, FanoutSink, TracingSink};
use crate::host::{HostJobController, Installer, LocalTaskRunner, RolloutExecutor};
use crate::http::ArtifactClient;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::supervisor::SystemctlSupervisor;
use crate::workers::host_jobs;

/// Run deployd
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeploydError> {
    info!("Initializing deployd on {}...", options.host.name);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start deployd: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, DeploydError> {
    let app_state = init_app_state(options, shutdown_manager).await?;

    init_host_jobs_worker(
        options,
        app_state.clone(),
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    if options.enable_server {
        init_server(
            options,
            app_state.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(app_state)
}

async fn init_app_state(
    options: &AppOptions,
    shutdown_manager: &mut ShutdownManager,
) -> Result<Arc<AppState>, DeploydError> {
    let (app_state, app_state_handle) = AppState::init(options.event_bus_capacity).await?;

    let app_state = Arc::new(app_state);
    shutdown_manager.with_app_state(
        app_state.clone(),
        Box::pin(async move {
            if let Err(e) = app_state_handle.await {
                error!("Job log task failed: {}", e);
            }
        }),
    )?;

    Ok(app_state)
}

async fn init_host_jobs_worker(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploydError> {
    info!("Initializing host job worker...");

    let store = Arc::new(ArtifactClient::new(
        &options.artifact_store.base_url,
        options.artifact_store.request_timeout,
        options
            .artifact_store
            .token
            .clone()
            .map(SecretString::from),
    )?);
    let supervisor = Arc::new(SystemctlSupervisor::new(options.supervisor_timeout));
    let sink = Arc::new(
        FanoutSink::new()
            .with(Arc::new(TracingSink))
            .with(Arc::new(BusSink::new(app_state.bus.clone()))),
    );

    let installer = Installer::new(
        options.paths.clone(),
        options.host.clone(),
        store.clone(),
        store,
        supervisor.clone(),
    )
    .with_not_ready(options.artifact_store.not_ready.clone());
    let executor = RolloutExecutor::new(
        options.paths.clone(),
        supervisor,
        options.health_check.clone(),
    );
    let runner = Arc::new(LocalTaskRunner::new(installer, executor, sink));

    let controller = HostJobController::new(
        options.host_jobs.controller.clone(),
        app_state.coordinator.clone(),
        runner,
    );

    // subscribe before anything can be proposed
    let events = app_state.bus.subscribe();

    let host_jobs_handle = tokio::spawn(async move {
        host_jobs::run(
            controller,
            events,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_host_jobs_worker_handle(host_jobs_handle)?;
    Ok(())
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeploydError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(app_state.coordinator.clone(), options.server.clone());

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct AppStateShutdownParams {
    state: Arc<AppState>,
    state_handle: Pin<Box<dyn Future<Output = ()> + Send>>,
}

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<AppStateShutdownParams>,
    server_handle: Option<JoinHandle<Result<(), DeploydError>>>,
    host_jobs_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            host_jobs_worker_handle: None,
        }
    }

    pub fn with_app_state(
        &mut self,
        state: Arc<AppState>,
        state_handle: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) -> Result<(), DeploydError> {
        if self.app_state.is_some() {
            return Err(DeploydError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(AppStateShutdownParams { state, state_handle });
        Ok(())
    }

    pub fn with_host_jobs_worker_handle(
        &mut self,
        handle: JoinHandle<()>,
    ) -> Result<(), DeploydError> {
        if self.host_jobs_worker_handle.is_some() {
            return Err(DeploydError::ShutdownError(
                "host_jobs_handle already set".to_string(),
            ));
        }
        self.host_jobs_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), DeploydError>>,
    ) -> Result<(), DeploydError> {
        if self.server_handle.is_some() {
            return Err(DeploydError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeploydError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeploydError> {
        info!("Shutting down deployd...");

        // 1. Server, no new submissions
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| DeploydError::ShutdownError(e.to_string()))??;
        }

        // 2. Host job worker, cancels in-flight host tasks
        if let Some(handle) = self.host_jobs_worker_handle.take() {
            handle
                .await
                .map_err(|e| DeploydError::ShutdownError(e.to_string()))?;
        }

        // 3. App state and the job log
        if let Some(app_state) = self.app_state.take() {
            app_state.state.shutdown().await?;
            app_state.state_handle.await;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
