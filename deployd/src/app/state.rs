//! Application state management

use std::sync::{Arc, Mutex};

use deployd_api::{DeploymentJob, ServiceInstanceHost};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use crate::coordinator::{DeploymentStateMachine, JobCoordinator, LocalLog};
use crate::errors::DeploydError;
use crate::events::EventBus;
use crate::store::memory::MemoryTable;

/// Main application state
pub struct AppState {
    /// Where applied commands surface as events
    pub bus: EventBus,

    /// Typed access to the job log
    pub coordinator: Arc<dyn JobCoordinator>,

    log_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

impl AppState {
    /// Start the job log and return the state plus the log's task handle
    pub async fn init(bus_capacity: usize) -> Result<(Self, JoinHandle<()>), DeploydError> {
        info!("Initializing application state...");

        let bus = EventBus::new(bus_capacity);
        let machine = DeploymentStateMachine::new(
            Box::new(MemoryTable::<DeploymentJob>::incremental()),
            Box::new(MemoryTable::<ServiceInstanceHost>::new()),
        );
        let (log, coordinator) = LocalLog::new(machine, bus.clone(), bus_capacity);

        // the log outlives the workers so their last reports still land
        let (log_shutdown_tx, log_shutdown_rx) = oneshot::channel();
        let log_handle = tokio::spawn(log.run(Box::pin(async move {
            let _ = log_shutdown_rx.await;
        })));

        Ok((
            Self {
                bus,
                coordinator: Arc::new(coordinator),
                log_shutdown: Mutex::new(Some(log_shutdown_tx)),
            },
            log_handle,
        ))
    }

    /// Stop the job log
    pub async fn shutdown(&self) -> Result<(), DeploydError> {
        info!("Shutting down application state...");
        let sender = self
            .log_shutdown
            .lock()
            .map_err(|e| DeploydError::ShutdownError(e.to_string()))?
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(());
        }
        Ok(())
    }
}
