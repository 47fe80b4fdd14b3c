//! Host job worker
//!
//! Feeds bus events to this host's [`HostJobController`] one at a time.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::events::{EventReceiver, RecvError};
use crate::host::controller::{ControllerOptions, HostJobController};

/// Host job worker options
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub controller: ControllerOptions,
}

impl Options {
    pub fn new(host: &str, min_timeout: Duration) -> Self {
        Self {
            controller: ControllerOptions {
                host: host.to_string(),
                min_timeout,
            },
        }
    }
}

/// Run the host job worker until shutdown or until the bus closes
pub async fn run(
    mut controller: HostJobController,
    mut events: EventReceiver,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Host job worker starting for {}...", controller.host());

    loop {
        let event = tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Host job worker shutting down...");
                break;
            }
            event = events.recv() => event,
        };

        match event {
            Ok(event) => controller.handle_event(event),
            Err(RecvError::Lagged(missed)) => {
                // missed events are not replayed; affected jobs need an
                // operator to cancel or confirm them again
                warn!(
                    "Host job worker missed {} event(s), {} job(s) in the pool",
                    missed,
                    controller.pool_size()
                );
            }
            Err(RecvError::Closed) => {
                error!("Event bus closed, host job worker stopping");
                break;
            }
            Err(RecvError::Empty) => {}
        }
    }

    controller.shutdown().await;
}
