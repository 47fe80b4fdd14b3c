//! Server state

use std::sync::Arc;

use crate::app::options::ServerOptions;
use crate::coordinator::JobCoordinator;

/// Server state shared across handlers
pub struct ServerState {
    pub coordinator: Arc<dyn JobCoordinator>,
    pub options: ServerOptions,
}

impl ServerState {
    pub fn new(coordinator: Arc<dyn JobCoordinator>, options: ServerOptions) -> Self {
        Self {
            coordinator,
            options,
        }
    }
}
