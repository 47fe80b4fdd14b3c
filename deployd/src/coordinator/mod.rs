pub mod app;
pub mod commands;
pub mod fsm;
pub mod log;

pub use app::{Applied, DeploymentStateMachine};
pub use commands::Entry;
pub use log::{JobCoordinator, LocalCoordinator, LocalLog};
