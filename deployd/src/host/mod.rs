pub mod archive;
pub mod controller;
pub mod installer;
pub mod rollout;
pub mod task;
pub mod unit;

pub use controller::{ControllerOptions, HostJobController};
pub use installer::{InstallOutcome, Installer};
pub use rollout::{HealthCheckOptions, RolloutExecutor};
pub use task::{HostTask, HostTaskRunner, JobContext, LocalTaskRunner};
