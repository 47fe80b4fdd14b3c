//! deployd library
//!
//! Replicated deployment-job coordinator and the per-host agent that
//! installs and rolls out builds for it.

pub mod app;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod host;
pub mod http;
pub mod logs;
pub mod server;
pub mod storage;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod workers;
