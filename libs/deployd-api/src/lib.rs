//! Deployd API models
//!
//! Types shared between the replicated job coordinator, the host agents and
//! API clients. Everything here is plain serde data.

pub mod models;

pub use models::command::*;
pub use models::entity::*;
pub use models::event::*;
