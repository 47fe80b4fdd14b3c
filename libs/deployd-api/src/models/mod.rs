//! Deployd API models

pub mod command;
pub mod entity;
pub mod event;
