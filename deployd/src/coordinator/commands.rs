//! Replicated log entries

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::errors::DeploydError;

pub const SUBMIT_JOB: &str = "deployd.user.submit-job";
pub const CANCEL_JOB: &str = "deployd.user.cancel-job";
pub const HOST_CONFIGURATION_UPDATE: &str = "deployd.host.configuration-update";
pub const RESTART_CONFIRMATION: &str = "deployd.restart-confirmation";
pub const HOST_RESTART_SERVICE_UPDATE: &str = "deployd.host.restart-service-update";

/// One proposal in the log: a command name and its JSON payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub command: String,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new<T: Serialize>(command: &str, payload: &T) -> Result<Self, DeploydError> {
        Ok(Self {
            command: command.to_string(),
            value: serde_json::to_vec(payload)?,
        })
    }

    /// Decode the payload; malformed payloads are validation errors
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, DeploydError> {
        serde_json::from_slice(&self.value).map_err(|e| {
            DeploydError::ValidationError(format!(
                "failed to parse {} payload as JSON: {}",
                self.command, e
            ))
        })
    }
}
