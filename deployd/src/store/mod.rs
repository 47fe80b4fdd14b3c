//! Collaborator interfaces for persisted entities, environments and build
//! artifacts.
//!
//! [`Table`] is synchronous because it is only ever driven from inside the
//! replicated state machine, which applies one command at a time. The env
//! and artifact stores are remote and async.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use deployd_api::{DeploymentJob, ServiceInstanceHost};

use crate::errors::DeploydError;

/// A record addressable by `(namespace, ref_ids, id)`
pub trait Entity: Clone + Send + Sync + 'static {
    fn namespace(&self) -> &str;

    /// Reference path the record lives under, e.g. `[service]`
    fn ref_ids(&self) -> Vec<String>;

    fn id(&self) -> &str;

    fn set_id(&mut self, id: String);
}

impl Entity for DeploymentJob {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ref_ids(&self) -> Vec<String> {
        vec![self.request.service.id.clone()]
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }
}

impl Entity for ServiceInstanceHost {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn ref_ids(&self) -> Vec<String> {
        vec![self.service.clone()]
    }

    /// Instances are keyed by host
    fn id(&self) -> &str {
        &self.host
    }

    fn set_id(&mut self, id: String) {
        self.host = id;
    }
}

/// Namespaced CRUD over one entity type.
///
/// Reads return newest first. Either call may fail with
/// [`DeploydError::NotReady`] while the backing replica catches up.
pub trait Table<T: Entity>: Send {
    /// Records under `ref_ids`, optionally narrowed to a single `id`
    fn get(&self, namespace: &str, ref_ids: &[String], id: Option<&str>)
        -> Result<Vec<T>, DeploydError>;

    /// Insert or replace by id. An empty id is assigned by the table when it
    /// hands out incremental ids.
    fn post(&mut self, entity: T) -> Result<T, DeploydError>;
}

/// Environment key/value sets by version
#[async_trait]
pub trait EnvStore: Send + Sync {
    async fn get_env(
        &self,
        namespace: &str,
        service: &str,
        version: u64,
    ) -> Result<BTreeMap<String, String>, DeploydError>;
}

/// Metadata of a stored attachment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentMeta {
    pub content_size: u64,

    /// Lowercase hex SHA-256, when the store recorded one
    pub sha256: Option<String>,
}

/// A body delivered in chunks so callers can stop between any two of them
#[async_trait]
pub trait ChunkStream: Send {
    /// Next chunk, or `None` at end of stream
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeploydError>;
}

/// Build archives and other blobs
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Open attachment `key` of the record at `ref_path`
    async fn get_attachment(
        &self,
        namespace: &str,
        ref_path: &[String],
        key: &str,
    ) -> Result<(Box<dyn ChunkStream>, AttachmentMeta), DeploydError>;
}
