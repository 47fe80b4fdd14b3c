//! In-memory store implementations used by the single-node runtime and tests

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::DeploydError;
use crate::store::{ArtifactStore, AttachmentMeta, ChunkStream, EnvStore, Entity, Table};
use crate::utils::sha256_hex;

type Partition = (String, Vec<String>);

/// Table kept in process memory
pub struct MemoryTable<T> {
    incremental: bool,
    ready: Arc<AtomicBool>,
    rows: HashMap<Partition, Vec<T>>,
    counters: HashMap<Partition, u64>,
}

impl<T: Entity> MemoryTable<T> {
    /// Table whose records carry their own ids
    pub fn new() -> Self {
        Self {
            incremental: false,
            ready: Arc::new(AtomicBool::new(true)),
            rows: HashMap::new(),
            counters: HashMap::new(),
        }
    }

    /// Table that numbers new records `1, 2, 3...` per partition
    pub fn incremental() -> Self {
        Self {
            incremental: true,
            ..Self::new()
        }
    }

    /// Share a readiness flag; while it is false every call fails with `NotReady`
    pub fn with_readiness(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = ready;
        self
    }

    fn check_ready(&self) -> Result<(), DeploydError> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DeploydError::NotReady("table replica is catching up".to_string()))
        }
    }
}

impl<T: Entity> Default for MemoryTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Entity> Table<T> for MemoryTable<T> {
    fn get(
        &self,
        namespace: &str,
        ref_ids: &[String],
        id: Option<&str>,
    ) -> Result<Vec<T>, DeploydError> {
        self.check_ready()?;

        let partition = (namespace.to_string(), ref_ids.to_vec());
        let rows = match self.rows.get(&partition) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .rev()
            .filter(|row| id.is_none_or(|id| row.id() == id))
            .cloned()
            .collect())
    }

    fn post(&mut self, mut entity: T) -> Result<T, DeploydError> {
        self.check_ready()?;

        let partition = (entity.namespace().to_string(), entity.ref_ids());

        if entity.id().is_empty() {
            if !self.incremental {
                return Err(DeploydError::ValidationError(
                    "record has no id".to_string(),
                ));
            }
            let counter = self.counters.entry(partition.clone()).or_insert(0);
            *counter += 1;
            entity.set_id(counter.to_string());
        }

        let rows = self.rows.entry(partition).or_default();
        match rows.iter_mut().find(|row| row.id() == entity.id()) {
            Some(row) => *row = entity.clone(),
            None => rows.push(entity.clone()),
        }

        Ok(entity)
    }
}

/// Env sets kept in process memory
#[derive(Default)]
pub struct MemoryEnvStore {
    envs: Mutex<HashMap<(String, String, u64), BTreeMap<String, String>>>,
}

impl MemoryEnvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, namespace: &str, service: &str, version: u64, env: BTreeMap<String, String>) {
        if let Ok(mut envs) = self.envs.lock() {
            envs.insert((namespace.to_string(), service.to_string(), version), env);
        }
    }
}

#[async_trait]
impl EnvStore for MemoryEnvStore {
    async fn get_env(
        &self,
        namespace: &str,
        service: &str,
        version: u64,
    ) -> Result<BTreeMap<String, String>, DeploydError> {
        let envs = self
            .envs
            .lock()
            .map_err(|_| DeploydError::Internal("env store lock poisoned".to_string()))?;
        envs.get(&(namespace.to_string(), service.to_string(), version))
            .cloned()
            .ok_or_else(|| {
                DeploydError::NotFound(format!("env {}/{} version {}", namespace, service, version))
            })
    }
}

#[derive(Clone)]
struct StoredAttachment {
    data: Arc<Vec<u8>>,
    meta: AttachmentMeta,
}

/// Attachments kept in process memory
pub struct MemoryArtifactStore {
    attachments: Mutex<HashMap<(String, Vec<String>, String), StoredAttachment>>,
    chunk_size: usize,
    chunk_delay: Option<Duration>,
    opened: AtomicUsize,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            attachments: Mutex::new(HashMap::new()),
            chunk_size: 64 * 1024,
            chunk_delay: None,
            opened: AtomicUsize::new(0),
        }
    }

    /// Serve bodies in `chunk_size` pieces, sleeping `delay` before each
    pub fn with_throttle(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size.max(1);
        self.chunk_delay = Some(delay);
        self
    }

    /// Store `data` with its real size and digest
    pub fn put(&self, namespace: &str, ref_path: &[String], key: &str, data: Vec<u8>) {
        let meta = AttachmentMeta {
            content_size: data.len() as u64,
            sha256: Some(sha256_hex(&data)),
        };
        self.put_with_meta(namespace, ref_path, key, data, meta);
    }

    /// Store `data` advertising arbitrary metadata
    pub fn put_with_meta(
        &self,
        namespace: &str,
        ref_path: &[String],
        key: &str,
        data: Vec<u8>,
        meta: AttachmentMeta,
    ) {
        if let Ok(mut attachments) = self.attachments.lock() {
            attachments.insert(
                (namespace.to_string(), ref_path.to_vec(), key.to_string()),
                StoredAttachment {
                    data: Arc::new(data),
                    meta,
                },
            );
        }
    }

    /// How many times an attachment was opened
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Default for MemoryArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn get_attachment(
        &self,
        namespace: &str,
        ref_path: &[String],
        key: &str,
    ) -> Result<(Box<dyn ChunkStream>, AttachmentMeta), DeploydError> {
        let stored = {
            let attachments = self
                .attachments
                .lock()
                .map_err(|_| DeploydError::Internal("artifact store lock poisoned".to_string()))?;
            attachments
                .get(&(namespace.to_string(), ref_path.to_vec(), key.to_string()))
                .cloned()
                .ok_or_else(|| {
                    DeploydError::NotFound(format!(
                        "attachment {} of {}/{}",
                        key,
                        namespace,
                        ref_path.join("/")
                    ))
                })?
        };

        self.opened.fetch_add(1, Ordering::SeqCst);

        let stream = MemoryChunkStream {
            data: stored.data,
            offset: 0,
            chunk_size: self.chunk_size,
            delay: self.chunk_delay,
        };
        Ok((Box::new(stream), stored.meta))
    }
}

struct MemoryChunkStream {
    data: Arc<Vec<u8>>,
    offset: usize,
    chunk_size: usize,
    delay: Option<Duration>,
}

#[async_trait]
impl ChunkStream for MemoryChunkStream {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeploydError> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(chunk))
    }
}
