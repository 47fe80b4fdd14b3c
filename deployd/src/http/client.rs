//! HTTP client for the artifact and env store

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::errors::DeploydError;
use crate::store::{ArtifactStore, AttachmentMeta, ChunkStream, EnvStore};

/// Header carrying the hex SHA-256 of an attachment body
pub const CONTENT_SHA256_HEADER: &str = "X-Content-Sha256";

/// HTTP client for the artifact service
pub struct ArtifactClient {
    client: Client,
    base_url: Url,
    token: Option<SecretString>,
}

impl ArtifactClient {
    /// Create a new client.
    ///
    /// `request_timeout` bounds connecting and waiting for response headers;
    /// bodies are streamed without an overall deadline and are cancelled by
    /// the caller instead.
    pub fn new(
        base_url: &str,
        request_timeout: Duration,
        token: Option<SecretString>,
    ) -> Result<Self, DeploydError> {
        let client = Client::builder()
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()?;

        let base_url = Url::parse(base_url)
            .map_err(|e| DeploydError::ConfigError(format!("artifact store url: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(DeploydError::ConfigError(format!(
                "artifact store url cannot be a base: {}",
                base_url
            )));
        }

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Base URL with `segments` appended, each one percent-encoded
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Result<Url, DeploydError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DeploydError::ConfigError("artifact store url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_get(&self, url: Url) -> Result<Response, DeploydError> {
        debug!("GET {}", url);

        let mut request = self.client.get(url.clone());
        if let Some(token) = &self.token {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }

        let response = request.send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DeploydError::NotFound(url.to_string()));
        }
        if response.status() == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(DeploydError::NotReady(url.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP GET failed: {} - {}", status, body);
            return Err(DeploydError::StoreError(format!("{}: {}", status, body)));
        }

        Ok(response)
    }
}

#[derive(Debug, Deserialize)]
struct EnvResponse {
    #[serde(default)]
    value: BTreeMap<String, String>,
}

#[async_trait]
impl EnvStore for ArtifactClient {
    async fn get_env(
        &self,
        namespace: &str,
        service: &str,
        version: u64,
    ) -> Result<BTreeMap<String, String>, DeploydError> {
        let version = version.to_string();
        let url = self.url(["env", namespace, service, version.as_str()])?;
        let response = self.send_get(url).await?;
        let body: EnvResponse = response.json().await?;
        Ok(body.value)
    }
}

#[async_trait]
impl ArtifactStore for ArtifactClient {
    async fn get_attachment(
        &self,
        namespace: &str,
        ref_path: &[String],
        key: &str,
    ) -> Result<(Box<dyn ChunkStream>, AttachmentMeta), DeploydError> {
        let mut url = self.url(
            ["attachment", namespace]
                .into_iter()
                .chain(ref_path.iter().map(String::as_str)),
        )?;
        url.query_pairs_mut().append_pair("key", key);

        let response = self.send_get(url).await?;

        let content_size = response.content_length().ok_or_else(|| {
            DeploydError::StoreError("attachment response has no content length".to_string())
        })?;
        let sha256 = response
            .headers()
            .get(CONTENT_SHA256_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_lowercase());

        let meta = AttachmentMeta {
            content_size,
            sha256,
        };
        Ok((Box::new(ResponseChunks { response }), meta))
    }
}

struct ResponseChunks {
    response: Response,
}

#[async_trait]
impl ChunkStream for ResponseChunks {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, DeploydError> {
        let chunk = self.response.chunk().await?;
        Ok(chunk.map(|bytes| bytes.to_vec()))
    }
}
