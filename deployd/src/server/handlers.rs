//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use deployd_api::{
    CancelJobRequest, DeploymentJob, HostRestartConfirmationResponse, RestartConfirmation,
    ServiceDefinition, SubmitDeploymentJobRequest, TargetHost,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::DeploydError;
use crate::server::state::ServerState;
use crate::utils::{retry_not_ready, sha256_hex, version_info, VersionInfo};

pub const NAMESPACE_HEADER: &str = "X-Namespace";
pub const MODIFY_KEY_HEADER: &str = "X-Modify-Key";

/// Error body returned by every handler
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl From<DeploydError> for ApiError {
    fn from(err: DeploydError) -> Self {
        let status = match &err {
            DeploydError::ValidationError(_) | DeploydError::JsonError(_) => {
                StatusCode::BAD_REQUEST
            }
            DeploydError::NotFound(_) => StatusCode::NOT_FOUND,
            DeploydError::InvalidState(_) => StatusCode::CONFLICT,
            DeploydError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "deployd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> Json<VersionInfo> {
    Json(version_info())
}

/// Submission as sent by clients
#[derive(Debug, Deserialize)]
pub struct SubmitJobBody {
    pub namespace: String,
    pub service: ServiceDefinition,
    pub build_version: u64,

    #[serde(default)]
    pub env_version: u64,

    #[serde(default)]
    pub secret_version: u64,

    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    #[serde(default, alias = "is_believe")]
    pub trust: bool,

    #[serde(default)]
    pub target_hosts: Vec<TargetHost>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitJobReply {
    pub job: DeploymentJob,

    /// Needed to cancel the job; shown only once
    pub modify_key: String,
}

/// Submit a deployment job
pub async fn submit_job_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<SubmitJobBody>,
) -> Result<Json<SubmitJobReply>, ApiError> {
    if body.namespace.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "namespace is required"));
    }
    if body.service.id.is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "service id is required"));
    }

    let jobs = retry_not_ready(&state.options.not_ready, "list jobs", || {
        state.coordinator.list_jobs(&body.namespace, &body.service.id)
    })
    .await?;
    if let Some(latest) = jobs.first() {
        // a publish time in the future counts as just now
        let since = Utc::now()
            .signed_duration_since(latest.published_at)
            .to_std()
            .unwrap_or_default();
        if since < state.options.submit_cooldown {
            return Err(ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                format!(
                    "job {} for {} was submitted {}s ago, please wait",
                    latest.id,
                    body.service.id,
                    since.as_secs()
                ),
            ));
        }
    }

    let modify_key = SecretString::from(Uuid::new_v4().simple().to_string());
    let request = SubmitDeploymentJobRequest {
        namespace: body.namespace,
        service: body.service,
        build_version: body.build_version,
        env_version: body.env_version,
        secret_version: body.secret_version,
        timeout_seconds: body.timeout_seconds,
        trust: body.trust,
        target_hosts: body.target_hosts,
        modify_key_digest: Some(sha256_hex(modify_key.expose_secret().as_bytes())),
        published_at: Utc::now(),
    };

    let response = state.coordinator.submit_job(request).await?;
    info!("Submitted job {}", response.job.key());

    Ok(Json(SubmitJobReply {
        job: response.job,
        modify_key: modify_key.expose_secret().to_string(),
    }))
}

/// Jobs of a service, newest first
pub async fn list_jobs_handler(
    State(state): State<Arc<ServerState>>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeploymentJob>>, ApiError> {
    let namespace = namespace(&headers)?;
    let jobs = retry_not_ready(&state.options.not_ready, "list jobs", || {
        state.coordinator.list_jobs(&namespace, &service)
    })
    .await?;
    Ok(Json(jobs))
}

/// One job
pub async fn get_job_handler(
    State(state): State<Arc<ServerState>>,
    Path((service, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<DeploymentJob>, ApiError> {
    let namespace = namespace(&headers)?;
    let job = retry_not_ready(&state.options.not_ready, "get job", || {
        state.coordinator.get_job(&namespace, &service, &id)
    })
    .await?;
    Ok(Json(job))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelParams {
    pub reason: Option<String>,
}

/// Cancel a job, given the modify key handed out on submission
pub async fn cancel_job_handler(
    State(state): State<Arc<ServerState>>,
    Path((service, id)): Path<(String, String)>,
    Query(params): Query<CancelParams>,
    headers: HeaderMap,
) -> Result<Json<DeploymentJob>, ApiError> {
    let namespace = namespace(&headers)?;
    let job = retry_not_ready(&state.options.not_ready, "get job", || {
        state.coordinator.get_job(&namespace, &service, &id)
    })
    .await?;

    if let Some(digest) = &job.request.modify_key_digest {
        let presented = headers
            .get(MODIFY_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| SecretString::from(v.to_string()));
        let matches = presented
            .map(|key| sha256_hex(key.expose_secret().as_bytes()) == *digest)
            .unwrap_or(false);
        if !matches {
            warn!("Rejected cancel of job {} with a wrong modify key", job.key());
            return Err(ApiError::new(
                StatusCode::FORBIDDEN,
                format!("missing or wrong {}", MODIFY_KEY_HEADER),
            ));
        }
    }

    let cancelled = state
        .coordinator
        .cancel_job(CancelJobRequest {
            namespace,
            service,
            job_id: id,
            reason: params.reason,
        })
        .await?;
    Ok(Json(cancelled))
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmBody {
    #[serde(default)]
    pub agent: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

/// Let the next host in line restart
pub async fn confirm_restart_handler(
    State(state): State<Arc<ServerState>>,
    Path((service, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ConfirmBody>,
) -> Result<Json<HostRestartConfirmationResponse>, ApiError> {
    let namespace = namespace(&headers)?;
    let response = state
        .coordinator
        .confirm_restart(RestartConfirmation {
            namespace,
            job_id: id,
            service,
            agent: body.agent.unwrap_or_else(|| "api".to_string()),
            message: body.message.unwrap_or_default(),
            created_at: Some(Utc::now()),
        })
        .await?;
    Ok(Json(response))
}

fn namespace(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(NAMESPACE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("{} header is required", NAMESPACE_HEADER),
            )
        })
}
