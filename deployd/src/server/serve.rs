//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DeploydError;
use crate::server::handlers::{
    cancel_job_handler, confirm_restart_handler, get_job_handler, health_handler,
    list_jobs_handler, submit_job_handler, version_handler,
};
use crate::server::state::ServerState;

/// Build the API router
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Jobs
        .route("/deployd/job", post(submit_job_handler))
        .route("/deployd/job/{service}", get(list_jobs_handler))
        .route("/deployd/job/{service}/{id}", get(get_job_handler))
        .route("/deployd/job/{service}/{id}/cancel", post(cancel_job_handler))
        .route("/deployd/job/{service}/{id}/confirm", post(confirm_restart_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DeploydError>>, DeploydError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DeploydError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DeploydError::ServerError(e.to_string()))
    });

    Ok(handle)
}
