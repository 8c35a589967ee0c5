//! REST API server for driving-test evaluation
//!
//! Uploads are accepted as multipart form data, evaluated in the background,
//! and polled by job id:
//!
//! - `POST /api/v1/evaluations` (field `video`) queues a job
//! - `GET /api/v1/jobs/{job_id}/status` reports progress
//! - `GET /api/v1/jobs/{job_id}/result` returns the verdict and report
//! - `GET /api/v1/jobs/{job_id}/frame` returns the annotated evidence frame

mod handlers;
mod types;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use drivecheck_evaluator::{EvaluationConfig, Evaluator};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use handlers::*;
pub use types::*;

/// Default bind address
pub const DEFAULT_ADDR: &str = "0.0.0.0:8080";
/// Default upload limit in MiB
pub const DEFAULT_MAX_UPLOAD_MB: u64 = 512;
/// Default number of finished jobs kept for polling
pub const DEFAULT_MAX_FINISHED_JOBS: usize = 256;

/// Multipart framing allowance on top of the upload limit
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Deployment settings
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: String,
    /// YAML evaluation config; defaults apply when unset
    pub evaluation_config: Option<PathBuf>,
    pub max_upload_bytes: u64,
    /// Finished jobs beyond this count are evicted, oldest first
    pub max_finished_jobs: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            evaluation_config: None,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
            max_finished_jobs: DEFAULT_MAX_FINISHED_JOBS,
        }
    }
}

impl ServerConfig {
    /// Read `API_SERVER_ADDR`, `DRIVECHECK_CONFIG`, `DRIVECHECK_MAX_UPLOAD_MB`
    /// and `DRIVECHECK_MAX_FINISHED_JOBS`
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let max_upload_bytes = match lookup("DRIVECHECK_MAX_UPLOAD_MB") {
            Some(raw) => {
                let mb: u64 = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("DRIVECHECK_MAX_UPLOAD_MB is not a number: {raw}"))?;
                anyhow::ensure!(mb > 0, "DRIVECHECK_MAX_UPLOAD_MB must be positive");
                mb * 1024 * 1024
            }
            None => defaults.max_upload_bytes,
        };

        let max_finished_jobs = match lookup("DRIVECHECK_MAX_FINISHED_JOBS") {
            Some(raw) => raw.trim().parse().with_context(|| {
                format!("DRIVECHECK_MAX_FINISHED_JOBS is not a number: {raw}")
            })?,
            None => defaults.max_finished_jobs,
        };

        Ok(Self {
            addr: lookup("API_SERVER_ADDR").unwrap_or(defaults.addr),
            evaluation_config: lookup("DRIVECHECK_CONFIG").map(PathBuf::from),
            max_upload_bytes,
            max_finished_jobs,
        })
    }

    /// Load the evaluation config named by this server config
    pub fn load_evaluation_config(&self) -> anyhow::Result<EvaluationConfig> {
        match &self.evaluation_config {
            Some(path) => EvaluationConfig::from_yaml(path)
                .with_context(|| format!("Failed to load {}", path.display())),
            None => Ok(EvaluationConfig::default()),
        }
    }
}

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// Evaluator with both models loaded; one evaluation runs at a time
    pub evaluator: Arc<Mutex<Evaluator>>,
    /// Jobs by id
    pub jobs: Arc<RwLock<HashMap<String, Job>>>,
    pub max_upload_bytes: u64,
    /// Finished jobs kept before the oldest are evicted
    pub max_finished_jobs: usize,
}

impl ApiState {
    #[must_use]
    pub fn new(evaluator: Evaluator, max_upload_bytes: u64) -> Self {
        Self {
            evaluator: Arc::new(Mutex::new(evaluator)),
            jobs: Arc::new(RwLock::new(HashMap::with_capacity(100))),
            max_upload_bytes,
            max_finished_jobs: DEFAULT_MAX_FINISHED_JOBS,
        }
    }

    #[must_use]
    pub fn with_max_finished_jobs(mut self, max_finished_jobs: usize) -> Self {
        self.max_finished_jobs = max_finished_jobs;
        self
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    let body_limit = usize::try_from(state.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    Router::new()
        // Health check
        .route("/health", get(health_check))
        // Upload
        .route(
            "/api/v1/evaluations",
            post(submit_evaluation).layer(DefaultBodyLimit::max(body_limit)),
        )
        // Status and query endpoints
        .route("/api/v1/jobs/{job_id}/status", get(get_job_status))
        .route("/api/v1/jobs/{job_id}/result", get(get_job_result))
        .route("/api/v1/jobs/{job_id}/frame", get(get_job_frame))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Start the API server
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting API server on {}", addr);

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app).await
}

/// Load the models and serve until the process is stopped
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let evaluation_config = config.load_evaluation_config()?;
    tracing::info!(
        "Loading models {} and {}",
        evaluation_config.models.object_model.display(),
        evaluation_config.models.face_model.display()
    );
    let evaluator = tokio::task::spawn_blocking(move || Evaluator::load(evaluation_config))
        .await
        .context("model loading task failed")?
        .context("Failed to load models")?;

    let state = ApiState::new(evaluator, config.max_upload_bytes)
        .with_max_finished_jobs(config.max_finished_jobs);
    start_server(&config.addr, state).await?;
    Ok(())
}
