//! HTTP request handlers for API endpoints

use axum::{
    extract::{multipart::Field, Multipart, Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use drivecheck_common::{validate_video_filename, ProcessingError};
use drivecheck_evaluator::{encode_jpeg, EvaluationReport};
use std::collections::HashMap;
use std::sync::PoisonError;
use std::time::Instant;
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    types::{HealthResponse, Job, JobResult, JobStatus, JobStatusResponse, SubmitResponse},
    ApiState,
};

/// Multipart field carrying the video
pub const VIDEO_FIELD: &str = "video";

/// JPEG quality of the evidence frame
const EVIDENCE_JPEG_QUALITY: u8 = 85;

type HandlerError = (StatusCode, String);

fn internal_error(err: impl std::fmt::Display) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Accept a multipart video upload and queue an evaluation job
pub async fn submit_evaluation(
    State(state): State<ApiState>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, HandlerError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        if field.name() != Some(VIDEO_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, "video field has no file name".to_string()))?;
        let extension = validate_video_filename(&filename)
            .map_err(|e| (StatusCode::UNSUPPORTED_MEDIA_TYPE, e.to_string()))?;

        let upload = store_upload(&mut field, extension, state.max_upload_bytes).await?;

        let job_id = Uuid::new_v4().to_string();
        info!("Queued evaluation job {} for {}", job_id, filename);
        {
            let mut jobs = state.jobs.write().await;
            prune_finished_jobs(&mut jobs, state.max_finished_jobs);
            jobs.insert(job_id.clone(), Job::queued(job_id.clone(), filename));
        }

        tokio::spawn(run_job(state.clone(), job_id.clone(), upload));

        return Ok((
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                job_id,
                status: JobStatus::Queued,
            }),
        ));
    }

    Err((
        StatusCode::BAD_REQUEST,
        format!("missing multipart field `{VIDEO_FIELD}`"),
    ))
}

/// Stream one multipart field into a temp file, enforcing the size limit
async fn store_upload(
    field: &mut Field<'_>,
    extension: &str,
    max_bytes: u64,
) -> Result<NamedTempFile, HandlerError> {
    let upload = tempfile::Builder::new()
        .prefix("drivecheck-upload-")
        .suffix(&format!(".{extension}"))
        .tempfile()
        .map_err(internal_error)?;
    let mut file = tokio::fs::File::from_std(upload.reopen().map_err(internal_error)?);

    let mut size: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(|e| (e.status(), e.body_text()))? {
        size += chunk.len() as u64;
        if size > max_bytes {
            let err = ProcessingError::FileTooLarge {
                size,
                max: max_bytes,
            };
            warn!("Rejecting upload: {}", err);
            return Err((StatusCode::PAYLOAD_TOO_LARGE, err.to_string()));
        }
        file.write_all(&chunk).await.map_err(internal_error)?;
    }
    file.flush().await.map_err(internal_error)?;

    if size == 0 {
        return Err((StatusCode::BAD_REQUEST, "uploaded video is empty".to_string()));
    }

    Ok(upload)
}

/// Drop the oldest finished jobs so at most `keep` remain
fn prune_finished_jobs(jobs: &mut HashMap<String, Job>, keep: usize) {
    let mut finished: Vec<(Option<Instant>, String)> = jobs
        .values()
        .filter(|job| job.status.is_finished())
        .map(|job| (job.finished_at, job.job_id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }

    finished.sort();
    let evict = finished.len() - keep;
    for (_, job_id) in finished.into_iter().take(evict) {
        jobs.remove(&job_id);
    }
    info!("Evicted {} finished jobs", evict);
}

/// Evaluate an uploaded video and record the outcome
async fn run_job(state: ApiState, job_id: String, upload: NamedTempFile) {
    let runtime = tokio::runtime::Handle::current();
    let task_state = state.clone();
    let task_job_id = job_id.clone();

    let outcome = tokio::task::spawn_blocking(move || {
        // Per-run state lives inside `evaluate_video`, so a panic in an
        // earlier job leaves the evaluator consistent
        let mut evaluator = task_state
            .evaluator
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        runtime.block_on(set_status(&task_state, &task_job_id, JobStatus::Running));
        info!("Starting evaluation job {}", task_job_id);

        let mut report = evaluator
            .evaluate_video(upload.path())
            .map_err(|e| e.to_string())?;
        drop(evaluator);

        let jpeg = report
            .evidence_frame
            .take()
            .map(|frame| encode_jpeg(&frame, EVIDENCE_JPEG_QUALITY))
            .transpose()
            .map_err(|e| e.to_string())?;
        Ok::<(EvaluationReport, Option<Vec<u8>>), String>((report, jpeg))
    })
    .await
    .unwrap_or_else(|e| Err(format!("evaluation task panicked: {e}")));

    let mut jobs = state.jobs.write().await;
    let Some(job) = jobs.get_mut(&job_id) else {
        return;
    };
    job.finished_at = Some(Instant::now());
    match outcome {
        Ok((report, jpeg)) => {
            info!("Job {} finished: {}", job_id, report.verdict);
            job.status = JobStatus::Completed;
            job.report = Some(report);
            job.evidence_jpeg = jpeg;
        }
        Err(e) => {
            error!("Job {} failed: {}", job_id, e);
            job.status = JobStatus::Failed;
            job.error = Some(e);
        }
    }
}

async fn set_status(state: &ApiState, job_id: &str, status: JobStatus) {
    if let Some(job) = state.jobs.write().await.get_mut(job_id) {
        job.status = status;
    }
}

fn not_found(job_id: &str) -> HandlerError {
    (StatusCode::NOT_FOUND, format!("Job not found: {job_id}"))
}

fn not_finished(job: &Job) -> HandlerError {
    (
        StatusCode::CONFLICT,
        format!("Job {} is still {:?}", job.job_id, job.status).to_lowercase(),
    )
}

/// Get job status
pub async fn get_job_status(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let jobs = state.jobs.read().await;
    let job = jobs.get(&job_id).ok_or_else(|| not_found(&job_id))?;
    Ok(Json(JobStatusResponse::from(job)))
}

/// Get the verdict and report of a finished job
pub async fn get_job_result(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let jobs = state.jobs.read().await;
    let job = jobs.get(&job_id).ok_or_else(|| not_found(&job_id))?;

    match (&job.status, &job.report) {
        (JobStatus::Completed, Some(report)) => Ok(Json(JobResult {
            job_id: job.job_id.clone(),
            verdict: report.verdict,
            summary: report.summary_lines(),
            report: report.clone(),
        })),
        (JobStatus::Failed, _) => Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            job.error
                .clone()
                .unwrap_or_else(|| "evaluation failed".to_string()),
        )),
        _ => Err(not_finished(job)),
    }
}

/// Get the annotated evidence frame of a finished job
pub async fn get_job_frame(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, HandlerError> {
    let jobs = state.jobs.read().await;
    let job = jobs.get(&job_id).ok_or_else(|| not_found(&job_id))?;

    if !job.status.is_finished() {
        return Err(not_finished(job));
    }
    let jpeg = job.evidence_jpeg.clone().ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("Job {job_id} has no evidence frame"),
        )
    })?;

    Ok(([(header::CONTENT_TYPE, "image/jpeg")], jpeg))
}
