//! API request and response types

use drivecheck_evaluator::{EvaluationReport, Verdict};
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Job status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Upload stored, waiting for the evaluator
    Queued,
    /// Evaluation in progress
    Running,
    /// Verdict available
    Completed,
    /// Evaluation could not finish
    Failed,
}

impl JobStatus {
    #[must_use]
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// An evaluation job and, once finished, its outcome
#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    /// Upload file name as sent by the client
    pub filename: String,
    pub status: JobStatus,
    pub report: Option<EvaluationReport>,
    /// Annotated evidence frame as JPEG
    pub evidence_jpeg: Option<Vec<u8>>,
    pub error: Option<String>,
    /// When the job completed or failed
    pub finished_at: Option<Instant>,
}

impl Job {
    #[must_use]
    pub fn queued(job_id: String, filename: String) -> Self {
        Self {
            job_id,
            filename,
            status: JobStatus::Queued,
            report: None,
            evidence_jpeg: None,
            error: None,
            finished_at: None,
        }
    }
}

/// Reply to an accepted upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Job status response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: String,
    pub filename: String,
    pub status: JobStatus,
    /// Present once the job completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&Job> for JobStatusResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id.clone(),
            filename: job.filename.clone(),
            status: job.status,
            verdict: job.report.as_ref().map(|report| report.verdict),
            error: job.error.clone(),
        }
    }
}

/// Completed evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub verdict: Verdict,
    /// Human-readable result lines
    pub summary: Vec<String>,
    pub report: EvaluationReport,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
