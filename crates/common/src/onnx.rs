//! ONNX Runtime session construction
//!
//! Both detectors load their models through [`create_session`] so thread
//! settings and graph optimisation are configured in one place.

use crate::{ProcessingError, Result};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

/// Environment variable overriding the intra-op thread count
pub const THREADS_ENV: &str = "DRIVECHECK_THREADS";

/// Intra-op thread count: `DRIVECHECK_THREADS` if set, else physical cores
#[must_use]
pub fn inference_threads() -> usize {
    std::env::var(THREADS_ENV)
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or_else(num_cpus::get_physical)
}

/// Create an optimised ONNX Runtime session for `model_path`
///
/// # Errors
///
/// Returns [`ProcessingError::ModelLoad`] if the file is missing or the
/// runtime rejects it.
pub fn create_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(ProcessingError::ModelLoad(format!(
            "model file not found: {}",
            model_path.display()
        )));
    }

    let threads = inference_threads();
    let start = Instant::now();
    debug!(
        "Creating ONNX session for {} ({} threads)",
        model_path.display(),
        threads
    );

    let session = Session::builder()
        .map_err(|e| model_load_error(model_path, e))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| model_load_error(model_path, e))?
        .with_intra_threads(threads)
        .map_err(|e| model_load_error(model_path, e))?
        .commit_from_file(model_path)
        .map_err(|e| model_load_error(model_path, e))?;

    info!(
        "Loaded {} in {:.2}s",
        model_path.display(),
        start.elapsed().as_secs_f64()
    );

    Ok(session)
}

fn model_load_error(model_path: &Path, err: impl std::fmt::Display) -> ProcessingError {
    ProcessingError::ModelLoad(format!("{}: {err}", model_path.display()))
}
