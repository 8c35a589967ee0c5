//! Evaluate a driving-test video and print the verdict

use anyhow::{Context as _, Result};
use clap::Args;
use drivecheck_common::validate_video_filename;
use drivecheck_evaluator::{EvaluationConfig, EvaluationReport, Evaluator};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;
use tracing::{info, warn};

/// Exit status for a failed test
const FAIL_EXIT_CODE: u8 = 2;

#[derive(Args)]
pub struct EvaluateCommand {
    /// Driving-test video (.mp4, .mov or .avi)
    #[arg(value_name = "VIDEO")]
    input: PathBuf,

    /// YAML evaluation config
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding the object and face models
    #[arg(long, value_name = "DIR")]
    model_dir: Option<PathBuf>,

    /// Analyse every n-th frame
    #[arg(long, value_name = "N")]
    sample_interval: Option<u32>,

    /// Analyse the whole video instead of stopping at the first violation
    #[arg(long)]
    no_early_stop: bool,

    /// Write the annotated evidence frame (.jpg or .png)
    #[arg(long, value_name = "PATH")]
    save_frame: Option<PathBuf>,

    /// TrueType font for box captions (default: bundled DejaVu Sans Mono)
    #[arg(long, value_name = "FILE")]
    label_font: Option<PathBuf>,

    /// Print the full report as JSON
    #[arg(long)]
    json: bool,
}

impl EvaluateCommand {
    pub fn execute(self) -> Result<ExitCode> {
        let start = Instant::now();

        if !self.input.is_file() {
            anyhow::bail!("Input file does not exist: {}", self.input.display());
        }
        let name = self.input.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        validate_video_filename(name)?;

        let config = self.build_config()?;
        let mut evaluator = Evaluator::load(config).context("Failed to load models")?;
        let report = evaluator
            .evaluate_video(&self.input)
            .with_context(|| format!("Failed to evaluate {}", self.input.display()))?;

        info!(
            "Evaluated {} sampled frames in {:.2}s",
            report.frames_analyzed,
            start.elapsed().as_secs_f64()
        );

        if let Some(path) = &self.save_frame {
            save_evidence(&report, path)?;
        }

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            print_report(&report);
        }

        Ok(if report.passed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(FAIL_EXIT_CODE)
        })
    }

    /// Config file (or defaults) with command-line overrides applied
    fn build_config(&self) -> Result<EvaluationConfig> {
        let mut config = match &self.config {
            Some(path) => EvaluationConfig::from_yaml(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => EvaluationConfig::default(),
        };

        if let Some(dir) = &self.model_dir {
            config = config.with_model_dir(dir);
        }
        if let Some(interval) = self.sample_interval {
            config.sample_interval = interval;
        }
        if self.no_early_stop {
            config.stop_on_first_violation = false;
        }
        if let Some(font) = &self.label_font {
            config.label_font = Some(font.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

fn save_evidence(report: &EvaluationReport, path: &Path) -> Result<()> {
    match &report.evidence_frame {
        Some(frame) => {
            frame
                .save(path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Saved evidence frame to {}", path.display());
        }
        None => warn!("No frame was analysed; nothing saved to {}", path.display()),
    }
    Ok(())
}

fn print_report(report: &EvaluationReport) {
    for line in report.summary_lines() {
        println!("{line}");
    }

    for violation in &report.violations {
        println!(
            "  frame {} at {:.2}s: {:?} ({})",
            violation.frame_number, violation.timestamp, violation.kind, violation.detail
        );
    }
}
