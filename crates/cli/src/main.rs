//! drivecheck - automated driving-test evaluation
//!
//! Command-line front-end for the evaluator and the API server.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::evaluate::EvaluateCommand;
use commands::probe::ProbeCommand;
use commands::serve::ServeCommand;

#[derive(Parser)]
#[command(
    name = "drivecheck",
    version,
    about = "Evaluate driving-test videos for cone contact and head position",
    long_about = "Samples every 10th frame of a driving-test video, looks for cones and people\n\
                  with a YOLO model and for the driver's face with an UltraFace model, and\n\
                  prints a PASS/FAIL verdict.",
    after_help = "EXAMPLES:\n  \
                  # Evaluate a video with models from ./models\n  \
                  drivecheck evaluate test-drive.mp4\n\n  \
                  # Keep going after the first violation and save the evidence frame\n  \
                  drivecheck evaluate --no-early-stop --save-frame evidence.jpg test-drive.mp4\n\n  \
                  # Inspect a video without running the models\n  \
                  drivecheck probe test-drive.mp4\n\n  \
                  # Serve the upload API\n  \
                  drivecheck serve --addr 127.0.0.1:8080\n\n\
                  Exit status: 0 on PASS, 2 on FAIL, 1 on error."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a driving-test video
    Evaluate(EvaluateCommand),

    /// Print video stream properties
    Probe(ProbeCommand),

    /// Run the HTTP upload API
    Serve(ServeCommand),
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Evaluate(cmd) => cmd.execute(),
        Commands::Probe(cmd) => cmd.execute(),
        Commands::Serve(cmd) => cmd.execute().await,
    }
}
