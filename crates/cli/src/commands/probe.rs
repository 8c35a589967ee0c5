//! Print the properties of a video without running the models

use anyhow::{Context as _, Result};
use clap::Args;
use drivecheck_decoder::probe_video;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Args)]
pub struct ProbeCommand {
    /// Video file to inspect
    #[arg(value_name = "VIDEO")]
    input: PathBuf,

    /// Sampling interval used to estimate the analysed frame count
    #[arg(long, value_name = "N", default_value = "10")]
    sample_interval: u32,

    /// Print as JSON
    #[arg(long)]
    json: bool,
}

impl ProbeCommand {
    pub fn execute(self) -> Result<ExitCode> {
        let info = probe_video(&self.input)
            .with_context(|| format!("Failed to probe {}", self.input.display()))?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&info)?);
        } else {
            println!("File:       {}", self.input.display());
            println!("Format:     {}", info.format);
            println!("Codec:      {}", info.codec);
            println!("Resolution: {}x{}", info.width, info.height);
            println!("Frame rate: {:.2} fps", info.fps);
            println!("Duration:   {:.2}s", info.duration);
            println!("Frames:     ~{}", info.estimated_frames);
            println!(
                "Sampled:    ~{} (every {}th frame)",
                info.sampled_frames(self.sample_interval),
                self.sample_interval
            );
        }

        Ok(ExitCode::SUCCESS)
    }
}
