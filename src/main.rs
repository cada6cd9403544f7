mod app;
mod audio;
mod config;
mod error;
mod messages;
mod recording;
mod services;

use app::App;
use clap::Parser;
use config::Config;

use anyhow::Result;
use std::path::PathBuf;

/// Record a voice message from the default microphone
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Stop recording automatically after this many milliseconds
    #[arg(long)]
    max_time_ms: Option<u64>,

    /// Directory for kept recordings
    #[arg(long)]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    tracing::info!("Starting voicedrop recorder");

    // Load configuration; flags take precedence over the file
    let mut config = Config::load()?;
    if let Some(max_time_ms) = args.max_time_ms {
        config.max_time_ms = Some(max_time_ms);
    }
    if let Some(output_dir) = args.output_dir {
        config.output_dir = output_dir;
    }
    config.validate()?;

    // Create LocalSet for !Send futures (needed for Recorder which holds cpal::Stream)
    let local = tokio::task::LocalSet::new();

    local
        .run_until(async move { App::new(config).run().await })
        .await?;

    tracing::info!("Voicedrop shutdown complete");
    Ok(())
}
