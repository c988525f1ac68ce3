//! camd command line entry point.
//!
//! Builds a simulated camera from configuration, queues a series of
//! exposures, runs the poll loop until they are read out (or Ctrl-C), and
//! writes each delivered channel as a raw file with its image header first.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camd::config::CamdConfig;
use camd::connection::{MemoryConnection, ReceivedImage};
use camd::daemon;
use camd::{Camera, Shutter};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "camd", version, about = "Camera acquisition daemon")]
struct Args {
    /// Configuration file
    #[arg(short, long, default_value = "config/camd.toml")]
    config: PathBuf,

    /// Log level, overrides the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Chip to expose
    #[arg(long, default_value_t = 0)]
    chip: usize,

    /// Number of exposures to take
    #[arg(short = 'n', long, default_value_t = 1)]
    exposures: u32,

    /// Exposure time in seconds
    #[arg(short = 't', long, default_value_t = 1.0)]
    exptime: f64,

    /// Take dark frames
    #[arg(long)]
    dark: bool,

    /// Directory for the raw frames; nothing is written without it
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = CamdConfig::load_from(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(level) = &args.log_level {
        config.application.log_level = level.clone();
        config.validate().context("invalid --log-level")?;
    }
    init_tracing(&config.application.log_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    runtime.block_on(run(args, config))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(args: Args, config: CamdConfig) -> Result<()> {
    info!(name = %config.application.name, "starting camd");
    let (mut camera, _controls) =
        Camera::simulated(&config).context("failed to initialize camera")?;

    let client = MemoryConnection::new("cli").shared();
    let shutter = if args.dark { Shutter::Dark } else { Shutter::Light };
    for _ in 0..args.exposures {
        let outcome = camera
            .expose(args.chip, shutter, args.exptime, client.clone())
            .context("expose rejected")?;
        info!(?outcome, "exposure requested");
    }

    let expected = args.exposures as usize;
    let watcher = client.clone();
    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Ctrl-C received");
    };
    let summary = daemon::run_until(&mut camera, &config.poll, shutdown, move |_| {
        watcher.oks().len() + watcher.failures().len() >= expected
    })
    .await;

    for failure in client.failures() {
        warn!(error = %failure, "exposure failed");
    }
    let images = client.take_finished_images();
    if let Some(dir) = &args.output {
        write_frames(dir, &images)?;
    }

    let status = serde_json::to_string(&camera.info()).context("failed to encode status")?;
    info!(
        ticks = summary.ticks,
        frames = images.iter().filter(|i| i.complete == Some(true)).count(),
        %status,
        "camd finished"
    );
    Ok(())
}

fn write_frames(dir: &Path, images: &[ReceivedImage]) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    for image in images.iter().filter(|i| i.complete == Some(true)) {
        for stream in &image.channels {
            let path = dir.join(format!(
                "chip{}_exp{:04}_ch{}.raw",
                image.chip, image.exposure, stream.physical
            ));
            let mut bytes = stream.header.encode().to_vec();
            if let Some(data) = image.data.get(&stream.channel) {
                bytes.extend_from_slice(data);
            }
            std::fs::write(&path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), bytes = bytes.len(), "frame written");
        }
    }
    Ok(())
}
