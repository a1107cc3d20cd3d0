use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info, warn};

use printcast::config::{Config, constants};
use printcast::{
    BroadcastManager, FfmpegAssembler, FfmpegEncoder, Orchestrator, PrinterService,
    SnapshotFetcher, StatePoller, StopReason, TimelapseManager, YouTubeClient,
};

/// Printcast - print-driven live streaming and timelapse recording.
///
/// Polls a Klipper printer through Moonraker and, while a job is printing,
/// records a timelapse of it and streams the camera live to YouTube.
///
/// # Features
///
/// * One timelapse per print job, finalized early at the last layer
/// * Grace periods so brief disconnects do not split a job
/// * Live broadcast that survives encoder crashes without changing identity
///
/// # Environment Variables
///
/// Required:
/// * `MOONRAKER_API_URL` - Moonraker API endpoint
/// * `SNAPSHOT_URL` - Camera snapshot URL(s) for timelapse frames (comma-separated for round-robin)
/// * `STREAM_SOURCE_URL` - Camera stream URL fed to the encoder
///
/// Optional (with defaults):
/// * `OUTPUT_DIR` - Output directory (default: "./output")
/// * `TIMELAPSE_ENABLED` - Record timelapses (default: "true")
/// * `STREAM_ENABLED` - Broadcast live (default: "false")
/// * `YOUTUBE_ACCESS_TOKEN` - Access token for the YouTube Data API
/// * `FLIP_IMAGE` - Flip frames vertically (default: "false")
///
/// See [`Config::load`] for the full list.
///
/// # Usage
///
/// ```bash
/// export MOONRAKER_API_URL="http://printer.local:7125"
/// export SNAPSHOT_URL="http://printer.local/webcam/?action=snapshot"
/// export STREAM_SOURCE_URL="http://printer.local/webcam/?action=stream"
/// export STREAM_ENABLED="true"
/// export YOUTUBE_ACCESS_TOKEN="ya29...."
/// ./printcast
/// ```
fn main() -> Result<()> {
    // Initialize logger to output to stdout, using RUST_LOG env var or info level by default
    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(
            std::env::var("RUST_LOG")
                .ok()
                .and_then(|level| level.parse().ok())
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    let config = Config::load().context(
        "Failed to load configuration. Please ensure all required environment variables are set.",
    )?;

    info!("Printcast starting...");
    info!("Using Moonraker API URL: {}", config.moonraker_api_url);
    info!(
        "Capturing from {} camera(s): {}",
        config.snapshot_urls.len(),
        config.snapshot_urls.join(", ")
    );

    fs::create_dir_all(&config.timelapse.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.timelapse.output_dir.display()
        )
    })?;
    info!(
        "Output directory created at: {}",
        config.timelapse.output_dir.display()
    );

    let http_timeout = Duration::from_secs(constants::HTTP_TIMEOUT_SECONDS);

    let printer = Arc::new(PrinterService::new(
        config.moonraker_api_url.clone(),
        config.poller.timeout,
    ));

    let snapshots = Arc::new(SnapshotFetcher::new(
        config.snapshot_urls.clone(),
        config.flip_image,
        http_timeout,
    ));
    // Fail early on a dead camera, but keep going: frames are skipped until it returns.
    match snapshots.fetch_with_retry(
        constants::MAX_RETRIES,
        Duration::from_secs(constants::RETRY_DELAY_SECONDS),
    ) {
        Ok(frame) => info!("Camera reachable ({} bytes per snapshot)", frame.len()),
        Err(e) => warn!("Camera not reachable at startup: {}", e),
    }

    let timelapse = Arc::new(TimelapseManager::new(
        snapshots,
        Arc::new(FfmpegAssembler::new(config.ffmpeg_path.clone())),
        config.timelapse.clone(),
    ));

    let youtube = YouTubeClient::new(config.youtube_access_token.clone(), http_timeout);
    if config.policy.stream_enabled && !youtube.is_authenticated() {
        warn!("Streaming is enabled but YOUTUBE_ACCESS_TOKEN is not set; broadcasts will fail");
    }
    let broadcast = Arc::new(BroadcastManager::new(
        Arc::new(youtube),
        Arc::new(FfmpegEncoder::new(config.ffmpeg_path.clone())),
        config.broadcast.clone(),
    ));

    let orchestrator = Orchestrator::new(
        config.policy.clone(),
        timelapse.clone(),
        broadcast.clone(),
    );

    let mut poller = StatePoller::new(printer, config.poller.clone());
    poller.subscribe(orchestrator);

    // Create .ready file to indicate the application is fully initialized
    fs::write(".ready", "ready")?;
    info!("Application ready - created .ready file for healthcheck");

    info!(
        "Printcast initialized (timelapse: {}, stream: {}). Starting poll loop...",
        config.policy.timelapse_enabled, config.policy.stream_enabled
    );

    // The sender stays alive for the life of the process.
    let (_shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    poller.run(&shutdown_rx);

    if let Some(session) = timelapse.active_session() {
        if let Err(e) = timelapse.stop_session(session.key(), StopReason::Shutdown) {
            error!("Failed to finalize timelapse on shutdown: {}", e);
        }
    }

    Ok(())
}
