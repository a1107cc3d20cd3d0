//! Printcast - print-driven live streaming and timelapse recording.
//!
//! This library watches a 3D printer through its Moonraker API and, driven by
//! the printer's own job status, records a timelapse per print job and keeps a
//! live broadcast of the printer camera running.
//!
//! # Core Components
//!
//! * [`printer`] - Moonraker telemetry client and status normalization
//! * [`poller`] - Periodic state poller emitting change events
//! * [`orchestrator`] - State machine deciding when jobs start and end
//! * [`timelapse`] - Timelapse sessions with single-authority finalization
//! * [`broadcast`] - Broadcast lifecycle with encoder health repair
//! * [`capture`] - Camera snapshot fetching
//! * [`encoder`] - ffmpeg encoder subprocess
//! * [`platform`] - YouTube Live API client
//! * [`config`] - Environment-driven configuration
//! * [`error`] - Error types per component
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use printcast::*;
//!
//! let config = Config::load()?;
//!
//! let printer = Arc::new(PrinterService::new(
//!     config.moonraker_api_url.clone(),
//!     config.poller.timeout,
//! ));
//! let frames = Arc::new(SnapshotFetcher::new(
//!     config.snapshot_urls.clone(),
//!     config.flip_image,
//!     Duration::from_secs(10),
//! ));
//! let timelapse = Arc::new(TimelapseManager::new(
//!     frames,
//!     Arc::new(FfmpegAssembler::new(config.ffmpeg_path.clone())),
//!     config.timelapse.clone(),
//! ));
//! let broadcast = Arc::new(BroadcastManager::new(
//!     Arc::new(YouTubeClient::new(config.youtube_access_token.clone(), Duration::from_secs(10))),
//!     Arc::new(FfmpegEncoder::new(config.ffmpeg_path.clone())),
//!     config.broadcast.clone(),
//! ));
//!
//! let mut poller = StatePoller::new(printer, config.poller.clone());
//! poller.subscribe(Orchestrator::new(config.policy.clone(), timelapse, broadcast));
//!
//! let (_keep_running, shutdown) = crossbeam_channel::bounded::<()>(1);
//! poller.run(&shutdown);
//! # Ok::<(), printcast::error::ConfigError>(())
//! ```

pub mod broadcast;
pub mod capture;
pub mod config;
pub mod encoder;
pub mod error;
pub mod orchestrator;
pub mod platform;
pub mod poller;
pub mod printer;
pub mod state;
pub mod timelapse;

// Re-export commonly used types for convenience
pub use broadcast::{BroadcastManager, BroadcastPhase, BroadcastStatus, HealthReport};
pub use capture::{FrameSource, SnapshotFetcher};
pub use config::Config;
pub use encoder::{Encoder, EncoderProcess, FfmpegEncoder};
pub use orchestrator::{BroadcastControl, Decision, Orchestrator, TimelapseControl};
pub use platform::{BroadcastPlatform, BroadcastTicket, IngestionStatus, Privacy, YouTubeClient};
pub use poller::{PollEvent, StateObserver, StatePoller};
pub use printer::{PrinterService, TelemetrySource};
pub use state::{JobKey, PrintPhase, PrinterState, ProgressReport};
pub use timelapse::{
    FfmpegAssembler, SessionOutcome, StopReason, TimelapseManager, TimelapseSession, VideoAssembler,
};
