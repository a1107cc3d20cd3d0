use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::platform::Privacy;

/// Configuration for Printcast loaded from environment variables.
///
/// All values come from the environment to support containerized
/// deployments. The per-component settings structs are handed to the
/// component that owns them; nothing reads the environment after startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Moonraker API URL used for printer telemetry.
    ///
    /// Typically on port 7125, e.g. `http://printer.local:7125`.
    /// Environment variable: `MOONRAKER_API_URL`
    pub moonraker_api_url: String,

    /// Camera snapshot URL(s) for timelapse frames.
    ///
    /// A comma-separated list is fetched round-robin.
    /// Environment variable: `SNAPSHOT_URL`
    pub snapshot_urls: Vec<String>,

    /// Whether to flip captured frames vertically.
    ///
    /// Useful for cameras mounted upside-down.
    /// Environment variable: `FLIP_IMAGE`
    pub flip_image: bool,

    /// Path to the ffmpeg binary used for both streaming and assembly.
    /// Environment variable: `FFMPEG_PATH`
    pub ffmpeg_path: String,

    /// OAuth access token for the YouTube Data API.
    ///
    /// Obtaining the token is outside Printcast; without one every
    /// privileged broadcast call fails with "not authenticated".
    /// Environment variable: `YOUTUBE_ACCESS_TOKEN`
    pub youtube_access_token: Option<String>,

    pub poller: PollerSettings,
    pub timelapse: TimelapseSettings,
    pub broadcast: BroadcastSettings,
    pub policy: OrchestratorPolicy,
}

/// Settings for the state poller.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    /// Time between telemetry queries.
    pub interval: Duration,
    /// Upper bound on a single telemetry query.
    pub timeout: Duration,
    /// Progress movement (in percent) below which a snapshot is unchanged.
    pub progress_noise: f64,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(constants::POLL_INTERVAL_SECONDS),
            timeout: Duration::from_secs(constants::POLL_TIMEOUT_SECONDS),
            progress_noise: constants::PROGRESS_NOISE_PERCENT,
        }
    }
}

/// Thresholds for deciding a print is on its final layer.
///
/// Any one of the three signals is enough.
#[derive(Debug, Clone, Copy)]
pub struct LastLayerPolicy {
    /// Remaining time at or below which the print counts as finished.
    pub remaining_threshold: Duration,
    /// Progress percentage at or above which the print counts as finished.
    pub progress_threshold: f64,
    /// Layers from the top within which the print counts as finished.
    pub layer_offset: u32,
}

impl Default for LastLayerPolicy {
    fn default() -> Self {
        Self {
            remaining_threshold: Duration::from_secs(constants::LAST_LAYER_REMAINING_SECONDS),
            progress_threshold: constants::LAST_LAYER_PROGRESS_PERCENT,
            layer_offset: constants::LAST_LAYER_OFFSET,
        }
    }
}

/// Settings for the timelapse session manager.
#[derive(Debug, Clone)]
pub struct TimelapseSettings {
    /// Root directory; frames go under `frames/`, videos under `timelapses/`.
    pub output_dir: PathBuf,
    /// Time between captured frames.
    pub capture_interval: Duration,
    /// Frame rate of the assembled video.
    pub fps: u32,
    pub last_layer: LastLayerPolicy,
}

impl Default for TimelapseSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            capture_interval: Duration::from_secs(constants::TIMELAPSE_INTERVAL_SECONDS),
            fps: constants::TIMELAPSE_FPS,
            last_layer: LastLayerPolicy::default(),
        }
    }
}

/// Settings for the broadcast lifecycle manager.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Camera stream the encoder reads from.
    pub source_url: String,
    /// Title given to newly created broadcasts.
    pub title: String,
    /// Privacy applied to newly created broadcasts.
    pub privacy: Privacy,
    /// Time between encoder health checks.
    pub health_interval: Duration,
    /// Consecutive failed checks before the encoder is restarted.
    pub failure_threshold: u32,
    /// Grace given to the encoder to exit before it is killed.
    pub stop_timeout: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            source_url: String::new(),
            title: "3D Print Live".to_string(),
            privacy: Privacy::Unlisted,
            health_interval: Duration::from_secs(constants::HEALTH_CHECK_INTERVAL_SECONDS),
            failure_threshold: constants::HEALTH_CHECK_FAILURES,
            stop_timeout: Duration::from_secs(constants::ENCODER_STOP_TIMEOUT_SECONDS),
        }
    }
}

/// Policy switches and grace periods used by the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorPolicy {
    pub timelapse_enabled: bool,
    pub stream_enabled: bool,
    /// Stop the broadcast when a job ends.
    pub end_stream_after_print: bool,
    /// How long telemetry may be unavailable before the job counts as ended.
    pub offline_grace: Duration,
    /// How long the printer may report idle before the job counts as ended.
    pub idle_grace: Duration,
}

impl Default for OrchestratorPolicy {
    fn default() -> Self {
        Self {
            timelapse_enabled: true,
            stream_enabled: false,
            end_stream_after_print: true,
            offline_grace: Duration::from_secs(constants::OFFLINE_GRACE_SECONDS),
            idle_grace: Duration::from_secs(constants::IDLE_GRACE_SECONDS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a required variable is missing or a value cannot
    /// be parsed:
    /// - `MOONRAKER_API_URL`: Moonraker API URL (required)
    /// - `SNAPSHOT_URL`: Camera snapshot URL(s) (required)
    /// - `STREAM_SOURCE_URL`: Camera stream URL for the encoder (required)
    /// - `OUTPUT_DIR`: Output directory (default: "./output")
    /// - `POLL_INTERVAL_SECONDS` / `POLL_TIMEOUT_SECONDS` (default: 5 / 4)
    /// - `OFFLINE_GRACE_SECONDS` / `IDLE_GRACE_SECONDS` (default: 120 / 30)
    /// - `TIMELAPSE_ENABLED` (default: true), `TIMELAPSE_INTERVAL_SECONDS` (10), `TIMELAPSE_FPS` (30)
    /// - `STREAM_ENABLED` (default: false), `END_STREAM_AFTER_PRINT` (true)
    /// - `LAST_LAYER_REMAINING_SECONDS` (30), `LAST_LAYER_PROGRESS_PERCENT` (99.5), `LAST_LAYER_OFFSET` (1)
    /// - `HEALTH_CHECK_INTERVAL_SECONDS` (10), `HEALTH_CHECK_FAILURES` (3)
    /// - `FFMPEG_PATH` (default: "ffmpeg"), `FLIP_IMAGE` (default: false)
    /// - `YOUTUBE_ACCESS_TOKEN`, `STREAM_TITLE`, `STREAM_PRIVACY` (default: "unlisted")
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// let config = printcast::Config::load().expect("Failed to load configuration");
    /// ```
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let moonraker_api_url = env.required("MOONRAKER_API_URL")?;
        let snapshot_urls: Vec<String> = env
            .required("SNAPSHOT_URL")?
            .split(',')
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        if snapshot_urls.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "SNAPSHOT_URL".to_string(),
                value: String::new(),
                reason: "at least one URL is required".to_string(),
            });
        }
        let source_url = env.required("STREAM_SOURCE_URL")?;

        let poller = PollerSettings {
            interval: env.seconds("POLL_INTERVAL_SECONDS", constants::POLL_INTERVAL_SECONDS)?,
            timeout: env.seconds("POLL_TIMEOUT_SECONDS", constants::POLL_TIMEOUT_SECONDS)?,
            progress_noise: constants::PROGRESS_NOISE_PERCENT,
        };

        let last_layer = LastLayerPolicy {
            remaining_threshold: env.seconds(
                "LAST_LAYER_REMAINING_SECONDS",
                constants::LAST_LAYER_REMAINING_SECONDS,
            )?,
            progress_threshold: env.parse(
                "LAST_LAYER_PROGRESS_PERCENT",
                constants::LAST_LAYER_PROGRESS_PERCENT,
            )?,
            layer_offset: env.parse("LAST_LAYER_OFFSET", constants::LAST_LAYER_OFFSET)?,
        };

        let timelapse = TimelapseSettings {
            output_dir: PathBuf::from(env.or("OUTPUT_DIR", "./output")),
            capture_interval: env.seconds(
                "TIMELAPSE_INTERVAL_SECONDS",
                constants::TIMELAPSE_INTERVAL_SECONDS,
            )?,
            fps: env.parse("TIMELAPSE_FPS", constants::TIMELAPSE_FPS)?,
            last_layer,
        };

        let broadcast = BroadcastSettings {
            source_url,
            title: env.or("STREAM_TITLE", "3D Print Live"),
            privacy: env.parse("STREAM_PRIVACY", Privacy::Unlisted)?,
            health_interval: env.seconds(
                "HEALTH_CHECK_INTERVAL_SECONDS",
                constants::HEALTH_CHECK_INTERVAL_SECONDS,
            )?,
            failure_threshold: env
                .parse("HEALTH_CHECK_FAILURES", constants::HEALTH_CHECK_FAILURES)?
                .max(1),
            stop_timeout: Duration::from_secs(constants::ENCODER_STOP_TIMEOUT_SECONDS),
        };

        let policy = OrchestratorPolicy {
            timelapse_enabled: env.parse("TIMELAPSE_ENABLED", true)?,
            stream_enabled: env.parse("STREAM_ENABLED", false)?,
            end_stream_after_print: env.parse("END_STREAM_AFTER_PRINT", true)?,
            offline_grace: env.seconds("OFFLINE_GRACE_SECONDS", constants::OFFLINE_GRACE_SECONDS)?,
            idle_grace: env.seconds("IDLE_GRACE_SECONDS", constants::IDLE_GRACE_SECONDS)?,
        };

        Ok(Config {
            moonraker_api_url,
            snapshot_urls,
            flip_image: env.parse("FLIP_IMAGE", false)?,
            ffmpeg_path: env.or("FFMPEG_PATH", "ffmpeg"),
            youtube_access_token: (env.lookup)("YOUTUBE_ACCESS_TOKEN")
                .filter(|token| !token.trim().is_empty()),
            poller,
            timelapse,
            broadcast,
            policy,
        })
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, name: &str) -> Result<String, ConfigError> {
        (self.lookup)(name)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar {
                var_name: name.to_string(),
            })
    }

    fn or(&self, name: &str, default: &str) -> String {
        (self.lookup)(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        match (self.lookup)(name) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                field: name.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            }),
        }
    }

    fn seconds(&self, name: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(name, default).map(Duration::from_secs)
    }
}

/// Application constants used throughout the system.
pub mod constants {
    /// Default time between printer status queries.
    pub const POLL_INTERVAL_SECONDS: u64 = 5;

    /// Default upper bound on a single status query.
    pub const POLL_TIMEOUT_SECONDS: u64 = 4;

    /// Progress movement below this many percent is treated as noise.
    pub const PROGRESS_NOISE_PERCENT: f64 = 0.5;

    /// Default tolerated telemetry outage before a job counts as ended.
    pub const OFFLINE_GRACE_SECONDS: u64 = 120;

    /// Default tolerated idle time before a job counts as ended.
    pub const IDLE_GRACE_SECONDS: u64 = 30;

    pub const TIMELAPSE_INTERVAL_SECONDS: u64 = 10;
    pub const TIMELAPSE_FPS: u32 = 30;

    pub const LAST_LAYER_REMAINING_SECONDS: u64 = 30;
    pub const LAST_LAYER_PROGRESS_PERCENT: f64 = 99.5;
    pub const LAST_LAYER_OFFSET: u32 = 1;

    pub const HEALTH_CHECK_INTERVAL_SECONDS: u64 = 10;
    pub const HEALTH_CHECK_FAILURES: u32 = 3;

    /// Grace given to ffmpeg to exit after a quit request.
    pub const ENCODER_STOP_TIMEOUT_SECONDS: u64 = 5;

    /// Manual snapshot retry policy.
    pub const MAX_RETRIES: u32 = 3;
    pub const RETRY_DELAY_SECONDS: u64 = 2;

    /// Timeout applied to camera and platform HTTP requests.
    pub const HTTP_TIMEOUT_SECONDS: u64 = 10;
}
