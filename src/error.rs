//! Error types for the Printcast components.
//!
//! Each component owns its own error enum so callers can match on the
//! specific failure. Timer loops never propagate these; they log and carry
//! on. Only directly invoked operations return them.

use std::path::PathBuf;

use thiserror::Error;

use crate::state::JobKey;

/// Errors raised while querying the printer controller.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The query did not complete within the tick timeout.
    #[error("Telemetry query timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// A previous query is still outstanding on the telemetry worker.
    #[error("Telemetry worker is still busy with a previous query")]
    Busy,

    /// The telemetry worker thread has exited.
    #[error("Telemetry worker is no longer running")]
    WorkerStopped,

    /// The controller could not be reached.
    #[error("Failed to reach printer at '{api_url}': {reason}")]
    Connection { api_url: String, reason: String },

    /// The controller answered with a non-success status.
    #[error("Printer API returned HTTP {status}")]
    Http { status: u16 },

    /// The status document was not in the expected shape.
    #[error("Malformed printer status: {0}")]
    Parse(String),
}

/// Errors raised while fetching a still frame from the camera.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The HTTP request itself failed.
    #[error("Failed to fetch frame from '{url}': {reason}")]
    Request { url: String, reason: String },

    /// The camera answered with a non-success status.
    #[error("Camera at '{url}' returned HTTP {status}")]
    Http { url: String, status: u16 },

    /// The payload is not a recognised image.
    #[error("Payload from '{url}' is not a valid image")]
    InvalidImage { url: String },

    /// Applying the configured transformation failed.
    #[error("Failed to transform frame: {0}")]
    Transform(String),

    /// Every retry attempt failed.
    #[error("Failed to fetch frame after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// No camera URLs were configured.
    #[error("No snapshot URLs configured")]
    NoSources,
}

/// Errors raised by the timelapse session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Another job still owns a non-finalized session.
    #[error("A timelapse session is already active for '{active}'")]
    AlreadyActive { active: JobKey },

    /// No session exists for the job.
    #[error("No timelapse session for '{0}'")]
    NotFound(JobKey),

    /// Filesystem error while preparing or writing frames.
    #[error("Timelapse I/O error at '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Assembling frames into a video failed. The session stays stopped but
    /// not finalized so the caller can retry.
    #[error("Timelapse assembly failed for '{key}': {reason}")]
    Assembly { key: JobKey, reason: String },
}

/// Errors raised by the encoder subprocess wrapper.
#[derive(Debug, Error)]
pub enum EncoderError {
    /// The encoder process could not be launched.
    #[error("Failed to spawn encoder '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Signalling or waiting on the process failed.
    #[error("Encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the remote broadcast platform client.
#[derive(Debug, Error)]
pub enum PlatformError {
    /// No credentials are available for a privileged call.
    #[error("Not authenticated with the broadcast platform")]
    NotAuthenticated,

    /// The platform rejected the credentials.
    #[error("Authentication with the broadcast platform failed: {0}")]
    Authentication(String),

    /// The account has run out of API quota.
    #[error("Broadcast platform quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The request never reached the platform.
    #[error("Network error talking to the broadcast platform: {0}")]
    Network(String),

    /// The platform returned an error response.
    #[error("Broadcast platform error at '{endpoint}' (HTTP {status}): {message}")]
    Api {
        endpoint: String,
        status: u16,
        message: String,
    },

    /// The platform answered with an unexpected document.
    #[error("Unexpected response from the broadcast platform: {0}")]
    MalformedResponse(String),
}

/// Errors raised by the broadcast lifecycle manager.
#[derive(Debug, Error)]
pub enum BroadcastError {
    /// A broadcast is already running.
    #[error("A broadcast is already active ({id})")]
    AlreadyActive { id: String },

    /// No broadcast is running.
    #[error("No broadcast is active")]
    NotActive,

    /// A start or stop is already underway.
    #[error("A broadcast is currently {phase}")]
    InProgress { phase: &'static str },

    /// The remote platform call failed.
    #[error(transparent)]
    Platform(#[from] PlatformError),

    /// The local encoder could not be started.
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

/// Errors related to configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("Required environment variable '{var_name}' is not set")]
    MissingEnvVar { var_name: String },

    /// Invalid configuration values provided.
    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}
