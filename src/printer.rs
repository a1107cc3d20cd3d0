use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::TelemetryError;
use crate::state::{PrintPhase, PrinterState};

/// A polled source of printer telemetry.
///
/// Implementations perform one status query per call and return a
/// normalized snapshot. They are called from the poller's worker thread.
pub trait TelemetrySource: Send + Sync {
    fn fetch_state(&self) -> Result<PrinterState, TelemetryError>;
}

/// Telemetry client for the Moonraker API.
///
/// Queries `printer/objects/query` for the objects needed to build a
/// [`PrinterState`]: `webhooks`, `print_stats`, `virtual_sdcard` and
/// `display_status`.
pub struct PrinterService {
    pub api_url: String,
    timeout: Duration,
    client: reqwest::blocking::Client,
}

impl PrinterService {
    /// Create a new PrinterService with the provided Moonraker API URL.
    ///
    /// # Arguments
    ///
    /// * `api_url` - Base URL for the Moonraker API (e.g., "http://printer.local:7125")
    /// * `timeout` - Upper bound for a single status request
    ///
    pub fn new(api_url: String, timeout: Duration) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());

        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            timeout,
            client,
        }
    }

    /// URL of the status query issued on every poll.
    pub fn status_url(&self) -> String {
        format!(
            "{}/printer/objects/query?webhooks&print_stats&virtual_sdcard&display_status",
            self.api_url
        )
    }

    /// Get the raw printer status document.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The HTTP request fails or times out
    /// - The Moonraker API returns an error status
    /// - JSON parsing fails
    pub fn get_printer_status(&self) -> Result<Value, TelemetryError> {
        let response = self
            .client
            .get(self.status_url())
            .send()
            .map_err(|e| self.request_error(e))?;

        if !response.status().is_success() {
            return Err(TelemetryError::Http {
                status: response.status().as_u16(),
            });
        }

        response
            .json::<Value>()
            .map_err(|e| TelemetryError::Parse(e.to_string()))
    }

    fn request_error(&self, err: reqwest::Error) -> TelemetryError {
        if err.is_timeout() {
            TelemetryError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }
        } else {
            TelemetryError::Connection {
                api_url: self.api_url.clone(),
                reason: err.to_string(),
            }
        }
    }
}

impl TelemetrySource for PrinterService {
    fn fetch_state(&self) -> Result<PrinterState, TelemetryError> {
        let status = self.get_printer_status()?;
        normalize_status(&status, Utc::now())
    }
}

/// Normalize a Moonraker `printer/objects/query` response.
///
/// Klippy not reporting `ready` maps to [`PrintPhase::Offline`]. Progress is
/// taken from `virtual_sdcard`, then `display_status`, and derived from the
/// layer counts when neither reports it. Remaining time is estimated from the
/// print duration so far.
///
/// # Errors
///
/// Returns [`TelemetryError::Parse`] when the document has no
/// `result.status` object.
pub fn normalize_status(
    document: &Value,
    captured_at: DateTime<Utc>,
) -> Result<PrinterState, TelemetryError> {
    let status = &document["result"]["status"];
    if !status.is_object() {
        return Err(TelemetryError::Parse(
            "missing result.status object".to_string(),
        ));
    }

    let stats = &status["print_stats"];
    let klippy_ready = status["webhooks"]["state"]
        .as_str()
        .map(|state| state == "ready")
        .unwrap_or(true);

    let phase = if klippy_ready {
        phase_from_stats(stats["state"].as_str().unwrap_or("standby"))
    } else {
        PrintPhase::Offline
    };

    let filename = stats["filename"]
        .as_str()
        .filter(|name| !name.is_empty())
        .map(str::to_string);

    let current_layer = layer_value(&stats["info"]["current_layer"]);
    let total_layers = layer_value(&stats["info"]["total_layer"]);

    let fraction = status["virtual_sdcard"]["progress"]
        .as_f64()
        .or_else(|| status["display_status"]["progress"].as_f64());
    let progress = match (fraction, current_layer, total_layers) {
        (Some(fraction), _, _) => fraction * 100.0,
        (None, Some(current), Some(total)) if total > 0 => {
            f64::from(current) / f64::from(total) * 100.0
        }
        _ => 0.0,
    }
    .clamp(0.0, 100.0);

    let remaining = match stats["print_duration"].as_f64() {
        Some(elapsed) if progress > 0.0 && progress < 100.0 && elapsed > 0.0 => {
            let total = elapsed / (progress / 100.0);
            Some(Duration::from_secs_f64((total - elapsed).max(0.0)))
        }
        _ => None,
    };

    Ok(PrinterState {
        filename,
        phase,
        progress,
        current_layer,
        total_layers,
        remaining,
        captured_at,
    })
}

fn phase_from_stats(state: &str) -> PrintPhase {
    match state {
        "printing" => PrintPhase::Printing,
        "paused" => PrintPhase::Paused,
        "complete" => PrintPhase::Complete,
        "error" => PrintPhase::Error,
        // "standby", "cancelled" and anything unknown
        _ => PrintPhase::Idle,
    }
}

fn layer_value(value: &Value) -> Option<u32> {
    value
        .as_u64()
        .and_then(|layer| u32::try_from(layer).ok())
}
