use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Lifecycle phase of the printer as reported by telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrintPhase {
    Idle,
    Printing,
    Paused,
    Complete,
    Error,
    Offline,
}

impl PrintPhase {
    /// Whether a job is in progress (printing or paused).
    pub fn is_active(self) -> bool {
        matches!(self, PrintPhase::Printing | PrintPhase::Paused)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PrintPhase::Idle => "idle",
            PrintPhase::Printing => "printing",
            PrintPhase::Paused => "paused",
            PrintPhase::Complete => "complete",
            PrintPhase::Error => "error",
            PrintPhase::Offline => "offline",
        }
    }
}

impl fmt::Display for PrintPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier scoping a timelapse session to one physical print job.
///
/// The key is the job's file name as reported by the printer. Use
/// [`JobKey::dir_name`] when the key has to become part of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(filename: impl Into<String>) -> Self {
        Self(filename.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form of the key: the file stem with anything other
    /// than ASCII alphanumerics, `-` and `_` replaced by `_`.
    pub fn dir_name(&self) -> String {
        let base = self.0.rsplit(['/', '\\']).next().unwrap_or(&self.0);
        let stem = match base.rfind('.') {
            Some(idx) if idx > 0 => &base[..idx],
            _ => base,
        };
        let cleaned: String = stem
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();

        if cleaned.is_empty() {
            "job".to_string()
        } else {
            cleaned
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable snapshot of the printer taken on one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterState {
    /// File name of the current or most recent job.
    pub filename: Option<String>,
    pub phase: PrintPhase,
    /// Progress in percent, 0 to 100.
    pub progress: f64,
    pub current_layer: Option<u32>,
    pub total_layers: Option<u32>,
    /// Estimated time until the job finishes.
    pub remaining: Option<Duration>,
    pub captured_at: DateTime<Utc>,
}

impl PrinterState {
    /// Convenience constructor for a snapshot without layer or timing data.
    pub fn new(filename: Option<&str>, phase: PrintPhase, progress: f64) -> Self {
        Self {
            filename: filename.map(str::to_string),
            phase,
            progress: progress.clamp(0.0, 100.0),
            current_layer: None,
            total_layers: None,
            remaining: None,
            captured_at: Utc::now(),
        }
    }

    pub fn with_layers(mut self, current: u32, total: u32) -> Self {
        self.current_layer = Some(current);
        self.total_layers = Some(total);
        self
    }

    pub fn with_remaining(mut self, remaining: Duration) -> Self {
        self.remaining = Some(remaining);
        self
    }

    pub fn at(mut self, captured_at: DateTime<Utc>) -> Self {
        self.captured_at = captured_at;
        self
    }

    /// Job key for the current file, if the printer reports one.
    pub fn job_key(&self) -> Option<JobKey> {
        self.filename
            .as_deref()
            .filter(|name| !name.is_empty())
            .map(JobKey::new)
    }

    /// Whether this snapshot differs meaningfully from `previous`.
    ///
    /// Phase, file name and layer changes always count. Progress only counts
    /// once it has moved by at least `progress_noise` percent. The capture
    /// timestamp is ignored.
    pub fn changed_from(&self, previous: &PrinterState, progress_noise: f64) -> bool {
        self.phase != previous.phase
            || self.filename != previous.filename
            || self.current_layer != previous.current_layer
            || self.total_layers != previous.total_layers
            || (self.progress - previous.progress).abs() >= progress_noise
    }

    pub fn progress_report(&self) -> ProgressReport {
        ProgressReport {
            progress: self.progress,
            current_layer: self.current_layer,
            total_layers: self.total_layers,
            remaining: self.remaining,
        }
    }
}

/// Progress signals forwarded to the timelapse manager's last-layer check.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProgressReport {
    pub progress: f64,
    pub current_layer: Option<u32>,
    pub total_layers: Option<u32>,
    pub remaining: Option<Duration>,
}
