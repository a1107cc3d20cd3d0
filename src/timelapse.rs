//! Timelapse session manager.
//!
//! Owns at most one non-finalized capture session at a time, keyed by job.
//! Frames are written as `frame_NNNNNN.<ext>` into a per-session directory by
//! a capture thread, in the image format of the session's first frame;
//! finalization stops that thread and hands the directory to a
//! [`VideoAssembler`]. Finalization happens at most once per session no
//! matter how many callers ask for it, and assembly runs without holding the
//! registry lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, select};
use log::{debug, error, info, warn};
use image::{DynamicImage, ImageFormat};
use parking_lot::{Mutex, MutexGuard};

use crate::capture::FrameSource;
use crate::config::{LastLayerPolicy, TimelapseSettings};
use crate::error::SessionError;
use crate::state::{JobKey, ProgressReport};

/// Turns a directory of numbered frames into a video file.
pub trait VideoAssembler: Send + Sync {
    /// Assemble `frame_count` frames named `frame_NNNNNN.<extension>` from
    /// `frames_dir` into `output`.
    fn assemble(
        &self,
        frames_dir: &Path,
        extension: &str,
        frame_count: u64,
        fps: u32,
        output: &Path,
    ) -> io::Result<()>;
}

/// Assembles timelapses with an ffmpeg invocation.
pub struct FfmpegAssembler {
    ffmpeg_path: String,
}

impl FfmpegAssembler {
    pub fn new(ffmpeg_path: String) -> Self {
        Self { ffmpeg_path }
    }
}

impl VideoAssembler for FfmpegAssembler {
    fn assemble(
        &self,
        frames_dir: &Path,
        extension: &str,
        frame_count: u64,
        fps: u32,
        output: &Path,
    ) -> io::Result<()> {
        let pattern = frames_dir.join(format!("frame_%06d.{}", extension));
        info!(
            "Assembling {} frames from {} into {}",
            frame_count,
            frames_dir.display(),
            output.display()
        );

        let result = Command::new(&self.ffmpeg_path)
            .arg("-y")
            .args(["-loglevel", "error"])
            .args(["-framerate", &fps.to_string()])
            .arg("-i")
            .arg(&pattern)
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p"])
            .arg(output)
            .output()?;

        if !result.status.success() {
            return Err(io::Error::other(format!(
                "ffmpeg exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            )));
        }

        Ok(())
    }
}

/// Why a session is being stopped from outside the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    JobChanged,
    JobEnded,
    TelemetryLost,
    Manual,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            StopReason::JobChanged => "job changed",
            StopReason::JobEnded => "job ended",
            StopReason::TelemetryLost => "telemetry lost",
            StopReason::Manual => "manual stop",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(text)
    }
}

/// Lifecycle of a session. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Active,
    Stopped,
    Finalized,
}

/// One capture session for one job.
#[derive(Debug, Clone)]
pub struct TimelapseSession {
    key: JobKey,
    /// Directory name, also used for the video file.
    name: String,
    created_at: DateTime<Utc>,
    last_frame_at: Option<DateTime<Utc>>,
    frame_count: u64,
    frames_dir: PathBuf,
    /// Set by the first stored frame; later frames are converted to it.
    frame_format: Option<ImageFormat>,
    phase: SessionPhase,
}

impl TimelapseSession {
    fn new(key: JobKey, frames_dir: PathBuf, created_at: DateTime<Utc>) -> Self {
        let name = frames_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.dir_name());
        Self {
            key,
            name,
            created_at,
            last_frame_at: None,
            frame_count: 0,
            frames_dir,
            frame_format: None,
            phase: SessionPhase::Active,
        }
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_frame_at(&self) -> Option<DateTime<Utc>> {
        self.last_frame_at
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn frames_dir(&self) -> &Path {
        &self.frames_dir
    }

    /// File extension of the stored frames, once a frame has been stored.
    pub fn frame_extension(&self) -> Option<&'static str> {
        self.frame_format.map(extension_for)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_stopped(&self) -> bool {
        self.phase >= SessionPhase::Stopped
    }

    pub fn is_finalized(&self) -> bool {
        self.phase == SessionPhase::Finalized
    }

    fn stop(&mut self) {
        if self.phase < SessionPhase::Stopped {
            self.phase = SessionPhase::Stopped;
        }
    }

    fn frame_path(&self, index: u64, format: ImageFormat) -> PathBuf {
        self.frames_dir
            .join(format!("frame_{:06}.{}", index, extension_for(format)))
    }
}

fn extension_for(format: ImageFormat) -> &'static str {
    format.extensions_str().first().copied().unwrap_or("img")
}

/// Re-encode a frame into `target`.
fn convert_frame(data: &[u8], target: ImageFormat) -> image::ImageResult<Vec<u8>> {
    let mut frame = image::load_from_memory(data)?;
    if target == ImageFormat::Jpeg {
        frame = DynamicImage::ImageRgb8(frame.to_rgb8());
    }
    let mut buffer = Vec::new();
    frame.write_to(&mut Cursor::new(&mut buffer), target)?;
    Ok(buffer)
}

/// Result of a progress notification or stop request.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The session is still capturing.
    Recording,
    /// This call finalized the session. `artifact` is `None` when no frames
    /// were captured.
    Finalized {
        artifact: Option<PathBuf>,
        frames: u64,
    },
    /// Another caller is assembling the session right now.
    Finalizing,
    /// The session had already been finalized; nothing was done.
    AlreadyFinalized,
}

impl LastLayerPolicy {
    /// Whether the progress signals say the print is on its final stretch.
    pub fn is_last_layer(&self, report: &ProgressReport) -> bool {
        let by_time = report
            .remaining
            .is_some_and(|remaining| remaining <= self.remaining_threshold);
        let by_progress = report.progress >= self.progress_threshold;
        let by_layer = match (report.current_layer, report.total_layers) {
            (Some(current), Some(total)) if current > 0 && total > 0 => {
                current.saturating_add(self.layer_offset) >= total
            }
            _ => false,
        };

        by_time || by_progress || by_layer
    }
}

struct CaptureTimer {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

impl CaptureTimer {
    fn spawn(
        session: Arc<Mutex<TimelapseSession>>,
        frames: Arc<dyn FrameSource>,
        interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = bounded::<()>(1);
        let handle = thread::spawn(move || capture_loop(session, frames, interval, shutdown_rx));
        Self { shutdown, handle }
    }

    fn cancel(self) {
        let _ = self.shutdown.try_send(());
        drop(self.shutdown);
        if self.handle.join().is_err() {
            error!("Capture thread panicked");
        }
    }
}

fn capture_loop(
    session: Arc<Mutex<TimelapseSession>>,
    frames: Arc<dyn FrameSource>,
    interval: Duration,
    shutdown: Receiver<()>,
) {
    let ticker = crossbeam_channel::tick(interval);
    capture_frame(&session, frames.as_ref());

    loop {
        let due = select! {
            recv(shutdown) -> _ => false,
            recv(ticker) -> _ => true,
        };
        if !due {
            break;
        }
        capture_frame(&session, frames.as_ref());
    }
    debug!("Capture loop exiting");
}

/// Capture one frame into the session.
///
/// The frame is fetched without holding the session lock, then written under
/// it. A session that was stopped in the meantime discards the frame, so no
/// frame is ever added after stop.
fn capture_frame(session: &Mutex<TimelapseSession>, frames: &dyn FrameSource) {
    if session.lock().is_stopped() {
        return;
    }

    let data = match frames.fetch_frame() {
        Ok(data) => data,
        Err(e) => {
            warn!("Skipping timelapse frame: {}", e);
            return;
        }
    };

    let format = match image::guess_format(&data) {
        Ok(format) => format,
        Err(e) => {
            warn!("Skipping timelapse frame in unknown format: {}", e);
            return;
        }
    };

    let mut session = session.lock();
    if session.is_stopped() {
        debug!("Discarding frame captured after stop for '{}'", session.key);
        return;
    }

    let target = *session.frame_format.get_or_insert(format);
    let data = if format == target {
        data
    } else {
        match convert_frame(&data, target) {
            Ok(converted) => converted,
            Err(e) => {
                warn!(
                    "Skipping {:?} frame that could not be converted to {:?}: {}",
                    format, target, e
                );
                return;
            }
        }
    };

    let path = session.frame_path(session.frame_count, target);
    match fs::write(&path, &data) {
        Ok(()) => {
            session.frame_count += 1;
            session.last_frame_at = Some(Utc::now());
            debug!(
                "Captured frame {} for '{}'",
                session.frame_count, session.key
            );
        }
        Err(e) => warn!("Failed to write frame {}: {}", path.display(), e),
    }
}

struct ActiveSession {
    session: Arc<Mutex<TimelapseSession>>,
    timer: Option<CaptureTimer>,
    /// A caller is assembling this session outside the registry lock.
    finalizing: bool,
}

#[derive(Default)]
struct Registry {
    active: HashMap<JobKey, ActiveSession>,
    /// Jobs finalized since the most recent session start.
    finalized: HashSet<JobKey>,
}

impl Registry {
    /// Key of a non-finalized session other than `key`, if any.
    fn other_active(&self, key: &JobKey) -> Option<JobKey> {
        self.active.keys().find(|active| *active != key).cloned()
    }
}

/// Owns timelapse sessions and is the only place that finalizes them.
pub struct TimelapseManager {
    frames: Arc<dyn FrameSource>,
    assembler: Arc<dyn VideoAssembler>,
    settings: TimelapseSettings,
    registry: Mutex<Registry>,
}

impl TimelapseManager {
    pub fn new(
        frames: Arc<dyn FrameSource>,
        assembler: Arc<dyn VideoAssembler>,
        settings: TimelapseSettings,
    ) -> Self {
        Self {
            frames,
            assembler,
            settings,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn settings(&self) -> &TimelapseSettings {
        &self.settings
    }

    /// Start capturing for `key`.
    ///
    /// Starting the job that is already recording returns its current
    /// session unchanged.
    ///
    /// # Errors
    ///
    /// * [`SessionError::AlreadyActive`] if another job still has a
    ///   non-finalized session
    /// * [`SessionError::Io`] if the frame directory cannot be created
    pub fn start_session(&self, key: &JobKey) -> Result<TimelapseSession, SessionError> {
        let mut registry = self.registry.lock();

        if let Some(active) = registry.other_active(key) {
            return Err(SessionError::AlreadyActive { active });
        }
        if let Some(existing) = registry.active.get(key) {
            info!("Timelapse for '{}' is already recording", key);
            return Ok(existing.session.lock().clone());
        }

        let created_at = Utc::now();
        let frames_root = self.settings.output_dir.join("frames");
        let stem = format!("{}_{}", key.dir_name(), created_at.format("%Y%m%d_%H%M%S"));
        let mut frames_dir = frames_root.join(&stem);
        let mut attempt = 1;
        while frames_dir.exists() {
            attempt += 1;
            frames_dir = frames_root.join(format!("{}_{}", stem, attempt));
        }
        fs::create_dir_all(&frames_dir).map_err(|source| SessionError::Io {
            path: frames_dir.clone(),
            source,
        })?;

        let session = Arc::new(Mutex::new(TimelapseSession::new(
            key.clone(),
            frames_dir.clone(),
            created_at,
        )));
        let timer = CaptureTimer::spawn(
            Arc::clone(&session),
            Arc::clone(&self.frames),
            self.settings.capture_interval,
        );

        registry.finalized.clear();
        let snapshot = session.lock().clone();
        registry.active.insert(
            key.clone(),
            ActiveSession {
                session,
                timer: Some(timer),
                finalizing: false,
            },
        );

        info!(
            "Started timelapse for '{}' (frames in {})",
            key,
            frames_dir.display()
        );
        Ok(snapshot)
    }

    /// Feed progress for `key` and finalize on the first last-layer match.
    ///
    /// Once a session is finalized, further calls return
    /// [`SessionOutcome::AlreadyFinalized`] and never assemble again; while
    /// another caller is assembling it they return
    /// [`SessionOutcome::Finalizing`]. A session whose earlier finalization
    /// failed is retried here.
    ///
    /// # Errors
    ///
    /// * [`SessionError::NotFound`] if `key` never had a session
    /// * [`SessionError::Assembly`] if finalization failed
    pub fn notify_progress(
        &self,
        key: &JobKey,
        report: &ProgressReport,
    ) -> Result<SessionOutcome, SessionError> {
        let mut registry = self.registry.lock();

        let stopped = match registry.active.get(key) {
            Some(entry) => entry.session.lock().is_stopped(),
            None if registry.finalized.contains(key) => {
                return Ok(SessionOutcome::AlreadyFinalized);
            }
            None => return Err(SessionError::NotFound(key.clone())),
        };

        if !stopped && !self.settings.last_layer.is_last_layer(report) {
            return Ok(SessionOutcome::Recording);
        }

        info!(
            "Last layer reached for '{}' ({:.1}%, layer {:?}/{:?}), finalizing timelapse",
            key, report.progress, report.current_layer, report.total_layers
        );
        self.finalize(&mut registry, key)
    }

    /// Stop and finalize the session for `key`. Idempotent once finalized.
    ///
    /// # Errors
    ///
    /// * [`SessionError::NotFound`] if `key` never had a session
    /// * [`SessionError::Assembly`] if finalization failed; the session is
    ///   left stopped so the call can be retried
    pub fn stop_session(
        &self,
        key: &JobKey,
        reason: StopReason,
    ) -> Result<SessionOutcome, SessionError> {
        let mut registry = self.registry.lock();

        if !registry.active.contains_key(key) {
            return if registry.finalized.contains(key) {
                debug!("Timelapse for '{}' already finalized ({})", key, reason);
                Ok(SessionOutcome::AlreadyFinalized)
            } else {
                Err(SessionError::NotFound(key.clone()))
            };
        }

        info!("Stopping timelapse for '{}': {}", key, reason);
        self.finalize(&mut registry, key)
    }

    /// Drop the session for `key` without assembling a video.
    ///
    /// Captured frames stay on disk. Returns `false` if there was no
    /// non-finalized session for `key` or it is being assembled.
    pub fn abandon_session(&self, key: &JobKey) -> bool {
        let mut entry = {
            let mut registry = self.registry.lock();
            if registry.active.get(key).is_none_or(|entry| entry.finalizing) {
                return false;
            }
            let Some(entry) = registry.active.remove(key) else {
                return false;
            };
            entry
        };

        entry.session.lock().stop();
        if let Some(timer) = entry.timer.take() {
            timer.cancel();
        }

        let session = entry.session.lock();
        warn!(
            "Abandoned timelapse for '{}' with {} frames left in {}",
            key,
            session.frame_count,
            session.frames_dir.display()
        );
        true
    }

    /// Snapshot of the current non-finalized session, if any.
    pub fn active_session(&self) -> Option<TimelapseSession> {
        let registry = self.registry.lock();
        registry
            .active
            .values()
            .next()
            .map(|entry| entry.session.lock().clone())
    }

    /// Whether `key` has been finalized since the most recent session start.
    pub fn is_finalized(&self, key: &JobKey) -> bool {
        self.registry.lock().finalized.contains(key)
    }

    /// Finalize `key`, releasing the registry lock while frames are
    /// assembled. The `finalizing` mark keeps other callers from assembling
    /// the same session meanwhile.
    fn finalize(
        &self,
        registry: &mut MutexGuard<'_, Registry>,
        key: &JobKey,
    ) -> Result<SessionOutcome, SessionError> {
        let Some(entry) = registry.active.get_mut(key) else {
            return Ok(SessionOutcome::AlreadyFinalized);
        };
        if entry.finalizing {
            debug!("Timelapse for '{}' is already being finalized", key);
            return Ok(SessionOutcome::Finalizing);
        }

        entry.finalizing = true;
        entry.session.lock().stop();
        let timer = entry.timer.take();
        let session = Arc::clone(&entry.session);

        let assembled = MutexGuard::unlocked(registry, || {
            if let Some(timer) = timer {
                timer.cancel();
            }
            let snapshot = session.lock().clone();
            self.assemble(&snapshot)
                .map(|artifact| (artifact, snapshot.frame_count))
        });

        let (artifact, frame_count) = match assembled {
            Ok(done) => done,
            Err(e) => {
                if let Some(entry) = registry.active.get_mut(key) {
                    entry.finalizing = false;
                }
                return Err(e);
            }
        };

        session.lock().phase = SessionPhase::Finalized;
        registry.active.remove(key);
        registry.finalized.insert(key.clone());

        match &artifact {
            Some(path) => info!(
                "Timelapse for '{}' finalized: {} frames -> {}",
                key,
                frame_count,
                path.display()
            ),
            None => info!("Timelapse for '{}' finalized without video", key),
        }

        Ok(SessionOutcome::Finalized {
            artifact,
            frames: frame_count,
        })
    }

    fn assemble(&self, session: &TimelapseSession) -> Result<Option<PathBuf>, SessionError> {
        let key = &session.key;
        let format = match session.frame_format {
            Some(format) if session.frame_count > 0 => format,
            _ => {
                warn!("Timelapse for '{}' has no frames, nothing to assemble", key);
                return Ok(None);
            }
        };

        let videos_dir = self.settings.output_dir.join("timelapses");
        fs::create_dir_all(&videos_dir).map_err(|source| SessionError::Io {
            path: videos_dir.clone(),
            source,
        })?;
        let output = videos_dir.join(format!("{}.mp4", session.name));

        self.assembler
            .assemble(
                &session.frames_dir,
                extension_for(format),
                session.frame_count,
                self.settings.fps,
                &output,
            )
            .map_err(|e| {
                error!("Timelapse assembly failed for '{}': {}", key, e);
                SessionError::Assembly {
                    key: key.clone(),
                    reason: e.to_string(),
                }
            })?;
        Ok(Some(output))
    }
}

impl Drop for TimelapseManager {
    fn drop(&mut self) {
        let mut registry = self.registry.lock();
        for (_, mut entry) in registry.active.drain() {
            entry.session.lock().stop();
            if let Some(timer) = entry.timer.take() {
                timer.cancel();
            }
        }
    }
}
